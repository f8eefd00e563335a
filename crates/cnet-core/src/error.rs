//! Error types for cnet.

use thiserror::Error;

/// Result type alias using cnet's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for cnet operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Message broker operation failed
    #[error("Broker error: {0}")]
    Broker(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Dispatch target resolved to nothing (zero rows, empty iterable, empty queue)
    #[error("Empty target: {0}")]
    EmptyTarget(String),

    /// Dispatch target is not a graph collection, database table or iterable
    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    /// Named operation is not available for the target kind
    #[error("Operation '{function}' is not defined for {kind} targets")]
    MissingOperation { function: String, kind: String },

    /// Cluster scheduler rejected or failed a submission
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Background result ingestion failed
    #[error("Ingest error: {0}")]
    Ingest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors caused by the caller's arguments rather than a failing collaborator.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidInput(_)
                | Error::EmptyTarget(_)
                | Error::UnknownTarget(_)
                | Error::MissingOperation { .. }
        )
    }

    /// Failures that may succeed when the same work is retried later.
    ///
    /// Constraint violations, undecodable rows and invalid records fail the
    /// same way every time.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db)) => !matches!(
                db.kind(),
                sqlx::error::ErrorKind::UniqueViolation
                    | sqlx::error::ErrorKind::ForeignKeyViolation
                    | sqlx::error::ErrorKind::NotNullViolation
                    | sqlx::error::ErrorKind::CheckViolation
            ),
            Error::Database(
                sqlx::Error::RowNotFound
                | sqlx::Error::TypeNotFound { .. }
                | sqlx::Error::ColumnIndexOutOfBounds { .. }
                | sqlx::Error::ColumnNotFound(_)
                | sqlx::Error::ColumnDecode { .. }
                | sqlx::Error::Encode(_)
                | sqlx::Error::Decode(_),
            ) => false,
            Error::Database(_)
            | Error::Broker(_)
            | Error::Io(_)
            | Error::Internal(_)
            | Error::Ingest(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Broker(e.to_string())
    }
}
