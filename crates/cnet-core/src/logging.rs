//! Structured logging field name constants for cnet.
//!
//! All crates use these constants for structured `tracing` fields so log
//! aggregation can query dispatch, submission and ingestion events uniformly.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (setup, submission, shutdown) |
//! | DEBUG | Decision points, batch flushes, config choices |
//! | TRACE | Per-message iteration |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "queue", "db", "jobs", "ingest"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "dispatcher", "submitter", "point_insert", "pool"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "push_batch", "dispatch", "submit", "copy_in"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Fully qualified broker key.
pub const QUEUE: &str = "queue";

/// Operation name carried by a job message.
pub const FUNCTION: &str = "function";

/// Target kind of a dispatch.
pub const TARGET_KIND: &str = "target_kind";

/// Scheduler job id.
pub const SCHEDULER_JOB_ID: &str = "scheduler_job_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Number of messages dispatched or jobs requested.
pub const JOB_COUNT: &str = "job_count";

/// Number of messages in one broker batch.
pub const BATCH_SIZE: &str = "batch_size";

/// Number of database rows read or written.
pub const ROW_COUNT: &str = "row_count";

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

// ─── Database fields ───────────────────────────────────────────────────────

/// Database table affected.
pub const DB_TABLE: &str = "db_table";

/// Connection attempt number.
pub const ATTEMPT: &str = "attempt";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
