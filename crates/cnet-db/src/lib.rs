//! # cnet-db
//!
//! PostgreSQL access for cnet: connection pools with retry, row-id resolution
//! for database dispatch targets, and bulk `COPY` writes of worker results.

pub mod csv;
pub mod pool;
pub mod rows;
pub mod sink;

pub use pool::{
    connect, connect_with_retry, create_pool_with_config, log_pool_metrics, retry_with_backoff,
    PoolConfig, RetryPolicy,
};
pub use rows::{build_id_query, table_for, PgRowSource, QueryParam};
pub use sink::{rectangular_srid, PgResultSink};

pub use sqlx::PgPool;
