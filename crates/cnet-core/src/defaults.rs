//! Centralized default constants for cnet.
//!
//! Every crate references these instead of defining its own magic numbers.
//! Organized by domain area.

// =============================================================================
// QUEUES
// =============================================================================

/// Maximum number of messages written to the broker in one pipelined batch.
///
/// The broker rejects single writes above 512 MB; flushing every 1000 messages
/// keeps batches well below that regardless of payload size.
pub const QUEUE_BATCH_LIMIT: usize = 1000;

/// Queue name suffixes appended to the configured basename.
pub const PROCESSING_SUFFIX: &str = "processing";
pub const COMPLETED_SUFFIX: &str = "completed";
pub const WORKING_SUFFIX: &str = "working";
pub const POINT_INSERT_QUEUE_SUFFIX: &str = "point_insert_queue";
pub const POINT_INSERT_COUNTER_SUFFIX: &str = "point_insert_counter";
pub const MEASURE_UPDATE_QUEUE_SUFFIX: &str = "measure_update_queue";
pub const MEASURE_UPDATE_COUNTER_SUFFIX: &str = "measure_update_counter";

// =============================================================================
// JOB MESSAGES
// =============================================================================

/// Wall-clock budget when the caller does not supply one.
pub const WALLTIME: &str = "01:00:00";

/// Parameter step carried by every message (reserved for chunked jobs).
pub const PARAM_STEP: u32 = 1;

/// Current run configuration schema version.
pub const CONFIG_VERSION: u32 = 1;

// =============================================================================
// CLUSTER SUBMISSION
// =============================================================================

/// Scheduler job name.
pub const JOB_NAME: &str = "CNet";

/// Maximum array elements per submitted job array.
pub const ARRAY_CHUNKSIZE: usize = 1000;

/// Maximum concurrently running array elements.
pub const ARRAY_CONCURRENCY: usize = 25;

/// Worker count; values above one select fixed-task mode.
pub const NTASKS: u32 = 1;

/// Queue-draining executable launched on cluster nodes.
pub const DRAIN_EXECUTABLE: &str = "acn_submit";

/// Batch submission command.
pub const SBATCH_BIN: &str = "sbatch";

/// Launcher used inside the batch script.
pub const SRUN_BIN: &str = "srun";

/// Timeout for one scheduler CLI invocation.
pub const SCHEDULER_CMD_TIMEOUT_SECS: u64 = 60;

// =============================================================================
// INGEST WORKERS
// =============================================================================

/// Idle polling interval for ingest workers. Also the worst-case shutdown latency.
pub const INGEST_POLL_INTERVAL_MS: u64 = 500;

/// Maximum result messages pulled per ingest iteration.
pub const INGEST_BATCH_SIZE: usize = 1000;

/// Consecutive failed batches before an ingest worker gives up.
pub const INGEST_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Capacity of the ingest event broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// DATABASE
// =============================================================================

/// Connection attempts made at setup before failing hard.
pub const DB_CONNECT_ATTEMPTS: u32 = 5;

/// Exponent applied to the attempt number to get the backoff in seconds.
pub const DB_BACKOFF_EXPONENT: u32 = 2;

/// Default maximum number of pooled connections.
pub const DB_MAX_CONNECTIONS: u32 = 10;

/// Pool acquire timeout in seconds.
pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 30;
