//! # cnet-jobs
//!
//! Cluster job orchestration for cnet.
//!
//! - [`Dispatcher`] turns graph objects, database rows or arbitrary items into
//!   job messages on the processing queue.
//! - [`ClusterSubmitter`] launches Slurm workers that drain that queue.
//! - [`IngestWorker`] drains the point-insert and measure-update result queues
//!   into the database in the background.
//! - [`StatusTracker`] records per-object outcomes reported by the workers.
//! - [`ClusterGraph`] wires them together for one run.
//!
//! ## Example
//!
//! ```rust,ignore
//! use cnet_jobs::{ApplyOptions, ClusterGraph, OperationRegistry};
//! use cnet_core::{FunctionRef, RunConfig, TargetKind};
//!
//! let config = RunConfig::from_file("run.yml")?;
//! let cluster = ClusterGraph::connect(config)
//!     .await?
//!     .graph(graph)
//!     .registry(OperationRegistry::new().with("subpixel_register", &[TargetKind::Edge]))
//!     .async_watchers(true)
//!     .build()
//!     .await?;
//!
//! let submission = cluster
//!     .apply_on(
//!         &FunctionRef::named("subpixel_register"),
//!         "edges",
//!         &ApplyOptions::new().with_walltime("02:00:00")?,
//!     )
//!     .await?;
//! ```

pub mod cluster;
pub mod dispatcher;
pub mod graph;
pub mod ingest;
pub mod options;
pub mod registry;
pub mod status;
pub mod submitter;

pub use cluster::{ClusterGraph, ClusterGraphBuilder};
pub use dispatcher::{DispatchTarget, Dispatcher};
pub use graph::StaticGraph;
pub use ingest::{
    start_workers, IngestConfig, IngestEvent, IngestHandle, IngestKind, IngestStatus,
    IngestWorker,
};
pub use options::ApplyOptions;
pub use registry::OperationRegistry;
pub use status::StatusTracker;
pub use submitter::{parse_job_id, ClusterSubmitter, SlurmScheduler, Submission};
