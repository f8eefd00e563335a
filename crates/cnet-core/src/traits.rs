//! Core traits for cnet's external collaborators.
//!
//! These traits define the interfaces that concrete implementations
//! must satisfy: the message broker, the relational store (as a source of
//! dispatch targets and a sink for results), the image graph and the
//! cluster batch scheduler.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::models::{ImagePath, ObjectId, TargetKind, Walltime};
use crate::records::{MeasureRecord, PointRecord};

// =============================================================================
// BROKER
// =============================================================================

/// Key-value broker holding FIFO lists and atomic integer counters.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append messages to the tail of a list in one pipelined write, in order.
    async fn push_batch(&self, queue: &str, messages: &[String]) -> Result<()>;

    /// Put messages back at the head of a list so that `messages[0]` is popped next.
    async fn push_front(&self, queue: &str, messages: &[String]) -> Result<()>;

    /// Remove and return the oldest message.
    async fn pop(&self, queue: &str) -> Result<Option<String>>;

    /// Remove and return up to `max` of the oldest messages, oldest first.
    async fn pop_many(&self, queue: &str, max: usize) -> Result<Vec<String>>;

    /// Number of messages in a list.
    async fn len(&self, queue: &str) -> Result<usize>;

    /// Delete keys (lists or counters).
    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// Create a counter at zero unless it exists. Returns whether it was created.
    async fn init_counter(&self, key: &str) -> Result<bool>;

    /// Atomically add to a counter, returning the new value.
    async fn incr_counter(&self, key: &str, by: u64) -> Result<i64>;

    /// Current counter value, `None` when the key is absent.
    async fn counter(&self, key: &str) -> Result<Option<i64>>;
}

// =============================================================================
// RELATIONAL STORE
// =============================================================================

/// How the rows of a dispatch target are chosen.
#[derive(Debug, Clone, PartialEq)]
pub enum RowSelection {
    /// Every row of the table.
    All,
    /// Rows whose columns equal the given values.
    Filters(BTreeMap<String, JsonValue>),
    /// A raw SQL query whose result has an `id` column.
    Query(String),
}

/// Relational store queried for the row ids of a dispatch target.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Resolve the ids of the selected rows of the table backing `kind`,
    /// ordered by id for filter selections.
    ///
    /// Implementations release their connection before returning.
    async fn row_ids(&self, kind: TargetKind, selection: &RowSelection) -> Result<Vec<i64>>;
}

/// Relational store receiving worker results in bulk.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Insert points and their measures. Returns the number of points written.
    async fn insert_points(&self, points: &[PointRecord]) -> Result<u64>;

    /// Apply measure updates by id. Returns the number of measures written.
    async fn update_measures(&self, measures: &[MeasureRecord]) -> Result<u64>;
}

// =============================================================================
// IMAGE GRAPH
// =============================================================================

/// A node or edge of the image graph as seen by the dispatcher.
pub trait GraphObject {
    fn object_id(&self) -> ObjectId;

    /// Ignored objects are skipped by dispatch.
    fn ignore(&self) -> bool {
        false
    }

    fn image_path(&self) -> Option<ImagePath> {
        None
    }
}

/// Snapshot of one graph object.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphElement {
    pub id: ObjectId,
    pub image_path: Option<ImagePath>,
    pub ignore: bool,
}

impl GraphElement {
    pub fn node(id: i64, image_path: impl Into<String>) -> Self {
        Self {
            id: ObjectId::Node(id),
            image_path: Some(ImagePath::Node(image_path.into())),
            ignore: false,
        }
    }

    pub fn edge(source: (i64, &str), destination: (i64, &str)) -> Self {
        Self {
            id: ObjectId::Edge(source.0, destination.0),
            image_path: Some(ImagePath::Edge(
                source.1.to_string(),
                destination.1.to_string(),
            )),
            ignore: false,
        }
    }

    pub fn ignored(mut self) -> Self {
        self.ignore = true;
        self
    }

    pub fn from_object<T: GraphObject + ?Sized>(obj: &T) -> Self {
        Self {
            id: obj.object_id(),
            image_path: obj.image_path(),
            ignore: obj.ignore(),
        }
    }
}

impl GraphObject for GraphElement {
    fn object_id(&self) -> ObjectId {
        self.id
    }

    fn ignore(&self) -> bool {
        self.ignore
    }

    fn image_path(&self) -> Option<ImagePath> {
        self.image_path.clone()
    }
}

/// The image graph whose nodes and edges can be dispatched.
pub trait GraphSource: Send + Sync {
    /// Nodes in iteration order.
    fn nodes(&self) -> Vec<GraphElement>;

    /// Edges in iteration order.
    fn edges(&self) -> Vec<GraphElement>;

    /// Whether an edge or node with this identity exists.
    fn contains(&self, id: ObjectId) -> bool {
        let pool = match id {
            ObjectId::Node(_) => self.nodes(),
            ObjectId::Edge(..) => self.edges(),
        };
        pool.iter().any(|e| e.id == id)
    }
}

// =============================================================================
// BATCH SCHEDULER
// =============================================================================

/// Array-job sizing: `size` elements, at most `concurrency` running at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArraySpec {
    pub size: usize,
    pub concurrency: usize,
}

/// One batch-scheduler submission.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchScript {
    pub job_name: String,
    pub partition: String,
    /// Memory per CPU in megabytes.
    pub mem_per_cpu: u32,
    pub time: Walltime,
    /// Log path template; `%j` is replaced by the scheduler's job id.
    pub output: String,
    /// Fixed-task mode when set.
    pub ntasks: Option<u32>,
    /// Array mode when set.
    pub array: Option<ArraySpec>,
    /// Comma-separated nodes the job must not run on.
    pub exclude: Option<String>,
    /// Shell command each task runs.
    pub command: String,
}

/// External batch scheduler that launches queue-draining workers.
#[async_trait]
pub trait ClusterScheduler: Send + Sync {
    /// Submit one job, returning the scheduler's job handle.
    async fn submit(&self, script: &BatchScript) -> Result<String>;
}
