//! Options of a cluster `apply` call.

use std::collections::BTreeMap;

use serde_json::{Map, Value as JsonValue};

use cnet_core::defaults::{ARRAY_CHUNKSIZE, ARRAY_CONCURRENCY, JOB_NAME, NTASKS};
use cnet_core::{Error, Result, Walltime};

/// Per-call settings for dispatch and submission.
///
/// Unset `log_dir` and `partition` fall back to the run configuration's
/// `cluster.cluster_log_dir` and `cluster.queue`.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Positional arguments forwarded to the operation.
    pub args: Vec<JsonValue>,
    /// Keyword arguments forwarded to the operation.
    pub kwargs: Map<String, JsonValue>,
    pub walltime: Walltime,
    pub job_name: String,
    /// Maximum array elements per scheduler submission.
    pub chunksize: usize,
    /// Maximum array elements running concurrently.
    pub arraychunk: usize,
    /// More than one selects fixed-task mode.
    pub ntasks: u32,
    /// Column equality constraints for row targets.
    pub filters: BTreeMap<String, JsonValue>,
    /// Raw SQL for row targets; takes precedence over `filters`.
    pub query_string: Option<String>,
    /// Resubmit against the already-populated queue instead of dispatching.
    pub reapply: bool,
    pub log_dir: Option<String>,
    pub partition: Option<String>,
    /// Queue the launched workers drain: `processing` or `working`.
    pub target_queue: String,
    pub exclude: Option<String>,
    /// Populate the queue and return the command without submitting.
    pub just_stage: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            kwargs: Map::new(),
            walltime: Walltime::default(),
            job_name: JOB_NAME.to_string(),
            chunksize: ARRAY_CHUNKSIZE,
            arraychunk: ARRAY_CONCURRENCY,
            ntasks: NTASKS,
            filters: BTreeMap::new(),
            query_string: None,
            reapply: false,
            log_dir: None,
            partition: None,
            target_queue: "processing".to_string(),
            exclude: None,
            just_stage: false,
        }
    }
}

impl ApplyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_args(mut self, args: Vec<JsonValue>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, JsonValue>) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Parse and set the walltime (`HH:MM:SS`).
    pub fn with_walltime(mut self, walltime: &str) -> Result<Self> {
        self.walltime = Walltime::new(walltime)?;
        Ok(self)
    }

    pub fn with_job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = name.into();
        self
    }

    pub fn with_chunksize(mut self, n: usize) -> Self {
        self.chunksize = n;
        self
    }

    pub fn with_arraychunk(mut self, n: usize) -> Self {
        self.arraychunk = n;
        self
    }

    pub fn with_ntasks(mut self, n: u32) -> Self {
        self.ntasks = n;
        self
    }

    pub fn with_filter(mut self, column: impl Into<String>, value: JsonValue) -> Self {
        self.filters.insert(column.into(), value);
        self
    }

    pub fn with_query_string(mut self, sql: impl Into<String>) -> Self {
        self.query_string = Some(sql.into());
        self
    }

    pub fn with_reapply(mut self, reapply: bool) -> Self {
        self.reapply = reapply;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<String>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_target_queue(mut self, queue: impl Into<String>) -> Self {
        self.target_queue = queue.into();
        self
    }

    pub fn with_exclude(mut self, nodes: impl Into<String>) -> Self {
        self.exclude = Some(nodes.into());
        self
    }

    pub fn with_just_stage(mut self, just_stage: bool) -> Self {
        self.just_stage = just_stage;
        self
    }

    /// Whether launched workers keep draining until the queue is empty.
    pub fn fixed_task_mode(&self) -> bool {
        self.ntasks > 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunksize == 0 {
            return Err(Error::InvalidInput("chunksize must be at least 1".into()));
        }
        if self.arraychunk == 0 {
            return Err(Error::InvalidInput("arraychunk must be at least 1".into()));
        }
        if self.ntasks == 0 {
            return Err(Error::InvalidInput("ntasks must be at least 1".into()));
        }
        if self.job_name.trim().is_empty() {
            return Err(Error::InvalidInput("jobname must not be empty".into()));
        }
        Ok(())
    }
}
