//! `ClusterGraph`: one processing run against the cluster.
//!
//! Owns the queue handle, the dispatcher, the submitter, the status tracker
//! and, when enabled, the two ingest workers. Built once per run; every
//! `apply` call dispatches into the same processing queue.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use cnet_core::{
    Broker, ClusterScheduler, CompletionMessage, Error, FunctionRef, GraphSource, ResultSink,
    Result, RowSource, RunConfig,
};
use cnet_db::{rectangular_srid, PgResultSink, PgRowSource};
use cnet_queue::{RedisBroker, TaskQueue};

use crate::dispatcher::{DispatchTarget, Dispatcher};
use crate::ingest::{start_workers, IngestConfig, IngestHandle, IngestKind, IngestStatus};
use crate::options::ApplyOptions;
use crate::registry::OperationRegistry;
use crate::status::StatusTracker;
use crate::submitter::{ClusterSubmitter, SlurmScheduler, Submission};

/// Collaborators for a [`ClusterGraph`], supplied before setup.
pub struct ClusterGraphBuilder {
    config: RunConfig,
    broker: Option<Arc<dyn Broker>>,
    scheduler: Option<Arc<dyn ClusterScheduler>>,
    graph: Option<Arc<dyn GraphSource>>,
    rows: Option<Arc<dyn RowSource>>,
    sink: Option<Arc<dyn ResultSink>>,
    registry: OperationRegistry,
    ingest: IngestConfig,
}

impl ClusterGraphBuilder {
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn ClusterScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn graph(mut self, graph: Arc<dyn GraphSource>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn rows(mut self, rows: Arc<dyn RowSource>) -> Self {
        self.rows = Some(rows);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn registry(mut self, registry: OperationRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Ingest worker tuning; `enabled` decides whether `build` starts them.
    pub fn ingest_config(mut self, config: IngestConfig) -> Self {
        self.ingest = config;
        self
    }

    pub fn async_watchers(mut self, enabled: bool) -> Self {
        self.ingest.enabled = enabled;
        self
    }

    /// Initialise the counters and start the ingest workers if enabled.
    ///
    /// Existing counters are left untouched so a restarted run keeps counting
    /// from where it stopped.
    pub async fn build(self) -> Result<ClusterGraph> {
        self.config.validate()?;
        let broker = self
            .broker
            .ok_or_else(|| Error::Config("a message broker is required".into()))?;
        let scheduler: Arc<dyn ClusterScheduler> = match self.scheduler {
            Some(s) => s,
            None => Arc::new(SlurmScheduler::default()),
        };
        if self.ingest.enabled && self.sink.is_none() {
            return Err(Error::Config(
                "async watchers are enabled but no result sink is attached".into(),
            ));
        }

        let queue = TaskQueue::new(broker, &self.config.redis.basename);
        queue.init_counters().await?;

        let mut dispatcher = Dispatcher::new(
            queue.clone(),
            self.config.to_json()?,
            Arc::new(self.registry),
        );
        if let Some(graph) = self.graph {
            dispatcher = dispatcher.with_graph(graph);
        }
        if let Some(rows) = self.rows {
            dispatcher = dispatcher.with_rows(rows);
        }

        let cluster = ClusterGraph {
            submitter: ClusterSubmitter::new(self.config.clone(), scheduler),
            config: self.config,
            queue,
            dispatcher,
            status: StatusTracker::new(),
            sink: self.sink,
            ingest: self.ingest,
            watchers: Mutex::new(Vec::new()),
        };
        cluster.start_watchers().await;

        info!(
            subsystem = "cluster",
            basename = %cluster.config.redis.basename,
            async_watchers = cluster.ingest.enabled,
            "Cluster graph ready"
        );
        Ok(cluster)
    }
}

/// Dispatch, submission, ingestion and status for one run.
pub struct ClusterGraph {
    config: RunConfig,
    queue: TaskQueue,
    dispatcher: Dispatcher,
    submitter: ClusterSubmitter,
    status: StatusTracker,
    sink: Option<Arc<dyn ResultSink>>,
    ingest: IngestConfig,
    watchers: Mutex<Vec<IngestHandle>>,
}

impl ClusterGraph {
    /// Start from a configuration; collaborators are attached on the builder.
    pub fn builder(config: RunConfig) -> ClusterGraphBuilder {
        ClusterGraphBuilder {
            config,
            broker: None,
            scheduler: None,
            graph: None,
            rows: None,
            sink: None,
            registry: OperationRegistry::new(),
            ingest: IngestConfig::default().with_enabled(false),
        }
    }

    /// Builder wired to Redis, Postgres and Slurm from the configuration.
    ///
    /// The database connection is retried with backoff before failing.
    pub async fn connect(config: RunConfig) -> Result<ClusterGraphBuilder> {
        config.validate()?;
        let broker = RedisBroker::connect(&config.redis).await?;
        let pool = cnet_db::connect(&config.database).await?;
        let srid = rectangular_srid(&config);

        Ok(Self::builder(config)
            .broker(Arc::new(broker))
            .rows(Arc::new(PgRowSource::new(pool.clone())))
            .sink(Arc::new(PgResultSink::new(pool).with_srid(srid))))
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Dispatch `function` over `target` and launch workers for it.
    ///
    /// With `reapply` nothing is dispatched; the job count is the length of
    /// the queue the workers will drain, which must not be empty.
    #[instrument(
        skip(self, function, target, opts),
        fields(subsystem = "cluster", dispatch_id = %Uuid::now_v7(), function = %function.name())
    )]
    pub async fn apply(
        &self,
        function: &FunctionRef,
        target: &DispatchTarget,
        opts: &ApplyOptions,
    ) -> Result<Submission> {
        opts.validate()?;
        // Resolved up front so a bad target queue leaves the queues untouched.
        let drain_queue = self.queue.names().drainable(&opts.target_queue)?;
        let job_count = if opts.reapply {
            let queued = self.queue.length(drain_queue).await?;
            if queued == 0 {
                return Err(Error::EmptyTarget(format!(
                    "reapply requested but {} is empty",
                    drain_queue
                )));
            }
            info!(job_count = queued, queue = %drain_queue, "Reapplying to queued jobs");
            queued
        } else {
            self.dispatcher.dispatch(target, function, opts).await?
        };

        self.submitter.submit(job_count, function.name(), opts).await
    }

    /// [`apply`](Self::apply) with the target named by an `on` string.
    pub async fn apply_on(
        &self,
        function: &FunctionRef,
        on: &str,
        opts: &ApplyOptions,
    ) -> Result<Submission> {
        let target: DispatchTarget = on.parse()?;
        self.apply(function, &target, opts).await
    }

    /// [`apply`](Self::apply) over an arbitrary collection.
    pub async fn apply_items(
        &self,
        function: &FunctionRef,
        items: Vec<JsonValue>,
        opts: &ApplyOptions,
    ) -> Result<Submission> {
        self.apply(function, &DispatchTarget::Items(items), opts).await
    }

    /// Messages left in the processing queue, e.g. by a cancelled cluster run.
    pub async fn queue_length(&self) -> Result<usize> {
        self.queue.processing_length().await
    }

    /// Delete every queue and counter, restarting watchers around the wipe.
    #[instrument(skip(self), fields(subsystem = "cluster"))]
    pub async fn clear_queues(&self) -> Result<()> {
        let mut watchers = self.watchers.lock().await;
        let stopped = stop_all(std::mem::take(&mut *watchers)).await;
        if !stopped.is_empty() {
            info!(stopped = stopped.len(), "Stopped async watchers before clearing");
        }

        self.queue.clear_all().await?;
        self.queue.init_counters().await?;

        if self.ingest.enabled {
            if let Some(sink) = &self.sink {
                *watchers = start_workers(&self.queue, sink.clone(), &self.ingest);
            }
        }
        info!("Cleared all queues");
        Ok(())
    }

    /// Record a worker completion report.
    pub async fn record(&self, message: &CompletionMessage) -> Result<()> {
        self.status.record(message).await
    }

    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    /// Record every report waiting on the completed queue.
    pub async fn drain_completed(&self) -> Result<usize> {
        self.status.drain_completed(&self.queue).await
    }

    /// Current state of each running ingest worker.
    pub async fn watcher_status(&self) -> Vec<(IngestKind, IngestStatus)> {
        self.watchers
            .lock()
            .await
            .iter()
            .map(|h| (h.kind(), h.status()))
            .collect()
    }

    /// Stop the ingest workers; each finishes its in-flight batch first.
    pub async fn shutdown(&self) -> Vec<(IngestKind, IngestStatus)> {
        let handles = std::mem::take(&mut *self.watchers.lock().await);
        let stopped = stop_all(handles).await;
        for (kind, status) in &stopped {
            if let IngestStatus::Failed(reason) = status {
                warn!(subsystem = "cluster", kind = %kind, %reason, "Async watcher had failed");
            }
        }
        info!(subsystem = "cluster", stopped = stopped.len(), "Cluster graph shut down");
        stopped
    }

    async fn start_watchers(&self) {
        if !self.ingest.enabled {
            return;
        }
        if let Some(sink) = &self.sink {
            let handles = start_workers(&self.queue, sink.clone(), &self.ingest);
            *self.watchers.lock().await = handles;
        }
    }
}

async fn stop_all(handles: Vec<IngestHandle>) -> Vec<(IngestKind, IngestStatus)> {
    join_all(handles.into_iter().map(|h| async move {
        let kind = h.kind();
        (kind, h.stop().await)
    }))
    .await
}
