//! Async ingest workers that drain the result queues into the database.
//!
//! One worker per result queue. Each pops a batch of worker results, writes
//! it with a single bulk call on the [`ResultSink`] and advances the paired
//! counter by the number of rows written. Messages that can never be written
//! are dropped. When the sink refuses a whole batch its records are retried
//! one at a time so only the offending messages are lost. Transient failures
//! put the unwritten messages back at the head of the queue.
//!
//! Shutdown is cooperative: the signal is observed between batches, so a batch
//! already popped is always written (or returned to the queue) before the loop
//! exits.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use cnet_core::defaults::{
    EVENT_BUS_CAPACITY, INGEST_BATCH_SIZE, INGEST_MAX_CONSECUTIVE_FAILURES,
    INGEST_POLL_INTERVAL_MS,
};
use cnet_core::{decode, Error, MeasureRecord, PointRecord, Result, ResultSink};
use cnet_queue::TaskQueue;

/// Which result queue a worker drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IngestKind {
    PointInsert,
    MeasureUpdate,
}

impl IngestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestKind::PointInsert => "point_insert",
            IngestKind::MeasureUpdate => "measure_update",
        }
    }

    fn queue_and_counter(&self, queue: &TaskQueue) -> (String, String) {
        let names = queue.names();
        match self {
            IngestKind::PointInsert => (
                names.point_insert.clone(),
                names.point_insert_counter.clone(),
            ),
            IngestKind::MeasureUpdate => (
                names.measure_update.clone(),
                names.measure_update_counter.clone(),
            ),
        }
    }
}

impl fmt::Display for IngestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for the ingest workers.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Whether `start` spawns the workers at all.
    pub enabled: bool,
    /// Sleep between polls of an empty queue; also bounds shutdown latency.
    pub poll_interval_ms: u64,
    /// Maximum messages written per bulk call.
    pub batch_size: usize,
    /// Consecutive failed batches after which the worker gives up.
    pub max_consecutive_failures: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: INGEST_POLL_INTERVAL_MS,
            batch_size: INGEST_BATCH_SIZE,
            max_consecutive_failures: INGEST_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

impl IngestConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `INGEST_ENABLED` | `true` | Start the ingest workers |
    /// | `INGEST_POLL_INTERVAL_MS` | `500` | Sleep when a result queue is empty |
    /// | `INGEST_BATCH_SIZE` | `1000` | Messages per bulk write |
    /// | `INGEST_MAX_FAILURES` | `5` | Consecutive failed batches before stopping |
    pub fn from_env() -> Self {
        let enabled = std::env::var("INGEST_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let poll_interval_ms = std::env::var("INGEST_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(INGEST_POLL_INTERVAL_MS);

        let batch_size = std::env::var("INGEST_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(INGEST_BATCH_SIZE)
            .max(1);

        let max_consecutive_failures = std::env::var("INGEST_MAX_FAILURES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(INGEST_MAX_CONSECUTIVE_FAILURES)
            .max(1);

        Self {
            enabled,
            poll_interval_ms,
            batch_size,
            max_consecutive_failures,
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    pub fn with_max_failures(mut self, n: u32) -> Self {
        self.max_consecutive_failures = n.max(1);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by an ingest worker.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    WorkerStarted { kind: IngestKind },
    /// A batch was written and the counter advanced to `counter`.
    BatchCommitted {
        kind: IngestKind,
        rows: u64,
        counter: i64,
    },
    /// A batch hit a transient failure; its unwritten messages went back to the
    /// queue head.
    BatchFailed {
        kind: IngestKind,
        error: String,
        consecutive: u32,
    },
    /// A message that can never be written was dropped.
    MessageRejected { kind: IngestKind, error: String },
    WorkerStopped { kind: IngestKind },
}

/// Lifecycle state of an ingest worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestStatus {
    Running,
    Stopped,
    Failed(String),
}

/// Handle for controlling a running ingest worker.
pub struct IngestHandle {
    kind: IngestKind,
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<IngestEvent>,
    status_rx: watch::Receiver<IngestStatus>,
    join: JoinHandle<IngestStatus>,
}

impl IngestHandle {
    pub fn kind(&self) -> IngestKind {
        self.kind
    }

    /// Signal the worker to stop after its current batch.
    pub async fn shutdown(&self) -> Result<()> {
        if self.join.is_finished() {
            return Ok(());
        }
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))
    }

    /// Get a receiver for events emitted from now on.
    pub fn events(&self) -> broadcast::Receiver<IngestEvent> {
        self.event_rx.resubscribe()
    }

    pub fn status(&self) -> IngestStatus {
        self.status_rx.borrow().clone()
    }

    /// Wait until the worker leaves [`IngestStatus::Running`], without
    /// consuming the handle.
    pub async fn exited(&self) -> IngestStatus {
        let mut rx = self.status_rx.clone();
        if let Ok(status) = rx.wait_for(|status| *status != IngestStatus::Running).await {
            return status.clone();
        }
        // The worker is gone; its last status is final.
        let status = rx.borrow().clone();
        status
    }

    /// Wait for the worker to exit.
    pub async fn join(self) -> IngestStatus {
        match self.join.await {
            Ok(status) => status,
            Err(e) => IngestStatus::Failed(format!("ingest supervisor aborted: {}", e)),
        }
    }

    /// Signal shutdown and wait for the worker to exit.
    pub async fn stop(self) -> IngestStatus {
        if let Err(e) = self.shutdown().await {
            debug!(kind = %self.kind, error = %e, "Worker already exited");
        }
        self.join().await
    }
}

/// Background loop draining one result queue.
pub struct IngestWorker {
    kind: IngestKind,
    queue: TaskQueue,
    sink: Arc<dyn ResultSink>,
    config: IngestConfig,
    event_tx: broadcast::Sender<IngestEvent>,
}

impl IngestWorker {
    pub fn new(
        kind: IngestKind,
        queue: TaskQueue,
        sink: Arc<dyn ResultSink>,
        config: IngestConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            kind,
            queue,
            sink,
            config,
            event_tx,
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<IngestEvent> {
        self.event_tx.subscribe()
    }

    /// Spawn the loop and return a handle for control.
    ///
    /// The loop runs in its own task under a supervisor task, so a panic is
    /// reported as [`IngestStatus::Failed`] instead of vanishing.
    pub fn start(self) -> IngestHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(IngestStatus::Running);
        let status_tx = Arc::new(status_tx);
        let event_rx = self.event_tx.subscribe();
        let kind = self.kind;

        let loop_status = status_tx.clone();
        let inner = tokio::spawn(async move {
            let status = self.run(shutdown_rx).await;
            loop_status.send_replace(status.clone());
            status
        });

        let join = tokio::spawn(async move {
            match inner.await {
                Ok(status) => status,
                Err(e) => {
                    let status = IngestStatus::Failed(format!("ingest task panicked: {}", e));
                    error!(subsystem = "ingest", kind = %kind, error = %e, "Ingest worker task died");
                    status_tx.send_replace(status.clone());
                    status
                }
            }
        });

        IngestHandle {
            kind,
            shutdown_tx,
            event_rx,
            status_rx,
            join,
        }
    }

    #[instrument(skip(self, shutdown_rx), fields(subsystem = "ingest", kind = %self.kind))]
    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) -> IngestStatus {
        let (queue_name, counter_key) = self.kind.queue_and_counter(&self.queue);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut consecutive_failures = 0u32;

        info!(
            queue = %queue_name,
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "Ingest worker started"
        );
        let _ = self.event_tx.send(IngestEvent::WorkerStarted { kind: self.kind });

        let final_status = loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Ingest worker received shutdown signal");
                break IngestStatus::Stopped;
            }

            let outcome = self.ingest_once(&queue_name, &counter_key).await;
            let idle = match outcome {
                Ok(rows) => {
                    consecutive_failures = 0;
                    rows.is_none()
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!(
                        error = %e,
                        consecutive = consecutive_failures,
                        "Ingest batch failed"
                    );
                    let _ = self.event_tx.send(IngestEvent::BatchFailed {
                        kind: self.kind,
                        error: e.to_string(),
                        consecutive: consecutive_failures,
                    });
                    if consecutive_failures >= self.config.max_consecutive_failures {
                        break IngestStatus::Failed(format!(
                            "{} consecutive failed batches, last error: {}",
                            consecutive_failures, e
                        ));
                    }
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Ingest worker received shutdown signal");
                        break IngestStatus::Stopped;
                    }
                    _ = sleep(poll_interval) => {}
                }
            }
        };

        let _ = self.event_tx.send(IngestEvent::WorkerStopped { kind: self.kind });
        match &final_status {
            IngestStatus::Failed(reason) => error!(%reason, "Ingest worker stopped after failures"),
            _ => info!("Ingest worker stopped"),
        }
        final_status
    }

    /// Pop, decode, write and count one batch.
    ///
    /// Returns `Ok(None)` when the queue was empty. Rows written before a
    /// failure are still counted; the unwritten messages are back at the head
    /// of the queue when an error is returned.
    async fn ingest_once(&self, queue_name: &str, counter_key: &str) -> Result<Option<u64>> {
        let raw = self.queue.pop_many(queue_name, self.config.batch_size).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        let start = Instant::now();

        let outcome = match self.kind {
            IngestKind::PointInsert => self.ingest_batch::<PointRecord>(queue_name, raw).await,
            IngestKind::MeasureUpdate => self.ingest_batch::<MeasureRecord>(queue_name, raw).await,
        };

        if outcome.written > 0 {
            let counter = self.queue.incr_counter(counter_key, outcome.written).await?;
            info!(
                row_count = outcome.written,
                counter,
                duration_ms = start.elapsed().as_millis() as u64,
                "Committed ingest batch"
            );
            let _ = self.event_tx.send(IngestEvent::BatchCommitted {
                kind: self.kind,
                rows: outcome.written,
                counter,
            });
        }

        match outcome.error {
            Some(e) => Err(e),
            None => Ok(Some(outcome.written)),
        }
    }

    async fn ingest_batch<T: IngestRecord>(&self, queue_name: &str, raw: Vec<String>) -> BatchOutcome {
        let (messages, records) = self.decode_batch::<T>(raw);
        if records.is_empty() {
            return BatchOutcome::default();
        }

        match T::write(self.sink.as_ref(), &records).await {
            Ok(written) => BatchOutcome {
                written,
                error: None,
            },
            Err(e) if e.is_transient() => self.requeue(queue_name, &messages, e, 0).await,
            Err(e) if records.len() == 1 => {
                self.reject(&e);
                BatchOutcome::default()
            }
            Err(e) => {
                warn!(
                    error = %e,
                    batch_size = records.len(),
                    "Sink refused batch, writing messages one at a time"
                );
                self.write_each(queue_name, &messages, &records).await
            }
        }
    }

    /// Write records singly so a refused record only costs its own message.
    async fn write_each<T: IngestRecord>(
        &self,
        queue_name: &str,
        messages: &[String],
        records: &[T],
    ) -> BatchOutcome {
        let mut written = 0;
        for (index, record) in records.iter().enumerate() {
            match T::write(self.sink.as_ref(), std::slice::from_ref(record)).await {
                Ok(rows) => written += rows,
                Err(e) if e.is_transient() => {
                    return self
                        .requeue(queue_name, &messages[index..], e, written)
                        .await;
                }
                Err(e) => self.reject(&e),
            }
        }
        BatchOutcome {
            written,
            error: None,
        }
    }

    async fn requeue(
        &self,
        queue_name: &str,
        pending: &[String],
        cause: Error,
        written: u64,
    ) -> BatchOutcome {
        if let Err(requeue_err) = self.queue.requeue_front(queue_name, pending).await {
            error!(
                error = %requeue_err,
                lost = pending.len(),
                "Failed to return batch to queue"
            );
        }
        BatchOutcome {
            written,
            error: Some(Error::Ingest(format!(
                "{} write of {} messages failed: {}",
                self.kind,
                pending.len(),
                cause
            ))),
        }
    }

    fn decode_batch<T: IngestRecord>(&self, raw: Vec<String>) -> (Vec<String>, Vec<T>) {
        let mut accepted = Vec::with_capacity(raw.len());
        let mut records = Vec::with_capacity(raw.len());
        for message in raw {
            match decode::<T>(&message).and_then(|record| record.check().map(|_| record)) {
                Ok(record) => {
                    records.push(record);
                    accepted.push(message);
                }
                Err(e) => self.reject(&e),
            }
        }
        (accepted, records)
    }

    fn reject(&self, e: &Error) {
        warn!(error = %e, "Dropping result message");
        let _ = self.event_tx.send(IngestEvent::MessageRejected {
            kind: self.kind,
            error: e.to_string(),
        });
    }
}

/// A result document one of the workers drains.
#[async_trait]
trait IngestRecord: DeserializeOwned + Send + Sync + Sized {
    /// Refuse a record that no write could ever accept.
    fn check(&self) -> Result<()>;

    async fn write(sink: &dyn ResultSink, records: &[Self]) -> Result<u64>;
}

#[async_trait]
impl IngestRecord for PointRecord {
    fn check(&self) -> Result<()> {
        self.validate()
    }

    async fn write(sink: &dyn ResultSink, records: &[Self]) -> Result<u64> {
        sink.insert_points(records).await
    }
}

#[async_trait]
impl IngestRecord for MeasureRecord {
    fn check(&self) -> Result<()> {
        self.validate_update()
    }

    async fn write(sink: &dyn ResultSink, records: &[Self]) -> Result<u64> {
        sink.update_measures(records).await
    }
}

/// What became of one popped batch.
#[derive(Default)]
struct BatchOutcome {
    written: u64,
    /// Set when unwritten messages were returned to the queue.
    error: Option<Error>,
}

/// Start both ingest workers on a shared queue handle and sink.
pub fn start_workers(
    queue: &TaskQueue,
    sink: Arc<dyn ResultSink>,
    config: &IngestConfig,
) -> Vec<IngestHandle> {
    [IngestKind::PointInsert, IngestKind::MeasureUpdate]
        .into_iter()
        .map(|kind| IngestWorker::new(kind, queue.clone(), sink.clone(), config.clone()).start())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cnet_queue::MemoryBroker;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::{Mutex, Notify};

    #[derive(Default)]
    struct Sink {
        points: Mutex<Vec<PointRecord>>,
        measures: Mutex<Vec<MeasureRecord>>,
        failures_left: AtomicU32,
        panic: bool,
        /// Measure updates touching this image are refused as invalid.
        refused_image: Option<i64>,
    }

    #[async_trait]
    impl ResultSink for Sink {
        async fn insert_points(&self, points: &[PointRecord]) -> Result<u64> {
            if self.panic {
                panic!("sink exploded");
            }
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Internal("connection reset".into()));
            }
            self.points.lock().await.extend_from_slice(points);
            Ok(points.len() as u64)
        }

        async fn update_measures(&self, measures: &[MeasureRecord]) -> Result<u64> {
            if let Some(bad) = measures.iter().find(|m| Some(m.imageid) == self.refused_image) {
                return Err(Error::InvalidInput(format!("image {} is not in the network", bad.imageid)));
            }
            self.measures.lock().await.extend_from_slice(measures);
            Ok(measures.len() as u64)
        }
    }

    /// Sink that holds every point insert until released.
    #[derive(Default)]
    struct GatedSink {
        entered: Notify,
        release: Notify,
        points: Mutex<Vec<PointRecord>>,
    }

    #[async_trait]
    impl ResultSink for GatedSink {
        async fn insert_points(&self, points: &[PointRecord]) -> Result<u64> {
            self.entered.notify_one();
            self.release.notified().await;
            self.points.lock().await.extend_from_slice(points);
            Ok(points.len() as u64)
        }

        async fn update_measures(&self, measures: &[MeasureRecord]) -> Result<u64> {
            Ok(measures.len() as u64)
        }
    }

    fn point_json(identifier: &str) -> String {
        format!(r#"{{"pointtype": 2, "identifier": "{}"}}"#, identifier)
    }

    fn measure_json(id: i64) -> String {
        format!(
            r#"{{"id": {}, "imageid": 1, "serial": "S", "measuretype": 3, "sample": 1.0, "line": 2.0}}"#,
            id
        )
    }

    fn measure_on_image(id: i64, imageid: i64) -> String {
        format!(
            r#"{{"id": {}, "imageid": {}, "serial": "S", "measuretype": 3, "sample": 1.0, "line": 2.0}}"#,
            id, imageid
        )
    }

    fn setup() -> TaskQueue {
        TaskQueue::new(Arc::new(MemoryBroker::new()), "ing")
    }

    fn fast() -> IngestConfig {
        IngestConfig::default().with_poll_interval(10)
    }

    async fn wait_for<F: Fn(&IngestEvent) -> bool>(
        events: &mut broadcast::Receiver<IngestEvent>,
        pred: F,
    ) -> IngestEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(event) = events.recv().await {
                    if pred(&event) {
                        return event;
                    }
                }
            }
        })
        .await
        .expect("event not observed")
    }

    #[test]
    fn test_config_defaults() {
        let config = IngestConfig::default();
        assert!(config.enabled);
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.max_consecutive_failures, 5);
        assert_eq!(IngestConfig::default().with_batch_size(0).batch_size, 1);
    }

    #[tokio::test]
    async fn test_points_are_written_and_counted() {
        let queue = setup();
        queue.init_counters().await.unwrap();
        let msgs: Vec<String> = (0..3).map(|i| point_json(&format!("p{}", i))).collect();
        queue.push_batch(&queue.names().point_insert, &msgs).await.unwrap();

        let sink = Arc::new(Sink::default());
        let worker = IngestWorker::new(IngestKind::PointInsert, queue.clone(), sink.clone(), fast());
        let mut events = worker.events();
        let handle = worker.start();

        let event = wait_for(&mut events, |e| matches!(e, IngestEvent::BatchCommitted { .. })).await;
        assert_eq!(
            event,
            IngestEvent::BatchCommitted {
                kind: IngestKind::PointInsert,
                rows: 3,
                counter: 3
            }
        );
        assert_eq!(handle.stop().await, IngestStatus::Stopped);

        let written = sink.points.lock().await;
        let ids: Vec<_> = written.iter().map(|p| p.identifier.clone().unwrap()).collect();
        assert_eq!(ids, vec!["p0", "p1", "p2"]);
        assert_eq!(queue.length(&queue.names().point_insert).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_counter_resumes_from_existing_value() {
        let queue = setup();
        let key = queue.names().measure_update_counter.clone();
        queue.incr_counter(&key, 40).await.unwrap();
        queue.init_counters().await.unwrap();
        queue
            .push_batch(&queue.names().measure_update, &[measure_json(1), measure_json(2)])
            .await
            .unwrap();

        let worker = IngestWorker::new(
            IngestKind::MeasureUpdate,
            queue.clone(),
            Arc::new(Sink::default()),
            fast(),
        );
        let mut events = worker.events();
        let handle = worker.start();
        wait_for(&mut events, |e| matches!(e, IngestEvent::BatchCommitted { .. })).await;
        handle.stop().await;

        assert_eq!(queue.counter(&key).await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_failed_batch_is_requeued_and_retried() {
        let queue = setup();
        queue
            .push_batch(&queue.names().point_insert, &[point_json("a"), point_json("b")])
            .await
            .unwrap();
        let sink = Arc::new(Sink {
            failures_left: AtomicU32::new(1),
            ..Default::default()
        });

        let worker = IngestWorker::new(IngestKind::PointInsert, queue.clone(), sink.clone(), fast());
        let mut events = worker.events();
        let handle = worker.start();

        let failed = wait_for(&mut events, |e| matches!(e, IngestEvent::BatchFailed { .. })).await;
        assert!(matches!(failed, IngestEvent::BatchFailed { consecutive: 1, .. }));
        wait_for(&mut events, |e| matches!(e, IngestEvent::BatchCommitted { .. })).await;
        handle.stop().await;

        let written = sink.points.lock().await;
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].identifier.as_deref(), Some("a"));
        assert_eq!(
            queue.counter(&queue.names().point_insert_counter).await.unwrap(),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_persistent_failure_marks_worker_failed() {
        let queue = setup();
        queue
            .push_batch(&queue.names().point_insert, &[point_json("a")])
            .await
            .unwrap();
        let sink = Arc::new(Sink {
            failures_left: AtomicU32::new(u32::MAX),
            ..Default::default()
        });

        let handle = IngestWorker::new(
            IngestKind::PointInsert,
            queue.clone(),
            sink,
            fast().with_max_failures(3),
        )
        .start();

        let status = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap();
        match status {
            IngestStatus::Failed(reason) => assert!(reason.starts_with("3 consecutive")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(queue.length(&queue.names().point_insert).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_exited_reports_failure_while_handle_is_kept() {
        let queue = setup();
        queue
            .push_batch(&queue.names().point_insert, &[point_json("a")])
            .await
            .unwrap();
        let sink = Arc::new(Sink {
            failures_left: AtomicU32::new(u32::MAX),
            ..Default::default()
        });
        let handle =
            IngestWorker::new(IngestKind::PointInsert, queue, sink, fast().with_max_failures(2))
                .start();

        let status = tokio::time::timeout(Duration::from_secs(5), handle.exited())
            .await
            .unwrap();
        assert!(matches!(status, IngestStatus::Failed(ref r) if r.starts_with("2 consecutive")));
        assert_eq!(handle.status(), status);
        assert_eq!(handle.stop().await, status);
    }

    #[tokio::test]
    async fn test_panic_is_reported_as_failed() {
        let queue = setup();
        queue
            .push_batch(&queue.names().point_insert, &[point_json("a")])
            .await
            .unwrap();
        let sink = Arc::new(Sink {
            panic: true,
            ..Default::default()
        });

        let handle = IngestWorker::new(IngestKind::PointInsert, queue, sink, fast()).start();
        let status = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap();
        assert!(matches!(status, IngestStatus::Failed(r) if r.contains("panicked")));
    }

    #[tokio::test]
    async fn test_undecodable_messages_are_dropped() {
        let queue = setup();
        queue
            .push_batch(
                &queue.names().point_insert,
                &["not json".to_string(), point_json("ok")],
            )
            .await
            .unwrap();
        let sink = Arc::new(Sink::default());
        let worker = IngestWorker::new(IngestKind::PointInsert, queue.clone(), sink.clone(), fast());
        let mut events = worker.events();
        let handle = worker.start();

        wait_for(&mut events, |e| matches!(e, IngestEvent::MessageRejected { .. })).await;
        let committed = wait_for(&mut events, |e| matches!(e, IngestEvent::BatchCommitted { .. })).await;
        assert!(matches!(committed, IngestEvent::BatchCommitted { rows: 1, .. }));
        handle.stop().await;
        assert_eq!(sink.points.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_while_idle_is_prompt() {
        let queue = setup();
        let handle = IngestWorker::new(
            IngestKind::MeasureUpdate,
            queue,
            Arc::new(Sink::default()),
            IngestConfig::default().with_poll_interval(60_000),
        )
        .start();
        assert_eq!(handle.status(), IngestStatus::Running);

        let status = tokio::time::timeout(Duration::from_secs(2), handle.stop())
            .await
            .unwrap();
        assert_eq!(status, IngestStatus::Stopped);
    }

    #[tokio::test]
    async fn test_measure_without_id_does_not_block_queue() {
        for batch_size in [1, INGEST_BATCH_SIZE] {
            let queue = setup();
            let names = queue.names().clone();
            let no_id =
                r#"{"imageid": 1, "serial": "S", "measuretype": 3, "sample": 1.0, "line": 2.0}"#;
            queue
                .push_batch(&names.measure_update, &[no_id.to_string(), measure_json(7)])
                .await
                .unwrap();

            let sink = Arc::new(Sink::default());
            let worker = IngestWorker::new(
                IngestKind::MeasureUpdate,
                queue.clone(),
                sink.clone(),
                fast().with_batch_size(batch_size),
            );
            let mut events = worker.events();
            let handle = worker.start();

            let rejected =
                wait_for(&mut events, |e| matches!(e, IngestEvent::MessageRejected { .. })).await;
            assert!(matches!(rejected, IngestEvent::MessageRejected { error, .. } if error.contains("has no id")));
            let committed =
                wait_for(&mut events, |e| matches!(e, IngestEvent::BatchCommitted { .. })).await;
            assert!(matches!(committed, IngestEvent::BatchCommitted { rows: 1, counter: 1, .. }));

            assert_eq!(handle.status(), IngestStatus::Running);
            assert_eq!(queue.length(&names.measure_update).await.unwrap(), 0);
            assert_eq!(handle.stop().await, IngestStatus::Stopped);

            let written = sink.measures.lock().await;
            assert_eq!(written.iter().map(|m| m.id).collect::<Vec<_>>(), vec![Some(7)]);
            assert_eq!(
                queue.counter(&names.measure_update_counter).await.unwrap(),
                Some(1)
            );
        }
    }

    #[tokio::test]
    async fn test_refused_batch_is_written_one_at_a_time() {
        let queue = setup();
        let names = queue.names().clone();
        queue
            .push_batch(
                &names.measure_update,
                &[measure_json(1), measure_on_image(2, 666), measure_json(3)],
            )
            .await
            .unwrap();

        let sink = Arc::new(Sink {
            refused_image: Some(666),
            ..Default::default()
        });
        let worker =
            IngestWorker::new(IngestKind::MeasureUpdate, queue.clone(), sink.clone(), fast());
        let mut events = worker.events();
        let handle = worker.start();

        let committed =
            wait_for(&mut events, |e| matches!(e, IngestEvent::BatchCommitted { .. })).await;
        assert!(matches!(committed, IngestEvent::BatchCommitted { rows: 2, counter: 2, .. }));
        assert_eq!(handle.status(), IngestStatus::Running);
        assert_eq!(handle.stop().await, IngestStatus::Stopped);

        let ids: Vec<_> = sink.measures.lock().await.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![Some(1), Some(3)]);
        assert_eq!(queue.length(&names.measure_update).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_mid_batch_commits_pulled_messages() {
        let queue = setup();
        let names = queue.names().clone();
        let msgs: Vec<String> = (0..3).map(|i| point_json(&format!("p{}", i))).collect();
        queue.push_batch(&names.point_insert, &msgs).await.unwrap();

        let sink = Arc::new(GatedSink::default());
        let handle =
            IngestWorker::new(IngestKind::PointInsert, queue.clone(), sink.clone(), fast()).start();

        tokio::time::timeout(Duration::from_secs(5), sink.entered.notified())
            .await
            .expect("sink never entered");
        handle.shutdown().await.unwrap();
        sink.release.notify_one();

        let status = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap();
        assert_eq!(status, IngestStatus::Stopped);
        assert_eq!(sink.points.lock().await.len(), 3);
        assert_eq!(
            queue.counter(&names.point_insert_counter).await.unwrap(),
            Some(3)
        );
        assert_eq!(queue.length(&names.point_insert).await.unwrap(), 0);
    }
}
