//! End-to-end runs of `ClusterGraph` against in-memory collaborators.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use cnet_core::{
    decode_message, BatchScript, ClusterScheduler, Error, FunctionRef, GraphElement,
    MeasureRecord, ObjectId, PointRecord, Result, ResultSink, RowSelection, RowSource, RunConfig,
    TargetId, TargetKind,
};
use cnet_jobs::{
    ApplyOptions, ClusterGraph, IngestConfig, IngestKind, IngestStatus, OperationRegistry,
    StaticGraph, Submission,
};
use cnet_queue::MemoryBroker;

const CONFIG: &str = r#"
redis:
  host: redis.cluster.local
  port: 6380
  basename: flow
cluster:
  queue: longall
  processing_memory: 4000
  cluster_log_dir: /scratch/logs
env:
  conda: autocnet
  ISISROOT: /usgs/isis
  ISISDATA: /usgs/isisdata
database:
  username: cnet
  password: secret
  host: db.cluster.local
  pgbouncer_port: 6432
  name: mars
"#;

#[derive(Default)]
struct RecordingScheduler {
    scripts: Mutex<Vec<BatchScript>>,
    fail: bool,
}

#[async_trait]
impl ClusterScheduler for RecordingScheduler {
    async fn submit(&self, script: &BatchScript) -> Result<String> {
        if self.fail {
            return Err(Error::Scheduler("sbatch: error: invalid partition".into()));
        }
        let mut scripts = self.scripts.lock().unwrap();
        scripts.push(script.clone());
        Ok(format!("{}", 9000 + scripts.len()))
    }
}

struct Rows(Vec<i64>);

#[async_trait]
impl RowSource for Rows {
    async fn row_ids(&self, _kind: TargetKind, _selection: &RowSelection) -> Result<Vec<i64>> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
struct Sink {
    points: Mutex<Vec<PointRecord>>,
    measures: Mutex<Vec<MeasureRecord>>,
}

#[async_trait]
impl ResultSink for Sink {
    async fn insert_points(&self, points: &[PointRecord]) -> Result<u64> {
        self.points.lock().unwrap().extend_from_slice(points);
        Ok(points.len() as u64)
    }

    async fn update_measures(&self, measures: &[MeasureRecord]) -> Result<u64> {
        self.measures.lock().unwrap().extend_from_slice(measures);
        Ok(measures.len() as u64)
    }
}

fn graph() -> Arc<StaticGraph> {
    Arc::new(
        StaticGraph::new()
            .with(GraphElement::node(0, "/data/a.cub"))
            .with(GraphElement::node(1, "/data/b.cub"))
            .with(GraphElement::node(2, "/data/c.cub").ignored())
            .with(GraphElement::edge((0, "/data/a.cub"), (1, "/data/b.cub")))
            .with(GraphElement::edge((1, "/data/b.cub"), (2, "/data/c.cub"))),
    )
}

fn registry() -> OperationRegistry {
    OperationRegistry::new()
        .with("subpixel_register", &[TargetKind::Edge])
        .with("extract_features", &[TargetKind::Node])
}

async fn cluster(
    broker: Arc<MemoryBroker>,
    scheduler: Arc<RecordingScheduler>,
) -> ClusterGraph {
    ClusterGraph::builder(RunConfig::from_yaml_str(CONFIG).unwrap())
        .broker(broker)
        .scheduler(scheduler)
        .graph(graph())
        .rows(Arc::new(Rows(vec![11, 12, 13])))
        .registry(registry())
        .build()
        .await
        .unwrap()
}

async fn wait_for_counter(cluster: &ClusterGraph, key: &str, expected: i64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if cluster.queue().counter(key).await.unwrap() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("counter never reached expected value");
}

#[tokio::test]
async fn test_apply_on_edges_dispatches_and_submits() {
    let broker = Arc::new(MemoryBroker::new());
    let scheduler = Arc::new(RecordingScheduler::default());
    let cluster = cluster(broker.clone(), scheduler.clone()).await;

    let submission = cluster
        .apply_on(
            &FunctionRef::named("subpixel_register"),
            "edges",
            &ApplyOptions::new().with_walltime("02:00:00").unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        submission,
        Submission::Submitted {
            job_ids: vec!["9001".into()],
            job_count: 2
        }
    );
    assert_eq!(cluster.queue_length().await.unwrap(), 2);

    let queued = broker.snapshot("flow:processing").await;
    let first = decode_message(&queued[0]).unwrap();
    assert_eq!(first.id, TargetId::Edge(0, 1));
    assert_eq!(first.along, TargetKind::Edge);
    assert_eq!(first.walltime.as_str(), "02:00:00");
    assert_eq!(first.config["redis"]["basename"], "flow");

    let scripts = scheduler.scripts.lock().unwrap();
    assert_eq!(scripts.len(), 1);
    let script = &scripts[0];
    assert_eq!(script.partition, "longall");
    assert_eq!(script.mem_per_cpu, 4000);
    assert_eq!(script.output, "/scratch/logs/cnet.subpixel_register-%j");
    assert_eq!(script.array.map(|a| (a.size, a.concurrency)), Some((2, 25)));
    assert!(script
        .command
        .ends_with("srun acn_submit -r=redis.cluster.local -p=6380 flow:processing flow:working"));
}

#[tokio::test]
async fn test_missing_node_operation_queues_and_submits_nothing() {
    let broker = Arc::new(MemoryBroker::new());
    let scheduler = Arc::new(RecordingScheduler::default());
    let cluster = cluster(broker, scheduler.clone()).await;

    let err = cluster
        .apply_on(
            &FunctionRef::named("subpixel_register"),
            "nodes",
            &ApplyOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MissingOperation { .. }));
    assert_eq!(cluster.queue_length().await.unwrap(), 0);
    assert!(scheduler.scripts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_just_stage_then_reapply() {
    let broker = Arc::new(MemoryBroker::new());
    let scheduler = Arc::new(RecordingScheduler::default());
    let cluster = cluster(broker, scheduler.clone()).await;
    let function = FunctionRef::named("spatial.overlap.place_points_in_overlap");

    let staged = cluster
        .apply_on(
            &function,
            "overlaps",
            &ApplyOptions::new().with_just_stage(true),
        )
        .await
        .unwrap();
    match staged {
        Submission::Staged { command, job_count } => {
            assert_eq!(job_count, 3);
            assert!(command.starts_with("conda activate autocnet && export ISISROOT=/usgs/isis"));
        }
        other => panic!("expected staged submission, got {:?}", other),
    }
    assert!(scheduler.scripts.lock().unwrap().is_empty());
    assert_eq!(cluster.queue_length().await.unwrap(), 3);

    let resubmitted = cluster
        .apply_on(&function, "overlaps", &ApplyOptions::new().with_reapply(true))
        .await
        .unwrap();
    assert_eq!(resubmitted.job_count(), 3);
    // Reapply reuses the queued messages instead of dispatching again.
    assert_eq!(cluster.queue_length().await.unwrap(), 3);
    assert_eq!(scheduler.scripts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_scheduler_failure_leaves_queue_for_reapply() {
    let broker = Arc::new(MemoryBroker::new());
    let scheduler = Arc::new(RecordingScheduler {
        fail: true,
        ..Default::default()
    });
    let cluster = cluster(broker, scheduler).await;

    let err = cluster
        .apply_items(
            &FunctionRef::named("tile"),
            vec![json!(1), json!(2)],
            &ApplyOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Scheduler error: sbatch: error: invalid partition");
    assert_eq!(cluster.queue_length().await.unwrap(), 2);
}

#[tokio::test]
async fn test_bad_target_queue_queues_nothing() {
    let broker = Arc::new(MemoryBroker::new());
    let scheduler = Arc::new(RecordingScheduler::default());
    let cluster = cluster(broker, scheduler.clone()).await;

    let err = cluster
        .apply_items(
            &FunctionRef::named("tile"),
            vec![json!(1), json!(2), json!(3)],
            &ApplyOptions::new().with_target_queue("completed"),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidInput(_)));
    assert_eq!(cluster.queue_length().await.unwrap(), 0);
    assert!(scheduler.scripts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_fixed_task_mode_drains_working_queue() {
    let broker = Arc::new(MemoryBroker::new());
    let scheduler = Arc::new(RecordingScheduler::default());
    let cluster = cluster(broker, scheduler.clone()).await;

    cluster
        .apply_items(
            &FunctionRef::named("tile"),
            (0..5).map(|i| json!(i)).collect(),
            &ApplyOptions::new()
                .with_ntasks(4)
                .with_target_queue("working")
                .with_partition("gpu"),
        )
        .await
        .unwrap();

    let scripts = scheduler.scripts.lock().unwrap();
    assert_eq!(scripts.len(), 1);
    assert_eq!(scripts[0].ntasks, Some(4));
    assert!(scripts[0].array.is_none());
    assert_eq!(scripts[0].partition, "gpu");
    assert!(scripts[0]
        .command
        .ends_with("flow:working flow:working --queue"));
}

#[tokio::test]
async fn test_async_watchers_ingest_and_count() {
    let broker = Arc::new(MemoryBroker::new());
    let sink = Arc::new(Sink::default());
    let cluster = ClusterGraph::builder(RunConfig::from_yaml_str(CONFIG).unwrap())
        .broker(broker)
        .scheduler(Arc::new(RecordingScheduler::default()))
        .sink(sink.clone())
        .ingest_config(IngestConfig::default().with_poll_interval(10))
        .async_watchers(true)
        .build()
        .await
        .unwrap();

    let names = cluster.queue().names().clone();
    let points: Vec<String> = (0..4)
        .map(|i| format!(r#"{{"pointtype": 2, "identifier": "p{}"}}"#, i))
        .collect();
    let measures = vec![
        r#"{"id": 7, "imageid": 1, "serial": "S1", "measuretype": 3, "sample": 1.5, "line": 2.5}"#
            .to_string(),
    ];
    cluster.queue().push_batch(&names.point_insert, &points).await.unwrap();
    cluster.queue().push_batch(&names.measure_update, &measures).await.unwrap();

    wait_for_counter(&cluster, &names.point_insert_counter, 4).await;
    wait_for_counter(&cluster, &names.measure_update_counter, 1).await;

    let running = cluster.watcher_status().await;
    assert_eq!(running.len(), 2);
    assert!(running.iter().all(|(_, s)| *s == IngestStatus::Running));

    let stopped = tokio::time::timeout(Duration::from_secs(2), cluster.shutdown())
        .await
        .unwrap();
    assert_eq!(stopped.len(), 2);
    assert!(stopped
        .iter()
        .any(|(k, s)| *k == IngestKind::MeasureUpdate && *s == IngestStatus::Stopped));
    assert_eq!(sink.points.lock().unwrap().len(), 4);
    assert_eq!(sink.measures.lock().unwrap()[0].id, Some(7));
}

#[tokio::test]
async fn test_restart_keeps_counters() {
    let broker = Arc::new(MemoryBroker::new());
    let first = cluster(broker.clone(), Arc::new(RecordingScheduler::default())).await;
    let key = first.queue().names().point_insert_counter.clone();
    first.queue().incr_counter(&key, 17).await.unwrap();
    drop(first);

    let second = cluster(broker, Arc::new(RecordingScheduler::default())).await;
    assert_eq!(second.queue().counter(&key).await.unwrap(), Some(17));
}

#[tokio::test]
async fn test_clear_queues_resets_everything() {
    let broker = Arc::new(MemoryBroker::new());
    let cluster = cluster(broker, Arc::new(RecordingScheduler::default())).await;
    let names = cluster.queue().names().clone();

    cluster
        .apply_on(
            &FunctionRef::named("extract_features"),
            "nodes",
            &ApplyOptions::new().with_just_stage(true),
        )
        .await
        .unwrap();
    cluster.queue().incr_counter(&names.measure_update_counter, 3).await.unwrap();

    cluster.clear_queues().await.unwrap();
    assert_eq!(cluster.queue_length().await.unwrap(), 0);
    assert_eq!(
        cluster.queue().counter(&names.measure_update_counter).await.unwrap(),
        Some(0)
    );
}

#[tokio::test]
async fn test_completion_reports_feed_status() {
    let broker = Arc::new(MemoryBroker::new());
    let cluster = cluster(broker, Arc::new(RecordingScheduler::default())).await;
    let completed = cluster.queue().names().completed.clone();

    cluster
        .queue()
        .push_batch(
            &completed,
            &[
                r#"{"id": [0, 1], "func": "subpixel_register", "success": false}"#.to_string(),
                r#"{"id": [0, 1], "func": "subpixel_register", "success": true}"#.to_string(),
                r#"{"id": [1, 2], "func": "subpixel_register", "success": false}"#.to_string(),
            ],
        )
        .await
        .unwrap();

    assert_eq!(cluster.drain_completed().await.unwrap(), 3);
    assert_eq!(
        cluster.status().failures("subpixel_register").await,
        vec![ObjectId::Edge(1, 2)]
    );
    assert!(cluster
        .status()
        .get(ObjectId::Edge(0, 1), "subpixel_register")
        .await
        .unwrap()
        .success);
}
