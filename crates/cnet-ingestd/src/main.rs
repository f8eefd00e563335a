//! cnet-ingestd: drains the point-insert and measure-update result queues of
//! a run into PostgreSQL when the submitting process does not.
//!
//! Usage: `cnet-ingestd <config.yml>` (or `CNET_CONFIG=<config.yml>`).

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cnet_core::RunConfig;
use cnet_db::{log_pool_metrics, rectangular_srid, PgResultSink, PoolConfig, RetryPolicy};
use cnet_jobs::{start_workers, IngestConfig, IngestEvent, IngestStatus};
use cnet_queue::{RedisBroker, TaskQueue};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors
    //   RUST_LOG    - standard env filter (default: "cnet=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cnet=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("cnet-ingestd.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CNET_CONFIG").ok())
        .context("usage: cnet-ingestd <config.yml> (or set CNET_CONFIG)")?;
    let config = RunConfig::from_file(&config_path)
        .with_context(|| format!("loading run configuration from {}", config_path))?;

    let ingest_config = IngestConfig::from_env();
    info!(
        config = %config_path,
        basename = %config.redis.basename,
        poll_interval_ms = ingest_config.poll_interval_ms,
        batch_size = ingest_config.batch_size,
        "Starting cnet-ingestd"
    );

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| config.database.url());
    let pool = cnet_db::connect_with_retry(
        &database_url,
        &PoolConfig::default(),
        RetryPolicy::default(),
    )
    .await
    .context("connecting to the database")?;

    let broker = RedisBroker::connect(&config.redis)
        .await
        .context("connecting to the broker")?;
    let queue = TaskQueue::new(Arc::new(broker), &config.redis.basename);
    queue.init_counters().await?;

    let sink = Arc::new(PgResultSink::new(pool.clone()).with_srid(rectangular_srid(&config)));
    let handles = start_workers(&queue, sink, &ingest_config.with_enabled(true));
    for handle in &handles {
        tokio::spawn(telemetry_mirror(handle.events()));
    }

    let first_exit = futures::future::select_all(handles.iter().map(|h| Box::pin(h.exited())));
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for shutdown signal")?;
            info!("Shutdown signal received, finishing in-flight batches");
        }
        (status, index, _) = first_exit => {
            error!(kind = %handles[index].kind(), ?status, "Ingest worker exited, shutting down");
        }
    }

    let mut failed = false;
    for handle in handles {
        let kind = handle.kind();
        match handle.stop().await {
            IngestStatus::Failed(reason) => {
                error!(%kind, %reason, "Ingest worker had failed");
                failed = true;
            }
            status => info!(%kind, ?status, "Ingest worker stopped"),
        }
    }

    for key in [
        &queue.names().point_insert_counter,
        &queue.names().measure_update_counter,
    ] {
        if let Ok(Some(value)) = queue.counter(key).await {
            info!(counter = %key, value, "Final counter value");
        }
    }
    log_pool_metrics(&pool);
    pool.close().await;

    if failed {
        anyhow::bail!("one or more ingest workers failed");
    }
    Ok(())
}

/// Mirror worker events into the log.
async fn telemetry_mirror(mut rx: broadcast::Receiver<IngestEvent>) {
    loop {
        match rx.recv().await {
            Ok(IngestEvent::BatchFailed {
                kind,
                error,
                consecutive,
            }) => {
                warn!(event = "ingest.batch_failed", %kind, %error, consecutive, "Batch failed");
            }
            Ok(IngestEvent::MessageRejected { kind, error }) => {
                warn!(event = "ingest.rejected", %kind, %error, "Message rejected");
            }
            Ok(IngestEvent::BatchCommitted {
                kind,
                rows,
                counter,
            }) => {
                tracing::debug!(event = "ingest.committed", %kind, rows, counter, "Batch committed");
            }
            Ok(IngestEvent::WorkerStarted { .. }) => {}
            Ok(IngestEvent::WorkerStopped { .. }) => break,
            Err(RecvError::Lagged(n)) => {
                warn!(missed = n, "Telemetry mirror lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
