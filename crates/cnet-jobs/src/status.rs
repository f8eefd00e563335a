//! Per-object job status, fed by worker completion callbacks.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use cnet_core::{decode, CompletionMessage, JobStatus, ObjectId, Result};
use cnet_queue::TaskQueue;

/// Outcome of `function` on each node or edge, last report wins.
#[derive(Debug, Default)]
pub struct StatusTracker {
    statuses: RwLock<HashMap<(ObjectId, String), JobStatus>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completion report.
    ///
    /// A two-element id is an edge, a scalar a node. Failures are kept for the
    /// caller to inspect; nothing is resubmitted here.
    pub async fn record(&self, message: &CompletionMessage) -> Result<()> {
        let id = ObjectId::from_wire(&message.id)?;
        let status = JobStatus {
            success: message.success,
        };
        if !status.success {
            debug!(id = %id, function = %message.func, "Recorded failed job");
        }
        self.statuses
            .write()
            .await
            .insert((id, message.func.clone()), status);
        Ok(())
    }

    pub async fn get(&self, id: ObjectId, function: &str) -> Option<JobStatus> {
        self.statuses
            .read()
            .await
            .get(&(id, function.to_string()))
            .copied()
    }

    /// Objects whose last report for `function` was a failure, sorted.
    pub async fn failures(&self, function: &str) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self
            .statuses
            .read()
            .await
            .iter()
            .filter(|((_, f), status)| f == function && !status.success)
            .map(|((id, _), _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub async fn snapshot(&self) -> HashMap<(ObjectId, String), JobStatus> {
        self.statuses.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.statuses.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.statuses.read().await.is_empty()
    }

    /// Pop every report off the completed queue and record it.
    ///
    /// Reports that cannot be decoded are logged and skipped. Returns the
    /// number recorded.
    pub async fn drain_completed(&self, queue: &TaskQueue) -> Result<usize> {
        let completed = queue.names().completed.clone();
        let mut recorded = 0usize;
        loop {
            let batch = queue.pop_many(&completed, 1000).await?;
            if batch.is_empty() {
                break;
            }
            for raw in batch {
                let outcome = match decode::<CompletionMessage>(&raw) {
                    Ok(message) => self.record(&message).await,
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok(()) => recorded += 1,
                    Err(e) => warn!(queue = %completed, error = %e, "Skipping malformed completion report"),
                }
            }
        }
        info!(queue = %completed, recorded, "Drained completed queue");
        Ok(recorded)
    }
}
