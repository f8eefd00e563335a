//! Task queue: named FIFO lists and counters on a shared broker.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument};

use cnet_core::defaults::QUEUE_BATCH_LIMIT;
use cnet_core::{Broker, Result};

use crate::names::QueueNames;

/// Handle to the queues and counters of one run.
///
/// Cloning is cheap; clones share the broker connection.
#[derive(Clone)]
pub struct TaskQueue {
    broker: Arc<dyn Broker>,
    names: QueueNames,
    batch_limit: usize,
}

impl TaskQueue {
    pub fn new(broker: Arc<dyn Broker>, basename: &str) -> Self {
        Self {
            broker,
            names: QueueNames::new(basename),
            batch_limit: QUEUE_BATCH_LIMIT,
        }
    }

    pub fn names(&self) -> &QueueNames {
        &self.names
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Append messages preserving order, flushing every `QUEUE_BATCH_LIMIT` messages.
    ///
    /// Returns the number of messages pushed. A broker failure aborts the
    /// remaining batches; batches already flushed stay queued.
    #[instrument(skip(self, messages), fields(subsystem = "queue", op = "push_batch"))]
    pub async fn push_batch(&self, queue: &str, messages: &[String]) -> Result<usize> {
        let start = Instant::now();
        let mut pushed = 0;
        for chunk in messages.chunks(self.batch_limit) {
            self.broker.push_batch(queue, chunk).await?;
            pushed += chunk.len();
            debug!(queue, batch_size = chunk.len(), pushed, "Flushed message batch");
        }
        info!(
            queue,
            job_count = pushed,
            duration_ms = start.elapsed().as_millis() as u64,
            "Pushed messages"
        );
        Ok(pushed)
    }

    /// Remove and return the oldest message.
    pub async fn pop(&self, queue: &str) -> Result<Option<String>> {
        self.broker.pop(queue).await
    }

    /// Remove and return up to `max` of the oldest messages.
    pub async fn pop_many(&self, queue: &str, max: usize) -> Result<Vec<String>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        self.broker.pop_many(queue, max).await
    }

    /// Return messages to the head of a queue in their original order.
    pub async fn requeue_front(&self, queue: &str, messages: &[String]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.broker.push_front(queue, messages).await
    }

    pub async fn length(&self, queue: &str) -> Result<usize> {
        self.broker.len(queue).await
    }

    /// Length of the processing queue, including jobs left over by cancelled cluster runs.
    pub async fn processing_length(&self) -> Result<usize> {
        self.broker.len(&self.names.processing).await
    }

    pub async fn clear(&self, queue: &str) -> Result<()> {
        self.broker.delete(&[queue.to_string()]).await
    }

    /// Delete every queue and counter of the run.
    pub async fn clear_all(&self) -> Result<()> {
        let keys = self.names.all();
        self.broker.delete(&keys).await?;
        info!(subsystem = "queue", basename = %self.names.basename, "Cleared all queues");
        Ok(())
    }

    /// Create both result counters at zero, leaving existing values untouched.
    pub async fn init_counters(&self) -> Result<()> {
        for key in [
            &self.names.point_insert_counter,
            &self.names.measure_update_counter,
        ] {
            let created = self.broker.init_counter(key).await?;
            if created {
                debug!(subsystem = "queue", counter = %key, "Initialized counter at zero");
            } else {
                info!(subsystem = "queue", counter = %key, "Resuming existing counter");
            }
        }
        Ok(())
    }

    pub async fn incr_counter(&self, key: &str, by: u64) -> Result<i64> {
        self.broker.incr_counter(key, by).await
    }

    pub async fn counter(&self, key: &str) -> Result<Option<i64>> {
        self.broker.counter(key).await
    }
}
