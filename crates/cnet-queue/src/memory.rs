//! In-process broker for tests and single-host runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use cnet_core::{Broker, Error, Result};

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    counters: HashMap<String, i64>,
    batches: HashMap<String, Vec<usize>>,
}

/// Broker holding lists and counters in memory.
///
/// Records the size of every pipelined push so batching can be asserted, and
/// can be told to fail pushes to exercise error paths.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    failing_pushes: AtomicUsize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `push_batch` fail with a broker error.
    pub fn fail_next_pushes(&self, n: usize) {
        self.failing_pushes.store(n, Ordering::SeqCst);
    }

    /// Sizes of the pushes made to a queue, in order.
    pub async fn batch_sizes(&self, queue: &str) -> Vec<usize> {
        let state = self.state.lock().await;
        state.batches.get(queue).cloned().unwrap_or_default()
    }

    /// Copy of a queue's contents, head first.
    pub async fn snapshot(&self, queue: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .lists
            .get(queue)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn take_failure(&self) -> bool {
        self.failing_pushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push_batch(&self, queue: &str, messages: &[String]) -> Result<()> {
        if self.take_failure() {
            return Err(Error::Broker(format!("injected push failure on {}", queue)));
        }
        let mut state = self.state.lock().await;
        state
            .lists
            .entry(queue.to_string())
            .or_default()
            .extend(messages.iter().cloned());
        state
            .batches
            .entry(queue.to_string())
            .or_default()
            .push(messages.len());
        Ok(())
    }

    async fn push_front(&self, queue: &str, messages: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        let list = state.lists.entry(queue.to_string()).or_default();
        for message in messages.iter().rev() {
            list.push_front(message.clone());
        }
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        Ok(state.lists.get_mut(queue).and_then(|l| l.pop_front()))
    }

    async fn pop_many(&self, queue: &str, max: usize) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        let Some(list) = state.lists.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let take = max.min(list.len());
        Ok(list.drain(..take).collect())
    }

    async fn len(&self, queue: &str) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.lists.get(queue).map_or(0, |l| l.len()))
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        for key in keys {
            state.lists.remove(key);
            state.counters.remove(key);
        }
        Ok(())
    }

    async fn init_counter(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.counters.contains_key(key) {
            return Ok(false);
        }
        state.counters.insert(key.to_string(), 0);
        Ok(true)
    }

    async fn incr_counter(&self, key: &str, by: u64) -> Result<i64> {
        let mut state = self.state.lock().await;
        let counter = state.counters.entry(key.to_string()).or_insert(0);
        *counter += by as i64;
        Ok(*counter)
    }

    async fn counter(&self, key: &str) -> Result<Option<i64>> {
        let state = self.state.lock().await;
        Ok(state.counters.get(key).copied())
    }
}
