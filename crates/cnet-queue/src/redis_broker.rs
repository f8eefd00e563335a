//! Redis-backed broker.
//!
//! Queues are Redis lists (RPUSH at the tail, LPOP at the head) and counters
//! are plain integer keys updated with INCRBY. A single multiplexed
//! [`ConnectionManager`] is shared by the dispatcher and the ingest workers,
//! so no blocking commands (BLPOP) are issued on it.

use std::num::NonZeroUsize;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{info, warn};

use cnet_core::{Broker, Error, RedisConfig, Result};

/// Broker backed by a Redis server.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Connect to the configured Redis server.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url().as_str()).map_err(|e| {
            warn!(subsystem = "queue", host = %config.host, error = %e, "Invalid Redis URL");
            Error::from(e)
        })?;
        let conn = ConnectionManager::new(client).await?;
        info!(
            subsystem = "queue",
            host = %config.host,
            port = config.port,
            basename = %config.basename,
            "Connected to Redis broker"
        );
        Ok(Self { conn })
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push_batch(&self, queue: &str, messages: &[String]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        redis::pipe()
            .rpush(queue, messages)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn push_front(&self, queue: &str, messages: &[String]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        // LPUSH inserts each value at the head in turn; reverse so messages[0] ends up first.
        let reversed: Vec<&String> = messages.iter().rev().collect();
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(queue, reversed).await?;
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.lpop(queue, None).await?)
    }

    async fn pop_many(&self, queue: &str, max: usize) -> Result<Vec<String>> {
        let Some(count) = NonZeroUsize::new(max) else {
            return Ok(Vec::new());
        };
        let mut conn = self.conn.clone();
        let popped: Option<Vec<String>> = conn.lpop(queue, Some(count)).await?;
        Ok(popped.unwrap_or_default())
    }

    async fn len(&self, queue: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(queue).await?)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }

    async fn init_counter(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.set_nx(key, 0).await?)
    }

    async fn incr_counter(&self, key: &str, by: u64) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, by).await?)
    }

    async fn counter(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }
}
