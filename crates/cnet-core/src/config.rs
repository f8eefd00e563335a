//! Run configuration.
//!
//! One `RunConfig` describes a whole processing run: the broker the queues
//! live on, the cluster partition and logging location, the environment the
//! remote workers activate, and the database they write to. The full struct is
//! embedded in every job message so that cluster workers never need to reach
//! back to the submitting process.
//!
//! Any top-level section cnet does not interpret itself (for example
//! `spatial`) is preserved in [`RunConfig::extra`] and travels with the message.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use crate::defaults;
use crate::{Error, Result};

fn default_version() -> u32 {
    defaults::CONFIG_VERSION
}

fn default_redis_port() -> u16 {
    6379
}

fn default_pg_port() -> u16 {
    5432
}

/// Broker connection and key namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    /// Prefix for every queue and counter key of this run.
    pub basename: String,
}

impl RedisConfig {
    /// Connection URL for the redis client.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/0", self.host, self.port)
    }
}

/// Batch scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Default partition jobs are submitted to.
    pub queue: String,
    /// Memory per CPU in megabytes.
    pub processing_memory: u32,
    /// Directory the scheduler writes job logs into.
    pub cluster_log_dir: String,
}

/// Runtime environment activated on cluster nodes before the drain executable runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Conda environment name.
    pub conda: String,
    #[serde(rename = "ISISROOT")]
    pub isisroot: String,
    #[serde(rename = "ISISDATA")]
    pub isisdata: String,
}

/// Relational database connection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub username: String,
    pub password: String,
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub pgbouncer_port: u16,
    pub name: String,
}

impl DatabaseConfig {
    /// Connection URL for the pool.
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.pgbouncer_port, self.name
        )
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("username", &self.username)
            .field("password", &"***")
            .field("host", &self.host)
            .field("pgbouncer_port", &self.pgbouncer_port)
            .field("name", &self.name)
            .finish()
    }
}

/// Complete, self-contained configuration of a processing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    pub redis: RedisConfig,
    pub cluster: ClusterConfig,
    pub env: EnvConfig,
    pub database: DatabaseConfig,
    /// Sections consumed only by the dispatched operations.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl RunConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: RunConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Unable to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml_str(&raw)?;
        debug!(
            subsystem = "config",
            path = %path.display(),
            basename = %config.redis.basename,
            "Loaded run configuration"
        );
        Ok(config)
    }

    /// Check that every section required at setup is usable.
    pub fn validate(&self) -> Result<()> {
        if self.version > defaults::CONFIG_VERSION {
            return Err(Error::Config(format!(
                "config version {} is newer than supported version {}",
                self.version,
                defaults::CONFIG_VERSION
            )));
        }
        let required = [
            ("redis.host", self.redis.host.as_str()),
            ("redis.basename", self.redis.basename.as_str()),
            ("cluster.queue", self.cluster.queue.as_str()),
            ("cluster.cluster_log_dir", self.cluster.cluster_log_dir.as_str()),
            ("env.conda", self.env.conda.as_str()),
            ("database.host", self.database.host.as_str()),
            ("database.name", self.database.name.as_str()),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{} must not be empty", field)));
            }
        }
        if self.redis.port == 0 {
            return Err(Error::Config("redis.port must be non-zero".into()));
        }
        if self.database.pgbouncer_port == 0 {
            return Err(Error::Config("database.pgbouncer_port must be non-zero".into()));
        }
        if self.cluster.processing_memory == 0 {
            return Err(Error::Config(
                "cluster.processing_memory must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Config as a JSON value, the form embedded in job messages.
    pub fn to_json(&self) -> Result<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }
}
