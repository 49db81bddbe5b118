//! # Configuration System
//!
//! Typed configuration for workers, event buffers, the broker, distributed
//! runs, logging and the optional PostgreSQL collaborators.
//!
//! ## Sources
//!
//! Loaded by [`ConfigManager`] in increasing precedence:
//!
//! 1. built-in defaults (every section is `#[serde(default)]`)
//! 2. `config/jobflow.toml`
//! 3. `config/jobflow.{environment}.toml` (environment from `JOBFLOW_ENV`)
//! 4. `JOBFLOW__SECTION__KEY` environment variables
//!
//! ## Usage
//!
//! ```rust,no_run
//! use jobflow::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let concurrency = manager.config().worker.default_concurrency;
//! # Ok(())
//! # }
//! ```

pub mod loader;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::defaults;
use crate::error::{JobflowError, JobflowResult};

pub use loader::ConfigManager;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobflowConfig {
    pub worker: WorkerConfig,
    pub events: EventConfig,
    pub broker: BrokerConfig,
    pub distributed: DistributedConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
}

impl JobflowConfig {
    /// Reject values that would deadlock or starve the runtime.
    pub fn validate(&self) -> JobflowResult<()> {
        if self.worker.default_concurrency == 0 {
            return Err(JobflowError::configuration(
                "worker.default_concurrency must be at least 1",
            ));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(JobflowError::configuration(
                "worker.poll_interval_ms must be at least 1",
            ));
        }
        if self.events.broadcast_buffer_size == 0 || self.events.pubsub_buffer_size == 0 {
            return Err(JobflowError::configuration(
                "event buffer sizes must be at least 1",
            ));
        }
        if self.distributed.chunk_concurrency == 0 {
            return Err(JobflowError::configuration(
                "distributed.chunk_concurrency must be at least 1",
            ));
        }
        if self.distributed.chunk_attempts == 0 {
            return Err(JobflowError::configuration(
                "distributed.chunk_attempts must be at least 1",
            ));
        }
        if self.broker.key_prefix.is_empty() || self.broker.key_prefix.contains(':') {
            return Err(JobflowError::configuration(
                "broker.key_prefix must be non-empty and contain no ':'",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent jobs per queue when a definition doesn't set its own.
    pub default_concurrency: usize,
    /// Fallback poll interval when no wake-up notification arrives.
    pub poll_interval_ms: u64,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            default_concurrency: defaults::WORKER_CONCURRENCY,
            poll_interval_ms: defaults::WORKER_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Capacity of the broker's lifecycle broadcast channel.
    pub broadcast_buffer_size: usize,
    /// Capacity of each pub/sub subscription.
    pub pubsub_buffer_size: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            broadcast_buffer_size: defaults::EVENT_BROADCAST_BUFFER,
            pubsub_buffer_size: defaults::PUBSUB_BUFFER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// First segment of raw job keys: `{prefix}:{queue}:{jobId}`.
    pub key_prefix: String,
    pub remove_on_complete: bool,
    /// Attempts for task and workflow jobs.
    pub default_attempts: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            key_prefix: defaults::KEY_PREFIX.to_string(),
            remove_on_complete: true,
            default_attempts: defaults::JOB_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Concurrent chunk jobs per task type in this process.
    pub chunk_concurrency: usize,
    pub chunk_attempts: u32,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            chunk_concurrency: defaults::CHUNK_CONCURRENCY,
            chunk_attempts: defaults::JOB_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = JobflowConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.broker.key_prefix, "jobflow");
        assert_eq!(config.worker.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = JobflowConfig::default();
        config.distributed.chunk_concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(JobflowError::Configuration(_))
        ));
    }

    #[test]
    fn test_key_prefix_with_separator_rejected() {
        let mut config = JobflowConfig::default();
        config.broker.key_prefix = "bull:prod".to_string();
        assert!(config.validate().is_err());
    }
}
