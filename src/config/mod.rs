//! # Dispatch Configuration
//!
//! Layered configuration for the dispatch core: an optional config file
//! (`config/dispatch.toml` by default) merged with `DISPATCH_`-prefixed
//! environment variables (`DISPATCH_DATABASE__URL`, `DISPATCH_MONITOR__`
//! `TASK_TIMEOUT_SECONDS`, ...). Every section carries explicit defaults so
//! an empty environment yields a fully usable configuration, and loading
//! validates the result instead of silently falling back.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DispatchError, Result};

/// Root configuration for the dispatch core.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub dispatch: DispatchPolicyConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub task: TaskConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub worker_client: WorkerClientConfig,
}

/// Postgres connection settings shared by the task store and the queue.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
    pub connect_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost:5432/dispatch".to_string(),
            pool_size: 10,
            connect_timeout_seconds: 10,
        }
    }
}

/// Task queue settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Single logical queue carrying the task type in the message.
    pub queue_name: String,
    /// How long a read message stays invisible before redelivery.
    pub visibility_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    pub batch_size: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: "task_dispatch".to_string(),
            visibility_timeout_seconds: 30,
            poll_interval_ms: 1000,
            batch_size: 10,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Worker registry settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// A worker whose heartbeat is older than this is invisible to lookup.
    pub heartbeat_ttl_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl_seconds: 30,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_ttl_seconds as i64)
    }
}

/// Scheduling policy for the dispatcher loop.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchPolicyConfig {
    /// Workers at or above this assigned load are skipped during selection.
    pub max_pending_per_worker: u32,
    /// Default attempt budget for tasks that do not specify one.
    pub task_max_retries: i32,
    pub instance_id: String,
}

impl Default for DispatchPolicyConfig {
    fn default() -> Self {
        Self {
            max_pending_per_worker: 2,
            task_max_retries: 3,
            instance_id: "dispatcher-001".to_string(),
        }
    }
}

/// Timeout monitor settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Maximum wait for a completion before a PROCESSING task is reclaimed.
    pub task_timeout_seconds: u64,
    pub monitor_interval_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            task_timeout_seconds: 120,
            monitor_interval_seconds: 30,
        }
    }
}

impl MonitorConfig {
    pub fn task_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.task_timeout_seconds as i64)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_seconds)
    }
}

/// Task record settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Store eviction horizon for task records.
    pub task_ttl_seconds: i64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            task_ttl_seconds: 86_400,
        }
    }
}

impl TaskConfig {
    pub fn task_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.task_ttl_seconds)
    }
}

/// Re-enqueue backoff: exponential with jitter.
///
/// `retry_delay_seconds` is the base delay for the first retry; successive
/// attempts multiply it up to the cap, with up to `max_jitter` randomization
/// so correlated failures do not re-enqueue in lockstep.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub retry_delay_seconds: u64,
    pub max_delay_seconds: u64,
    pub multiplier: f64,
    pub jitter_enabled: bool,
    pub max_jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            retry_delay_seconds: 5,
            max_delay_seconds: 300,
            multiplier: 2.0,
            jitter_enabled: true,
            max_jitter: 0.1,
        }
    }
}

/// HTTP client settings for the worker execution call.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerClientConfig {
    pub submit_timeout_seconds: u64,
}

impl Default for WorkerClientConfig {
    fn default() -> Self {
        Self {
            submit_timeout_seconds: 30,
        }
    }
}

impl WorkerClientConfig {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_seconds)
    }
}

impl DispatchConfig {
    /// Load configuration from the default file location merged with
    /// `DISPATCH_`-prefixed environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration from an explicit file path (extension optional,
    /// per the `config` crate), then apply environment overrides.
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(path) => builder.add_source(config::File::with_name(path)),
            None => builder.add_source(config::File::with_name("config/dispatch").required(false)),
        };
        builder = builder.add_source(
            config::Environment::with_prefix("DISPATCH")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder
            .build()
            .map_err(|e| DispatchError::configuration("loader", e.to_string()))?;
        let config: DispatchConfig = settings
            .try_deserialize()
            .map_err(|e| DispatchError::configuration("loader", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work rather than limping along.
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(DispatchError::configuration(
                "database",
                "url must not be empty",
            ));
        }
        if self.database.pool_size == 0 {
            return Err(DispatchError::configuration(
                "database",
                "pool_size must be at least 1",
            ));
        }
        if self.queue.queue_name.is_empty() {
            return Err(DispatchError::configuration(
                "queue",
                "queue_name must not be empty",
            ));
        }
        if self.queue.visibility_timeout_seconds == 0 {
            return Err(DispatchError::configuration(
                "queue",
                "visibility_timeout_seconds must be positive",
            ));
        }
        if self.dispatch.task_max_retries < 1 {
            return Err(DispatchError::configuration(
                "dispatch",
                "task_max_retries must be at least 1",
            ));
        }
        if self.monitor.task_timeout_seconds == 0 || self.monitor.monitor_interval_seconds == 0 {
            return Err(DispatchError::configuration(
                "monitor",
                "task_timeout_seconds and monitor_interval_seconds must be positive",
            ));
        }
        if self.task.task_ttl_seconds < 1 {
            return Err(DispatchError::configuration(
                "task",
                "task_ttl_seconds must be positive",
            ));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(DispatchError::configuration(
                "backoff",
                "multiplier must be at least 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.max_jitter) {
            return Err(DispatchError::configuration(
                "backoff",
                "max_jitter must be within [0.0, 1.0]",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DispatchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.max_pending_per_worker, 2);
        assert_eq!(config.backoff.retry_delay_seconds, 5);
        assert_eq!(config.monitor.monitor_interval_seconds, 30);
        assert_eq!(config.task.task_ttl_seconds, 86_400);
    }

    #[test]
    fn validation_catches_bad_jitter() {
        let mut config = DispatchConfig::default();
        config.backoff.max_jitter = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_catches_zero_retry_budget() {
        let mut config = DispatchConfig::default();
        config.dispatch.task_max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duration_accessors() {
        let config = DispatchConfig::default();
        assert_eq!(config.queue.visibility_timeout(), Duration::from_secs(30));
        assert_eq!(config.queue.poll_interval(), Duration::from_millis(1000));
        assert_eq!(config.monitor.task_timeout(), chrono::Duration::seconds(120));
        assert_eq!(config.registry.heartbeat_ttl(), chrono::Duration::seconds(30));
    }
}
