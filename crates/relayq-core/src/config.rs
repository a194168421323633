use crate::{QueueError, Result, DEFAULT_QUEUE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Shared configuration for the broker and worker runtime.
///
/// Intervals are in milliseconds so test deployments can shrink them below a
/// second without a separate knob set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Directory the embedded store engine persists into
    pub data_dir: PathBuf,

    /// Queue used when a producer does not name one
    pub default_queue: String,

    /// Handler execution budget per attempt
    pub task_timeout_ms: u64,

    /// Default retry ceiling for new tasks
    pub max_retries: u32,

    /// Base of the exponential retry backoff
    pub base_retry_delay_ms: u64,

    /// Backoff cap
    pub max_retry_delay_ms: u64,

    /// Apply +/-20% jitter to retry delays
    pub retry_jitter: bool,

    pub heartbeat_interval_ms: u64,

    /// How long a stopping worker waits for in-flight tasks
    pub shutdown_timeout_ms: u64,

    /// Retention for completed/failed task records
    pub completed_retention_ms: u64,

    /// Dashboard snapshot period for the event fan-out
    pub dashboard_period_ms: u64,

    /// Capacity of each fan-out channel before slow subscribers lose events
    pub event_channel_capacity: usize,

    pub log_level: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            data_dir: PathBuf::from("./data"),
            default_queue: DEFAULT_QUEUE.to_string(),
            task_timeout_ms: 300_000,
            max_retries: 3,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 300_000,
            retry_jitter: true,
            heartbeat_interval_ms: 10_000,
            shutdown_timeout_ms: 30_000,
            completed_retention_ms: 24 * 60 * 60 * 1000,
            dashboard_period_ms: 2_000,
            event_channel_capacity: 256,
            log_level: "info".to_string(),
        }
    }
}

impl QueueConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| QueueError::InvalidInput(format!("cannot read {}: {}", path, e)))?;
        let config: QueueConfig = serde_yaml::from_str(&contents)
            .map_err(|e| QueueError::InvalidInput(format!("malformed config {}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.task_timeout_ms == 0 {
            return Err(QueueError::InvalidInput(
                "task_timeout_ms must be positive".to_string(),
            ));
        }
        if self.base_retry_delay_ms > self.max_retry_delay_ms {
            return Err(QueueError::InvalidInput(format!(
                "base_retry_delay_ms {} exceeds max_retry_delay_ms {}",
                self.base_retry_delay_ms, self.max_retry_delay_ms
            )));
        }
        crate::task::validate_queue(&self.default_queue)?;
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_millis(self.completed_retention_ms)
    }

    pub fn dashboard_period(&self) -> Duration {
        Duration::from_millis(self.dashboard_period_ms)
    }
}

/// Install the process-wide tracing subscriber. Call once at startup.
pub fn init_tracing(log_level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = QueueConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.completed_retention(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_bad_backoff_rejected() {
        let config = QueueConfig {
            base_retry_delay_ms: 10_000,
            max_retry_delay_ms: 1_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
