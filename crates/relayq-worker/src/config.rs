use relayq_core::{validate_queue, QueueError, Result, DEFAULT_QUEUE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Stable worker id; generated from hostname/pid when absent
    pub worker_id: Option<String>,

    /// Queues to consume, scanned in this order
    pub queues: Vec<String>,

    /// Independent processing slots
    pub concurrency: usize,

    /// How long one dequeue attempt blocks
    pub dequeue_timeout_ms: u64,

    pub heartbeat_interval_ms: u64,

    /// Grace period for in-flight tasks on shutdown
    pub shutdown_timeout_ms: u64,

    /// Handler execution budget per attempt
    pub task_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            worker_id: None,
            queues: vec![DEFAULT_QUEUE.to_string()],
            concurrency: 1,
            dequeue_timeout_ms: 5_000,
            heartbeat_interval_ms: 10_000,
            shutdown_timeout_ms: 30_000,
            task_timeout_ms: 300_000,
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| QueueError::InvalidInput(format!("cannot read {}: {}", path, e)))?;
        let config: WorkerConfig = serde_yaml::from_str(&contents)
            .map_err(|e| QueueError::InvalidInput(format!("malformed config {}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queues.is_empty() {
            return Err(QueueError::InvalidInput(
                "worker needs at least one queue".to_string(),
            ));
        }
        for queue in &self.queues {
            validate_queue(queue)?;
        }
        if self.concurrency == 0 {
            return Err(QueueError::InvalidInput(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.task_timeout_ms == 0 {
            return Err(QueueError::InvalidInput(
                "task_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn generate_worker_id(&self) -> String {
        if let Some(id) = &self.worker_id {
            return id.clone();
        }

        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let pid = std::process::id();
        let suffix = uuid::Uuid::new_v4().simple().to_string();

        format!("{}-{}-{}", host, pid, &suffix[..8])
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.queues, vec!["default"]);
    }

    #[test]
    fn test_rejects_empty_queues_and_zero_concurrency() {
        let config = WorkerConfig {
            queues: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = WorkerConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generated_id_is_unique() {
        let config = WorkerConfig::default();
        assert_ne!(config.generate_worker_id(), config.generate_worker_id());

        let pinned = WorkerConfig {
            worker_id: Some("w1".to_string()),
            ..Default::default()
        };
        assert_eq!(pinned.generate_worker_id(), "w1");
    }
}
