use crate::{now_ms, TaskId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy,
    Stopping,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Stopped => "stopped",
        }
    }
}

/// Liveness record a worker heartbeats into the store.
///
/// Created at worker start, removed on clean shutdown; stale records are
/// garbage-collected by whichever worker notices them first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub queues: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<TaskId>,
    pub last_heartbeat: DateTime<Utc>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub started_at: DateTime<Utc>,
}

impl WorkerState {
    pub fn new(worker_id: impl Into<String>, queues: Vec<String>) -> Self {
        let now = now_ms();
        WorkerState {
            worker_id: worker_id.into(),
            status: WorkerStatus::Starting,
            queues,
            current_task: None,
            last_heartbeat: now,
            tasks_completed: 0,
            tasks_failed: 0,
            started_at: now,
        }
    }

    /// Heartbeat age is allowed one interval of slack before observers call
    /// the worker offline.
    pub fn is_alive(&self, heartbeat_interval: std::time::Duration, now: DateTime<Utc>) -> bool {
        let allowed = Duration::from_std(heartbeat_interval * 2).unwrap_or(Duration::MAX);
        now - self.last_heartbeat <= allowed
    }

    /// Records older than 5x the heartbeat interval are garbage.
    pub fn is_stale(&self, heartbeat_interval: std::time::Duration, now: DateTime<Utc>) -> bool {
        let limit = Duration::from_std(heartbeat_interval * 5).unwrap_or(Duration::MAX);
        now - self.last_heartbeat > limit
    }
}
