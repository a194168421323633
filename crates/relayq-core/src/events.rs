use crate::{TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    TaskUpdate,
    TaskDeleted,
}

/// Message published on a task's topic for every observable transition.
///
/// Best effort: the durable record is the source of truth, the event stream
/// is an accelerator for live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub event: TaskEventKind,
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub ts: DateTime<Utc>,
}

/// Per-queue counts as reported by `queue_stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queue_name: String,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
    pub paused: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounts {
    pub total: u64,
    pub active: u64,
    pub idle: u64,
    pub busy: u64,
}

/// Periodic aggregate pushed on the dashboard topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub event: String,
    pub queues: Vec<QueueCounts>,
    pub workers: WorkerCounts,
    pub ts: DateTime<Utc>,
}

impl DashboardSnapshot {
    pub fn new(queues: Vec<QueueCounts>, workers: WorkerCounts, ts: DateTime<Utc>) -> Self {
        DashboardSnapshot {
            event: "dashboard_update".to_string(),
            queues,
            workers,
            ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::now_ms;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_task_event_wire_shape() {
        let event = TaskEvent {
            event: TaskEventKind::TaskUpdate,
            task_id: Uuid::nil(),
            status: TaskStatus::Completed,
            result: Some(json!({"n": 1})),
            error: None,
            ts: now_ms(),
        };

        let raw = serde_json::to_value(&event).unwrap();
        assert_eq!(raw["event"], "task_update");
        assert_eq!(raw["status"], "completed");
        // Absent outcomes are explicit nulls on the wire.
        assert!(raw["error"].is_null());
    }
}
