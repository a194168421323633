use relayq_core::{now_ms, DashboardSnapshot, Task, TaskEvent, TaskEventKind, TaskId, TaskStatus};
use relayq_store::Engine;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::trace;

const DASHBOARD_TOPIC: &str = "dashboard";

/// Fan-out of broker mutations to live subscribers.
///
/// Published only after the durable write succeeds, and never retains
/// subscribers: a dropped receiver unsubscribes itself, a slow one loses the
/// oldest messages. State remains the source of truth.
#[derive(Clone)]
pub struct EventBus {
    engine: Arc<Engine>,
}

impl EventBus {
    pub fn new(engine: Arc<Engine>) -> Self {
        EventBus { engine }
    }

    fn task_topic(id: &TaskId) -> String {
        format!("task:{}", id)
    }

    pub fn publish_task_update(&self, task: &Task) {
        self.publish_task(&TaskEvent {
            event: TaskEventKind::TaskUpdate,
            task_id: task.id,
            status: task.status,
            result: task.result.clone(),
            error: task.error.clone(),
            ts: now_ms(),
        });
    }

    pub fn publish_task_deleted(&self, id: TaskId, status: TaskStatus) {
        self.publish_task(&TaskEvent {
            event: TaskEventKind::TaskDeleted,
            task_id: id,
            status,
            result: None,
            error: None,
            ts: now_ms(),
        });
    }

    fn publish_task(&self, event: &TaskEvent) {
        if let Ok(payload) = serde_json::to_string(event) {
            trace!(task_id = %event.task_id, status = %event.status, "Publishing task event");
            self.engine.publish(&Self::task_topic(&event.task_id), payload);
        }
    }

    pub fn publish_dashboard(&self, snapshot: &DashboardSnapshot) {
        if let Ok(payload) = serde_json::to_string(snapshot) {
            self.engine.publish(DASHBOARD_TOPIC, payload);
        }
    }

    /// Every status transition of one task, from subscription time on.
    pub fn subscribe_task(&self, id: &TaskId) -> impl Stream<Item = TaskEvent> + Send + Unpin {
        let rx = self.engine.subscribe(&Self::task_topic(id));
        BroadcastStream::new(rx)
            .filter_map(|msg| msg.ok().and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    /// Periodic aggregate snapshots.
    pub fn subscribe_dashboard(&self) -> impl Stream<Item = DashboardSnapshot> + Send + Unpin {
        let rx = self.engine.subscribe(DASHBOARD_TOPIC);
        BroadcastStream::new(rx)
            .filter_map(|msg| msg.ok().and_then(|raw| serde_json::from_str(&raw).ok()))
    }
}
