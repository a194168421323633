use crate::handler::TaskHandler;
use relayq_core::{QueueError, Result, Task};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Runs handlers with a wall-clock budget. A handler that raises surfaces as
/// `HandlerError`; one that overruns is cancelled cooperatively (its future
/// is dropped) and surfaces as `HandlerTimeout`. Either way the worker turns
/// the error into the task's `error` string and takes the fail path.
pub struct Executor {
    task_timeout: Duration,
}

impl Executor {
    pub fn new(task_timeout: Duration) -> Self {
        Executor { task_timeout }
    }

    pub async fn run(&self, handler: Arc<dyn TaskHandler>, task: &Task) -> Result<Value> {
        debug!(task_id = %task.id, name = %task.name, budget_ms = self.task_timeout.as_millis() as u64, "Executing task");

        match timeout(self.task_timeout, handler.run(task.payload.clone())).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => {
                warn!(task_id = %task.id, error = %error, "Handler failed");
                Err(QueueError::HandlerError(error))
            }
            Err(_) => {
                warn!(task_id = %task.id, "Handler exceeded {:?}", self.task_timeout);
                Err(QueueError::HandlerTimeout)
            }
        }
    }
}
