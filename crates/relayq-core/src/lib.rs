mod config;
mod error;
mod events;
mod priority;
mod retry;
mod task;
mod worker_state;

pub use config::{init_tracing, QueueConfig};
pub use error::{QueueError, Result};
pub use events::{DashboardSnapshot, QueueCounts, TaskEvent, TaskEventKind, WorkerCounts};
pub use priority::Priority;
pub use retry::{backoff_delay, with_jitter};
pub use task::{
    now_ms, validate_name, validate_queue, Payload, Task, TaskBuilder, TaskId, TaskStatus,
};
pub use worker_state::{WorkerState, WorkerStatus};

/// Task names select a handler; `[a-zA-Z0-9_]+`, at most this many chars.
pub const MAX_NAME_LEN: usize = 100;

/// Queue names are `[a-z0-9-]+`, at most this many chars.
pub const MAX_QUEUE_NAME_LEN: usize = 64;

pub const DEFAULT_QUEUE: &str = "default";
