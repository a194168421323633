//! Normative key layout of the broker's keyspace.

use relayq_core::TaskId;

/// Set of all queue names ever seen
pub const QUEUES: &str = "queues";

/// Set of all registered worker ids
pub const WORKERS: &str = "workers";

pub fn task(id: &TaskId) -> String {
    format!("task:{}", id)
}

pub fn worker(id: &str) -> String {
    format!("worker:{}", id)
}

/// Ordered set, score `-priority`, FIFO within a priority
pub fn pending(queue: &str) -> String {
    format!("queue:{}:pending", queue)
}

pub fn processing(queue: &str) -> String {
    format!("queue:{}:processing", queue)
}

/// Companion hash: task id -> dequeue unix-ms, consumed by the sweep
pub fn processing_ts(queue: &str) -> String {
    format!("queue:{}:processing:ts", queue)
}

pub fn completed(queue: &str) -> String {
    format!("queue:{}:completed", queue)
}

pub fn failed(queue: &str) -> String {
    format!("queue:{}:failed", queue)
}

/// Ordered set, score = failure unix-ms
pub fn dlq(queue: &str) -> String {
    format!("queue:{}:dlq", queue)
}

/// Ordered set, score = visibility unix-ms; holds tasks serving retry backoff
pub fn delayed(queue: &str) -> String {
    format!("queue:{}:delayed", queue)
}

pub fn paused(queue: &str) -> String {
    format!("queue:{}:paused", queue)
}
