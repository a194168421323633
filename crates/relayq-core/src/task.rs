use crate::{Priority, QueueError, Result, DEFAULT_QUEUE, MAX_NAME_LEN, MAX_QUEUE_NAME_LEN};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unique identifier for a task
pub type TaskId = Uuid;

/// Task payload: an opaque JSON object handed verbatim to the handler
pub type Payload = Map<String, Value>;

/// Current time at millisecond precision, the resolution persisted records use.
pub fn now_ms() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Task status in the queue system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting to be claimed by a worker (possibly held back by retry backoff)
    Pending,
    /// Currently being executed by a worker
    Processing,
    /// Finished successfully; terminal
    Completed,
    /// Retries exhausted or cancelled; parked in the dead-letter set
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states never regress without an explicit administrative requeue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// One unit of work with identity, payload, priority, and lifecycle state.
///
/// The record is immutable by convention: transitions consume the record and
/// return the successor. Persistence is the broker's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier, assigned at creation
    pub id: TaskId,

    /// Handler selector (e.g. "send_email"); `[a-zA-Z0-9_]+`, 1..=100 chars
    pub name: String,

    /// Opaque JSON object passed to the handler
    #[serde(default)]
    pub payload: Payload,

    /// Current lifecycle state
    pub status: TaskStatus,

    /// 1..=10, 10 most urgent
    pub priority: Priority,

    /// Queue name; `[a-z0-9-]+`, 1..=64 chars
    pub queue: String,

    /// When the task was created
    pub created_at: DateTime<Utc>,

    /// When a worker last began executing the task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Handler result (if completed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error message (if failed or awaiting retry)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Times this task has been re-attempted; never exceeds `max_retries`
    pub retries: u32,

    /// Retry ceiling (default 3)
    pub max_retries: u32,

    /// Cooperative cancellation flag; handlers may poll it
    #[serde(default, skip_serializing_if = "is_false")]
    pub cancel_requested: bool,

    /// Fields written by newer versions, preserved on write-back
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    /// Create a new pending task with validated fields.
    pub fn new(name: impl Into<String>, payload: Payload) -> Result<Self> {
        Self::builder(name).payload(payload).build()
    }

    /// Create a new task builder
    pub fn builder(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name)
    }

    /// Serialize to the persisted JSON record form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| QueueError::InvalidInput(format!("unserializable task: {}", e)))
    }

    /// Deserialize from the persisted JSON record form.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| QueueError::InvalidInput(format!("malformed task record: {}", e)))
    }

    /// A worker claimed the task: pending -> processing.
    pub fn started(self, at: DateTime<Utc>) -> Result<Self> {
        self.expect_status(TaskStatus::Pending, "start")?;
        Ok(Task {
            status: TaskStatus::Processing,
            started_at: Some(at),
            ..self
        })
    }

    /// Handler succeeded: processing -> completed. Terminal.
    pub fn completed(self, result: Value, at: DateTime<Utc>) -> Result<Self> {
        self.expect_status(TaskStatus::Processing, "complete")?;
        Ok(Task {
            status: TaskStatus::Completed,
            completed_at: Some(at),
            result: Some(result),
            error: None,
            ..self
        })
    }

    /// Handler failed with retries remaining: processing -> pending, retries + 1.
    pub fn retried(self, error: impl Into<String>) -> Result<Self> {
        self.expect_status(TaskStatus::Processing, "retry")?;
        if self.retries >= self.max_retries {
            return Err(QueueError::Conflict(format!(
                "task {} has no retries left ({}/{})",
                self.id, self.retries, self.max_retries
            )));
        }
        Ok(Task {
            status: TaskStatus::Pending,
            started_at: None,
            error: Some(error.into()),
            retries: self.retries + 1,
            ..self
        })
    }

    /// Retries exhausted (or non-retryable failure): processing -> failed.
    /// Leaves `retries` untouched so it never exceeds `max_retries`.
    pub fn exhausted(self, error: impl Into<String>, at: DateTime<Utc>) -> Result<Self> {
        self.expect_status(TaskStatus::Processing, "fail")?;
        Ok(Task {
            status: TaskStatus::Failed,
            completed_at: Some(at),
            error: Some(error.into()),
            ..self
        })
    }

    /// Cancel a task that never started: pending -> failed.
    pub fn cancelled(self, at: DateTime<Utc>) -> Result<Self> {
        self.expect_status(TaskStatus::Pending, "cancel")?;
        Ok(Task {
            status: TaskStatus::Failed,
            completed_at: Some(at),
            error: Some("cancelled".to_string()),
            ..self
        })
    }

    /// Administrative requeue of a terminal task: retries reset, outcome cleared.
    pub fn requeued(self) -> Result<Self> {
        if !self.status.is_terminal() {
            return Err(QueueError::Conflict(format!(
                "task {} is {}, only terminal tasks can be requeued",
                self.id, self.status
            )));
        }
        Ok(Task {
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retries: 0,
            cancel_requested: false,
            ..self
        })
    }

    /// Whether a further failure still has a retry left.
    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }

    /// Re-check field constraints on an externally constructed record.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_queue(&self.queue)?;
        Priority::new(self.priority.value())?;
        Ok(())
    }

    fn expect_status(&self, expected: TaskStatus, verb: &str) -> Result<()> {
        if self.status != expected {
            return Err(QueueError::Conflict(format!(
                "cannot {} task {}: status is {}, expected {}",
                verb, self.id, self.status, expected
            )));
        }
        Ok(())
    }
}

/// Reject handler names outside `[a-zA-Z0-9_]+` or the 1..=100 length bound.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(QueueError::InvalidInput(format!(
            "task name must be 1..={} chars, got {}",
            MAX_NAME_LEN,
            name.len()
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(QueueError::InvalidInput(format!(
            "task name {:?} contains characters outside [a-zA-Z0-9_]",
            name
        )));
    }
    Ok(())
}

/// Reject queue names outside `[a-z0-9-]+` or the 1..=64 length bound.
pub fn validate_queue(queue: &str) -> Result<()> {
    if queue.is_empty() || queue.len() > MAX_QUEUE_NAME_LEN {
        return Err(QueueError::InvalidInput(format!(
            "queue name must be 1..={} chars, got {}",
            MAX_QUEUE_NAME_LEN,
            queue.len()
        )));
    }
    if !queue
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(QueueError::InvalidInput(format!(
            "queue name {:?} contains characters outside [a-z0-9-]",
            queue
        )));
    }
    Ok(())
}

/// Builder for creating tasks with custom configuration
pub struct TaskBuilder {
    name: String,
    payload: Payload,
    priority: u8,
    queue: String,
    max_retries: u32,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        TaskBuilder {
            name: name.into(),
            payload: Payload::new(),
            priority: Priority::DEFAULT,
            queue: DEFAULT_QUEUE.to_string(),
            max_retries: 3,
        }
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn build(self) -> Result<Task> {
        validate_name(&self.name)?;
        validate_queue(&self.queue)?;
        let priority = Priority::new(self.priority)?;

        Ok(Task {
            id: Uuid::new_v4(),
            name: self.name,
            payload: self.payload,
            status: TaskStatus::Pending,
            priority,
            queue: self.queue,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retries: 0,
            max_retries: self.max_retries,
            cancel_requested: false,
            extra: Map::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn payload_of(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            other => {
                let mut map = Payload::new();
                map.insert("value".to_string(), other);
                map
            }
        }
    }

    #[test]
    fn test_task_creation_defaults() {
        let task = Task::new("resize_image", Payload::new()).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority.value(), 5);
        assert_eq!(task.queue, "default");
        assert_eq!(task.retries, 0);
        assert_eq!(task.max_retries, 3);
        assert!(task.started_at.is_none());
    }

    #[test]
    fn test_name_boundaries() {
        assert!(Task::builder("a").build().is_ok());
        assert!(Task::builder("a".repeat(100)).build().is_ok());
        assert!(Task::builder("").build().is_err());
        assert!(Task::builder("a".repeat(101)).build().is_err());
        assert!(Task::builder("has space").build().is_err());
        assert!(Task::builder("has-dash").build().is_err());
    }

    #[test]
    fn test_queue_name_boundaries() {
        assert!(Task::builder("t").queue("q").build().is_ok());
        assert!(Task::builder("t").queue("a".repeat(64)).build().is_ok());
        assert!(Task::builder("t").queue("").build().is_err());
        assert!(Task::builder("t").queue("a".repeat(65)).build().is_err());
        assert!(Task::builder("t").queue("Upper").build().is_err());
        assert!(Task::builder("t").queue("under_score").build().is_err());
    }

    #[test]
    fn test_priority_boundaries() {
        assert!(Task::builder("t").priority(1).build().is_ok());
        assert!(Task::builder("t").priority(10).build().is_ok());
        assert!(Task::builder("t").priority(0).build().is_err());
        assert!(Task::builder("t").priority(11).build().is_err());
    }

    #[test]
    fn test_lifecycle_success_path() {
        let task = Task::new("t", Payload::new()).unwrap();
        let task = task.started(now_ms()).unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert!(task.started_at.is_some());

        let task = task.completed(json!({"ok": true}), now_ms()).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert_eq!(task.result, Some(json!({"ok": true})));
    }

    #[test]
    fn test_retry_then_exhaust() {
        let task = Task::builder("t").max_retries(1).build().unwrap();
        let task = task.started(now_ms()).unwrap();
        let task = task.retried("boom").unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retries, 1);
        assert!(task.started_at.is_none());

        // No retries left: a second failure must not go through retried().
        let task = task.started(now_ms()).unwrap();
        assert!(!task.can_retry());
        assert!(task.clone().retried("boom").is_err());

        let task = task.exhausted("boom", now_ms()).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        // Invariant: retries never exceeds max_retries.
        assert_eq!(task.retries, 1);
    }

    #[test]
    fn test_invalid_transitions_are_conflicts() {
        let task = Task::new("t", Payload::new()).unwrap();
        assert!(matches!(
            task.clone().completed(json!(null), now_ms()),
            Err(QueueError::Conflict(_))
        ));

        let done = task
            .started(now_ms())
            .unwrap()
            .completed(json!(1), now_ms())
            .unwrap();
        // Terminal stickiness: completed never re-enters processing.
        assert!(done.clone().started(now_ms()).is_err());
        assert!(done.clone().exhausted("x", now_ms()).is_err());

        let requeued = done.requeued().unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(requeued.retries, 0);
        assert!(requeued.result.is_none());
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let raw = r#"{"id":"550e8400-e29b-41d4-a716-446655440000","name":"t","payload":{},"status":"pending","priority":5,"queue":"default","created_at":"2026-08-01T00:00:00Z","retries":0,"max_retries":3,"lease_hint":"future-field"}"#;
        let task = Task::from_json(raw).unwrap();
        assert_eq!(task.extra.get("lease_hint"), Some(&json!("future-field")));
        let rewritten = task.to_json().unwrap();
        assert!(rewritten.contains("lease_hint"));
    }

    proptest! {
        /// serialize -> deserialize -> serialize is byte-identical for any
        /// JSON-shaped payload (nested, unicode, empty, large).
        #[test]
        fn prop_round_trip_stable(value in arb_json()) {
            let task = Task::builder("round_trip")
                .payload(payload_of(value))
                .build()
                .unwrap();
            let first = task.to_json().unwrap();
            let reparsed = Task::from_json(&first).unwrap();
            prop_assert_eq!(&task, &reparsed);
            let second = reparsed.to_json().unwrap();
            prop_assert_eq!(first, second);
        }
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[\\PC]{0,32}".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
                prop::collection::btree_map("[a-z_]{1,8}", inner, 0..8)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }
}
