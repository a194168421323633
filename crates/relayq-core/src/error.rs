use thiserror::Error;

/// Errors surfaced by broker operations and the worker runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Caller violated a field constraint. Never retried internally.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Duplicate task id, or a transition from a state the task is not in.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Backing store unreachable. Workers treat this as transient.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Handler raised; recorded as the task's error string.
    #[error("Handler error: {0}")]
    HandlerError(String),

    /// Handler did not complete within the task timeout.
    #[error("Handler timed out")]
    HandlerTimeout,

    /// No handler registered for the task name. Non-retryable.
    #[error("No handler registered for task: {0}")]
    UnknownTask(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
