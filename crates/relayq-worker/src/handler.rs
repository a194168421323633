use async_trait::async_trait;
use parking_lot::RwLock;
use relayq_core::Payload;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Result type for task handlers: a serializable value, or an error string
/// that becomes the task's `error` field.
pub type HandlerResult = std::result::Result<Value, String>;

/// A pluggable function from a task payload to a result, keyed by task name.
///
/// Handlers receive an owned copy of the payload and must not assume
/// exactly-once delivery; the queue guarantees at-least-once.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, payload: Payload) -> HandlerResult;
}

/// Registry of task handlers by task name. Populated once at worker boot;
/// tasks naming an unregistered handler go straight to the dead-letter set.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register<H: TaskHandler + 'static>(&self, name: impl Into<String>, handler: H) {
        let mut handlers = self.handlers.write();
        handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        let handlers = self.handlers.read();
        handlers.get(name).cloned()
    }

    pub fn has_handler(&self, name: &str) -> bool {
        let handlers = self.handlers.read();
        handlers.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        let handlers = self.handlers.read();
        handlers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let handlers = self.handlers.read();
        handlers.keys().cloned().collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapter turning a plain async closure into a handler.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HandlerResult> + Send,
{
    async fn run(&self, payload: Payload) -> HandlerResult {
        (self.0)(payload).await
    }
}

/// Handler that returns its payload unchanged
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn run(&self, payload: Payload) -> HandlerResult {
        Ok(Value::Object(payload))
    }
}

/// Handler that simulates work by sleeping
pub struct SleepHandler {
    duration_ms: u64,
}

impl SleepHandler {
    pub fn new(duration_ms: u64) -> Self {
        SleepHandler { duration_ms }
    }
}

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn run(&self, payload: Payload) -> HandlerResult {
        tokio::time::sleep(tokio::time::Duration::from_millis(self.duration_ms)).await;
        Ok(Value::Object(payload))
    }
}
