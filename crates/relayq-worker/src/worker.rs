use crate::config::WorkerConfig;
use crate::executor::Executor;
use crate::handler::HandlerRegistry;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relayq_broker::Broker;
use relayq_core::{now_ms, QueueError, Result, Task, TaskId, WorkerState, WorkerStatus};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Canonical error string for handler timeouts.
const TIMEOUT_ERROR: &str = "timeout";

/// Attempts before a broker operation is given up on during an outage.
const BROKER_RETRY_ATTEMPTS: u32 = 8;

/// A worker binds a handler registry to one or more queues and runs
/// `concurrency` independent processing slots plus a heartbeat loop. It holds
/// the broker by `Arc`; the broker knows workers only through their
/// heartbeated state records.
pub struct Worker {
    config: WorkerConfig,
    worker_id: String,
    broker: Arc<Broker>,
    registry: Arc<HandlerRegistry>,
    executor: Executor,
    active: AtomicUsize,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    current_task: Mutex<Option<TaskId>>,
    started_at: DateTime<Utc>,
    stopping: AtomicBool,
    shutdown: Notify,
}

impl Worker {
    pub fn new(config: WorkerConfig, broker: Arc<Broker>, registry: HandlerRegistry) -> Self {
        let worker_id = config.generate_worker_id();
        let executor = Executor::new(config.task_timeout());

        Worker {
            config,
            worker_id,
            broker,
            registry: Arc::new(registry),
            executor,
            active: AtomicUsize::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            current_task: Mutex::new(None),
            started_at: now_ms(),
            stopping: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until `shutdown` is called. Startup errors (bad configuration, an
    /// empty handler registry) abort before any task is consumed.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.config.validate()?;
        if self.registry.is_empty() {
            return Err(QueueError::InvalidInput(
                "worker started with no registered handlers".to_string(),
            ));
        }

        info!(
            worker_id = %self.worker_id,
            queues = ?self.config.queues,
            concurrency = self.config.concurrency,
            handlers = ?self.registry.names(),
            "Starting worker"
        );
        self.broker.register_worker(&self.snapshot(WorkerStatus::Starting))?;

        // One JoinSet for every loop: dropping or aborting it takes the whole
        // worker down, the way a process crash would.
        let mut tasks = JoinSet::new();
        for slot in 0..self.config.concurrency {
            let worker = self.clone();
            tasks.spawn(async move { worker.slot_loop(slot).await });
        }
        {
            let worker = self.clone();
            tasks.spawn(async move { worker.heartbeat_loop().await });
        }

        self.write_state(WorkerStatus::Idle);
        self.shutdown.notified().await;

        // Graceful drain: no new dequeues, bounded wait for in-flight tasks.
        self.stopping.store(true, Ordering::SeqCst);
        self.write_state(WorkerStatus::Stopping);
        info!(worker_id = %self.worker_id, "Worker stopping, draining in-flight tasks");

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout();
        while self.active.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    worker_id = %self.worker_id,
                    active = self.active.load(Ordering::SeqCst),
                    "Shutdown deadline exceeded, abandoning in-flight tasks to the sweeper"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        tasks.abort_all();

        if let Err(e) = self.broker.unregister_worker(&self.worker_id) {
            warn!(worker_id = %self.worker_id, "Failed to unregister: {}", e);
        }
        info!(
            worker_id = %self.worker_id,
            completed = self.tasks_completed.load(Ordering::SeqCst),
            failed = self.tasks_failed.load(Ordering::SeqCst),
            "Worker stopped"
        );
        Ok(())
    }

    /// Request shutdown; `run` returns after the graceful drain.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    async fn slot_loop(&self, slot: usize) {
        debug!(worker_id = %self.worker_id, slot, "Processing slot started");

        while !self.stopping.load(Ordering::SeqCst) {
            match self
                .broker
                .dequeue(&self.config.queues, self.config.dequeue_timeout())
                .await
            {
                Ok(Some(task)) => self.process(task).await,
                Ok(None) => {}
                Err(QueueError::BrokerUnavailable(e)) => {
                    // Transient: the slot sleeps and retries, no task was consumed.
                    warn!(slot, "Dequeue failed, backing off: {}", e);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => {
                    error!(slot, "Dequeue error: {}", e);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }

        debug!(worker_id = %self.worker_id, slot, "Processing slot exited");
    }

    async fn process(&self, task: Task) {
        self.active.fetch_add(1, Ordering::SeqCst);
        *self.current_task.lock() = Some(task.id);
        self.write_state(WorkerStatus::Busy);

        match self.registry.get(&task.name) {
            None => {
                // Non-retryable: no point cycling a task nothing can run.
                let reason = QueueError::UnknownTask(task.name.clone()).to_string();
                warn!(task_id = %task.id, name = %task.name, "No handler registered, dead-lettering");
                self.report(|| self.broker.dead_letter(&task, &reason)).await;
                self.tasks_failed.fetch_add(1, Ordering::SeqCst);
            }
            Some(handler) => match self.executor.run(handler, &task).await {
                Ok(value) => {
                    self.report(|| self.broker.complete(&task, value.clone())).await;
                    self.tasks_completed.fetch_add(1, Ordering::SeqCst);
                }
                Err(QueueError::HandlerError(error)) => {
                    self.report(|| self.broker.fail(&task, &error)).await;
                    self.tasks_failed.fetch_add(1, Ordering::SeqCst);
                }
                Err(QueueError::HandlerTimeout) => {
                    self.report(|| self.broker.fail(&task, TIMEOUT_ERROR)).await;
                    self.tasks_failed.fetch_add(1, Ordering::SeqCst);
                }
                Err(other) => {
                    let error = other.to_string();
                    self.report(|| self.broker.fail(&task, &error)).await;
                    self.tasks_failed.fetch_add(1, Ordering::SeqCst);
                }
            },
        }

        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            *self.current_task.lock() = None;
            if !self.stopping.load(Ordering::SeqCst) {
                self.write_state(WorkerStatus::Idle);
            }
        }
    }

    /// Report an outcome to the broker, riding out transient outages with
    /// backoff. Handler failures are data, never control flow: a report that
    /// ultimately cannot land is logged and abandoned to the sweeper.
    async fn report(&self, mut op: impl FnMut() -> Result<Task>) {
        let mut delay = Duration::from_millis(100);
        for attempt in 1..=BROKER_RETRY_ATTEMPTS {
            match op() {
                Ok(_) => return,
                Err(QueueError::BrokerUnavailable(e)) => {
                    warn!(attempt, "Broker unavailable while reporting outcome: {}", e);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
                Err(QueueError::Conflict(e)) => {
                    // Someone else moved the task (sweep or competing report).
                    debug!("Outcome already recorded elsewhere: {}", e);
                    return;
                }
                Err(e) => {
                    error!("Failed to report task outcome: {}", e);
                    return;
                }
            }
        }
        error!("Giving up reporting outcome after {} attempts", BROKER_RETRY_ATTEMPTS);
    }

    async fn heartbeat_loop(&self) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let sweep_age = self.config.task_timeout() * 3;
        let worker_gc_age = self.config.heartbeat_interval() * 5;

        loop {
            interval.tick().await;
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            let status = if self.active.load(Ordering::SeqCst) > 0 {
                WorkerStatus::Busy
            } else {
                WorkerStatus::Idle
            };
            if let Err(e) = self.broker.heartbeat(&self.snapshot(status)) {
                warn!(worker_id = %self.worker_id, "Heartbeat failed: {}", e);
                continue;
            }

            // Opportunistic recovery duties; any worker may run them.
            for queue in &self.config.queues {
                match self.broker.sweep_stale(queue, now_ms(), sweep_age) {
                    Ok(recovered) if !recovered.is_empty() => {
                        info!(queue = %queue, count = recovered.len(), "Recovered stale tasks");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(queue = %queue, "Sweep failed: {}", e),
                }
            }
            if let Err(e) = self.broker.gc_stale_workers(worker_gc_age) {
                warn!("Worker GC failed: {}", e);
            }
            if let Err(e) = self.broker.cleanup_expired() {
                warn!("Retention cleanup failed: {}", e);
            }
        }
    }

    fn snapshot(&self, status: WorkerStatus) -> WorkerState {
        WorkerState {
            worker_id: self.worker_id.clone(),
            status,
            queues: self.config.queues.clone(),
            current_task: *self.current_task.lock(),
            last_heartbeat: now_ms(),
            tasks_completed: self.tasks_completed.load(Ordering::SeqCst),
            tasks_failed: self.tasks_failed.load(Ordering::SeqCst),
            started_at: self.started_at,
        }
    }

    fn write_state(&self, status: WorkerStatus) {
        if let Err(e) = self.broker.heartbeat(&self.snapshot(status)) {
            warn!(worker_id = %self.worker_id, "Failed to write worker state: {}", e);
        }
    }
}
