use crate::events::EventBus;
use crate::keys;
use crate::metrics::BrokerMetrics;
use chrono::{DateTime, Utc};
use futures::future::select_all;
use relayq_core::{
    backoff_delay, now_ms, with_jitter, DashboardSnapshot, QueueConfig, QueueCounts, QueueError,
    Result, Task, TaskEvent, TaskId, TaskStatus, WorkerCounts, WorkerState, WorkerStatus,
};
use relayq_store::{Cond, Engine, EngineConfig, Op, StoreError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Error string recorded when the sweep recovers a task from a vanished worker.
const SWEEP_ERROR: &str = "processing timed out";

/// Upper bound for `list_tasks` pages.
const MAX_PAGE: usize = 500;

/// The broker owns all durable state for tasks, queues, and workers, and is
/// the only component that touches the store. One per process; pass it by
/// `Arc` to anything that needs it.
pub struct Broker {
    engine: Arc<Engine>,
    events: EventBus,
    metrics: Arc<BrokerMetrics>,
    config: QueueConfig,
    shutdown: Arc<Notify>,
}

impl Broker {
    /// Open the broker over the embedded engine at `config.data_dir`.
    pub fn open(config: QueueConfig) -> Result<Self> {
        config.validate()?;

        let engine = Engine::open(EngineConfig {
            data_dir: config.data_dir.clone(),
            channel_capacity: config.event_channel_capacity,
        })
        .map_err(store_err)?;
        let engine = Arc::new(engine);

        let metrics = BrokerMetrics::new()
            .map_err(|e| QueueError::BrokerUnavailable(format!("metrics registry: {}", e)))?;

        info!(data_dir = ?config.data_dir, "Broker opened");

        Ok(Broker {
            events: EventBus::new(engine.clone()),
            engine,
            metrics: Arc::new(metrics),
            config,
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn metrics(&self) -> Arc<BrokerMetrics> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Stop background publishers spawned from this broker.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    // ------------------------------------------------------------------
    // Producer surface
    // ------------------------------------------------------------------

    /// Producer convenience: build, validate, and enqueue in one call.
    pub fn submit(
        &self,
        name: &str,
        payload: relayq_core::Payload,
        priority: u8,
        queue: &str,
        max_retries: u32,
    ) -> Result<TaskId> {
        let task = Task::builder(name)
            .payload(payload)
            .priority(priority)
            .queue(queue)
            .max_retries(max_retries)
            .build()?;
        self.enqueue(&task)?;
        Ok(task.id)
    }

    /// Persist a new pending task and make it visible to consumers.
    pub fn enqueue(&self, task: &Task) -> Result<()> {
        task.validate()?;
        if task.status != TaskStatus::Pending {
            return Err(QueueError::Conflict(format!(
                "task {} must be pending to enqueue, is {}",
                task.id, task.status
            )));
        }

        let task_key = keys::task(&task.id);
        let record = task.to_json()?;
        let committed = self
            .engine
            .apply_if(
                &[Cond::KvAbsent {
                    key: task_key.clone(),
                }],
                vec![
                    Op::Put {
                        key: task_key,
                        value: record,
                        ttl: None,
                    },
                    Op::ZAdd {
                        key: keys::pending(&task.queue),
                        member: task.id.to_string(),
                        score: task.priority.score(),
                    },
                    Op::SAdd {
                        key: keys::QUEUES.to_string(),
                        member: task.queue.clone(),
                    },
                ],
            )
            .map_err(store_err)?;

        if !committed {
            return Err(QueueError::Conflict(format!(
                "task {} already exists",
                task.id
            )));
        }

        debug!(task_id = %task.id, queue = %task.queue, priority = %task.priority, "Enqueued task");
        self.metrics.inc_task("pending", &task.queue);
        self.update_depth(&task.queue);
        self.events.publish_task_update(task);
        Ok(())
    }

    /// Block up to `timeout` for the highest-priority visible task across
    /// `queues`, scanned in the order supplied. Paused queues are skipped.
    /// Returns `None` on timeout.
    pub async fn dequeue(&self, queues: &[String], timeout: Duration) -> Result<Option<Task>> {
        if queues.is_empty() {
            return Err(QueueError::InvalidInput(
                "dequeue requires at least one queue".to_string(),
            ));
        }
        for queue in queues {
            validate_queue_name(queue)?;
        }

        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register wakeups before scanning so a concurrent enqueue between
            // the scan and the wait cannot be missed.
            let handles: Vec<_> = queues
                .iter()
                .flat_map(|q| {
                    [
                        self.engine.notify_handle(&keys::pending(q)),
                        self.engine.notify_handle(&keys::delayed(q)),
                    ]
                })
                .collect();
            let waiters: Vec<_> = handles
                .iter()
                .map(|h| {
                    let h = h.clone();
                    Box::pin(async move { h.notified().await })
                })
                .collect();

            let mut next_due_ms: Option<i64> = None;
            for queue in queues {
                self.promote_due(queue)?;
                if self.is_paused(queue) {
                    continue;
                }
                if let Some(task) = self.try_claim(queue)? {
                    return Ok(Some(task));
                }
                if let Some((_, due)) = self.engine.zpeek_min(&keys::delayed(queue)) {
                    next_due_ms = Some(next_due_ms.map_or(due, |d| d.min(due)));
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut wait = deadline - now;
            if let Some(due) = next_due_ms {
                let until_due = (due - Utc::now().timestamp_millis()).max(1) as u64;
                wait = wait.min(Duration::from_millis(until_due));
            }
            let _ = tokio::time::timeout(wait, select_all(waiters)).await;
        }
    }

    /// Record a successful handler run: processing -> completed.
    pub fn complete(&self, task: &Task, result: Value) -> Result<Task> {
        let now = now_ms();
        let next = task.clone().completed(result, now)?;
        let id = task.id.to_string();
        let committed = self
            .engine
            .apply_if(
                &[Cond::InSet {
                    key: keys::processing(&task.queue),
                    member: id.clone(),
                }],
                vec![
                    Op::Put {
                        key: keys::task(&task.id),
                        value: next.to_json()?,
                        ttl: Some(self.config.completed_retention()),
                    },
                    Op::SRem {
                        key: keys::processing(&task.queue),
                        member: id.clone(),
                    },
                    Op::HDel {
                        key: keys::processing_ts(&task.queue),
                        field: id.clone(),
                    },
                    Op::SAdd {
                        key: keys::completed(&task.queue),
                        member: id,
                    },
                ],
            )
            .map_err(store_err)?;

        if !committed {
            return Err(QueueError::Conflict(format!(
                "task {} is not processing in queue {}",
                task.id, task.queue
            )));
        }

        if let (Some(started), Some(done)) = (next.started_at, next.completed_at) {
            let secs = (done - started).num_milliseconds().max(0) as f64 / 1000.0;
            self.metrics.observe_duration(&next.name, secs);
        }
        self.metrics.inc_task("completed", &next.queue);
        self.update_depth(&next.queue);
        self.events.publish_task_update(&next);
        debug!(task_id = %next.id, "Task completed");
        Ok(next)
    }

    /// Record a failed handler run. With retries remaining the task becomes
    /// pending again, invisible until its backoff elapses; otherwise it is
    /// parked in the dead-letter set.
    pub fn fail(&self, task: &Task, error: &str) -> Result<Task> {
        if task.can_retry() {
            let next = task.clone().retried(error)?;
            let mut delay = backoff_delay(
                self.config.base_retry_delay(),
                self.config.max_retry_delay(),
                next.retries,
            );
            if self.config.retry_jitter {
                delay = with_jitter(delay);
            }
            let visible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            let id = task.id.to_string();
            let committed = self
                .engine
                .apply_if(
                    &[Cond::InSet {
                        key: keys::processing(&task.queue),
                        member: id.clone(),
                    }],
                    vec![
                        Op::Put {
                            key: keys::task(&task.id),
                            value: next.to_json()?,
                            ttl: None,
                        },
                        Op::SRem {
                            key: keys::processing(&task.queue),
                            member: id.clone(),
                        },
                        Op::HDel {
                            key: keys::processing_ts(&task.queue),
                            field: id.clone(),
                        },
                        Op::ZAdd {
                            key: keys::delayed(&task.queue),
                            member: id,
                            score: visible_at,
                        },
                    ],
                )
                .map_err(store_err)?;

            if !committed {
                return Err(QueueError::Conflict(format!(
                    "task {} is not processing in queue {}",
                    task.id, task.queue
                )));
            }

            debug!(
                task_id = %next.id,
                retries = next.retries,
                delay_ms = delay.as_millis() as u64,
                "Task failed, scheduled for retry"
            );
            self.metrics.inc_task("retried", &next.queue);
            self.update_depth(&next.queue);
            self.events.publish_task_update(&next);
            Ok(next)
        } else {
            self.exhaust(task, error)
        }
    }

    /// Park a task without consuming retries: the non-retryable failure path
    /// (unknown handler, cancelled mid-flight).
    pub fn dead_letter(&self, task: &Task, error: &str) -> Result<Task> {
        self.exhaust(task, error)
    }

    fn exhaust(&self, task: &Task, error: &str) -> Result<Task> {
        let now = now_ms();
        let next = task.clone().exhausted(error, now)?;
        let id = task.id.to_string();
        let committed = self
            .engine
            .apply_if(
                &[Cond::InSet {
                    key: keys::processing(&task.queue),
                    member: id.clone(),
                }],
                vec![
                    Op::Put {
                        key: keys::task(&task.id),
                        value: next.to_json()?,
                        ttl: Some(self.config.completed_retention()),
                    },
                    Op::SRem {
                        key: keys::processing(&task.queue),
                        member: id.clone(),
                    },
                    Op::HDel {
                        key: keys::processing_ts(&task.queue),
                        field: id.clone(),
                    },
                    Op::SAdd {
                        key: keys::failed(&task.queue),
                        member: id.clone(),
                    },
                    Op::ZAdd {
                        key: keys::dlq(&task.queue),
                        member: id,
                        score: now.timestamp_millis(),
                    },
                ],
            )
            .map_err(store_err)?;

        if !committed {
            return Err(QueueError::Conflict(format!(
                "task {} is not processing in queue {}",
                task.id, task.queue
            )));
        }

        warn!(task_id = %next.id, error = %error, "Task moved to dead letter");
        self.metrics.inc_task("failed", &next.queue);
        self.update_depth(&next.queue);
        self.events.publish_task_update(&next);
        Ok(next)
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        match self.engine.get(&keys::task(id)) {
            Some(raw) => Ok(Some(Task::from_json(&raw)?)),
            None => Ok(None),
        }
    }

    /// Cancel a task. Pending tasks are atomically parked in the dead-letter
    /// set; processing tasks get a cooperative flag the handler may honor.
    /// Returns whether the cancellation took effect.
    pub fn cancel_task(&self, id: &TaskId) -> Result<bool> {
        let task = self
            .get_task(id)?
            .ok_or_else(|| QueueError::NotFound(format!("task {}", id)))?;
        let member = id.to_string();

        match task.status {
            TaskStatus::Pending => {
                let next = task.clone().cancelled(now_ms())?;
                let park = |source: Op, guard: Cond| -> Result<bool> {
                    self.engine
                        .apply_if(
                            &[guard],
                            vec![
                                Op::Put {
                                    key: keys::task(id),
                                    value: next.to_json()?,
                                    ttl: Some(self.config.completed_retention()),
                                },
                                source,
                                Op::SAdd {
                                    key: keys::failed(&task.queue),
                                    member: member.clone(),
                                },
                                Op::ZAdd {
                                    key: keys::dlq(&task.queue),
                                    member: member.clone(),
                                    score: Utc::now().timestamp_millis(),
                                },
                            ],
                        )
                        .map_err(store_err)
                };

                // The id is in exactly one of pending or delayed.
                let committed = park(
                    Op::ZRem {
                        key: keys::pending(&task.queue),
                        member: member.clone(),
                    },
                    Cond::InZSet {
                        key: keys::pending(&task.queue),
                        member: member.clone(),
                    },
                )? || park(
                    Op::ZRem {
                        key: keys::delayed(&task.queue),
                        member: member.clone(),
                    },
                    Cond::InZSet {
                        key: keys::delayed(&task.queue),
                        member: member.clone(),
                    },
                )?;

                if committed {
                    self.metrics.inc_task("cancelled", &task.queue);
                    self.update_depth(&task.queue);
                    self.events.publish_task_update(&next);
                }
                Ok(committed)
            }
            TaskStatus::Processing => {
                // Cooperative: flag the record; if the handler finishes first,
                // completion wins.
                let mut flagged = task.clone();
                flagged.cancel_requested = true;
                let committed = self
                    .engine
                    .apply_if(
                        &[Cond::InSet {
                            key: keys::processing(&task.queue),
                            member,
                        }],
                        vec![Op::Put {
                            key: keys::task(id),
                            value: flagged.to_json()?,
                            ttl: None,
                        }],
                    )
                    .map_err(store_err)?;
                if committed {
                    self.events.publish_task_update(&flagged);
                }
                Ok(committed)
            }
            TaskStatus::Completed | TaskStatus::Failed => Ok(false),
        }
    }

    /// Re-enqueue a terminal task with retries reset. Administrative.
    pub fn retry_task(&self, id: &TaskId) -> Result<bool> {
        let task = self
            .get_task(id)?
            .ok_or_else(|| QueueError::NotFound(format!("task {}", id)))?;
        if !task.status.is_terminal() {
            return Ok(false);
        }

        let prior_status = task.status;
        let next = task.requeued()?;
        let member = id.to_string();

        let (guard, mut removals) = match prior_status {
            TaskStatus::Completed => (
                Cond::InSet {
                    key: keys::completed(&next.queue),
                    member: member.clone(),
                },
                vec![Op::SRem {
                    key: keys::completed(&next.queue),
                    member: member.clone(),
                }],
            ),
            _ => (
                Cond::InSet {
                    key: keys::failed(&next.queue),
                    member: member.clone(),
                },
                vec![
                    Op::SRem {
                        key: keys::failed(&next.queue),
                        member: member.clone(),
                    },
                    Op::ZRem {
                        key: keys::dlq(&next.queue),
                        member: member.clone(),
                    },
                ],
            ),
        };

        let mut ops = vec![
            Op::Put {
                key: keys::task(id),
                value: next.to_json()?,
                ttl: None,
            },
            Op::ZAdd {
                key: keys::pending(&next.queue),
                member,
                score: next.priority.score(),
            },
            Op::SAdd {
                key: keys::QUEUES.to_string(),
                member: next.queue.clone(),
            },
        ];
        ops.append(&mut removals);

        let committed = self.engine.apply_if(&[guard], ops).map_err(store_err)?;
        if committed {
            info!(task_id = %id, "Task requeued");
            self.metrics.inc_task("pending", &next.queue);
            self.update_depth(&next.queue);
            self.events.publish_task_update(&next);
        }
        Ok(committed)
    }

    // ------------------------------------------------------------------
    // Observer surface
    // ------------------------------------------------------------------

    /// Paginated listing. Pending tasks come first in priority-then-insertion
    /// order (backoff tasks after, by due time); other statuses list in
    /// insertion order. `limit` is clamped to 1..=500.
    pub fn list_tasks(
        &self,
        queue: &str,
        status: Option<TaskStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Task>, u64)> {
        validate_queue_name(queue)?;
        let limit = limit.clamp(1, MAX_PAGE);

        let ids: Vec<String> = match status {
            Some(TaskStatus::Pending) => self.pending_ids(queue),
            Some(TaskStatus::Processing) => self.engine.smembers(&keys::processing(queue)),
            Some(TaskStatus::Completed) => self.engine.smembers(&keys::completed(queue)),
            Some(TaskStatus::Failed) => self.engine.smembers(&keys::failed(queue)),
            None => {
                let mut all = self.pending_ids(queue);
                all.extend(self.engine.smembers(&keys::processing(queue)));
                all.extend(self.engine.smembers(&keys::completed(queue)));
                all.extend(self.engine.smembers(&keys::failed(queue)));
                all
            }
        };

        let total = ids.len() as u64;
        let mut page = Vec::new();
        for member in ids.into_iter().skip(offset).take(limit) {
            let Ok(id) = Uuid::parse_str(&member) else {
                continue;
            };
            if let Some(task) = self.get_task(&id)? {
                page.push(task);
            }
        }
        Ok((page, total))
    }

    fn pending_ids(&self, queue: &str) -> Vec<String> {
        let mut ids = self.engine.zrange(&keys::pending(queue), 0, usize::MAX);
        ids.extend(self.engine.zrange(&keys::delayed(queue), 0, usize::MAX));
        ids
    }

    /// O(1) counts from set cardinalities.
    pub fn queue_stats(&self, queue: &str) -> Result<QueueCounts> {
        validate_queue_name(queue)?;
        let pending = self.engine.zcard(&keys::pending(queue))
            + self.engine.zcard(&keys::delayed(queue));
        let processing = self.engine.scard(&keys::processing(queue));
        let completed = self.engine.scard(&keys::completed(queue));
        let failed = self.engine.scard(&keys::failed(queue));
        Ok(QueueCounts {
            queue_name: queue.to_string(),
            pending,
            processing,
            completed,
            failed,
            total: pending + processing + completed + failed,
            paused: self.is_paused(queue),
        })
    }

    pub fn list_queues(&self) -> Vec<String> {
        self.engine.smembers(keys::QUEUES)
    }

    // ------------------------------------------------------------------
    // Administrative surface
    // ------------------------------------------------------------------

    pub fn pause(&self, queue: &str) -> Result<()> {
        validate_queue_name(queue)?;
        self.engine
            .apply(vec![
                Op::Put {
                    key: keys::paused(queue),
                    value: "1".to_string(),
                    ttl: None,
                },
                Op::SAdd {
                    key: keys::QUEUES.to_string(),
                    member: queue.to_string(),
                },
            ])
            .map_err(store_err)?;
        info!(queue = %queue, "Queue paused");
        Ok(())
    }

    pub fn resume(&self, queue: &str) -> Result<()> {
        validate_queue_name(queue)?;
        self.engine
            .apply(vec![Op::Del {
                key: keys::paused(queue),
            }])
            .map_err(store_err)?;
        // Wake consumers parked on the queue.
        self.engine.touch(&keys::pending(queue));
        info!(queue = %queue, "Queue resumed");
        Ok(())
    }

    fn is_paused(&self, queue: &str) -> bool {
        self.engine.get(&keys::paused(queue)).is_some()
    }

    /// Drop every dead-letter task of a queue, records included.
    pub fn purge_dead_letter(&self, queue: &str) -> Result<u64> {
        validate_queue_name(queue)?;
        let members = self.engine.zrange(&keys::dlq(queue), 0, usize::MAX);
        if members.is_empty() {
            return Ok(0);
        }

        let mut ops = Vec::with_capacity(members.len() * 3);
        for member in &members {
            ops.push(Op::ZRem {
                key: keys::dlq(queue),
                member: member.clone(),
            });
            ops.push(Op::SRem {
                key: keys::failed(queue),
                member: member.clone(),
            });
            if let Ok(id) = Uuid::parse_str(member) {
                ops.push(Op::Del {
                    key: keys::task(&id),
                });
            }
        }
        self.engine.apply(ops).map_err(store_err)?;

        for member in &members {
            if let Ok(id) = Uuid::parse_str(member) {
                self.events.publish_task_deleted(id, TaskStatus::Failed);
            }
        }
        info!(queue = %queue, count = members.len(), "Purged dead letter queue");
        Ok(members.len() as u64)
    }

    /// Move one id from the dead-letter set back to pending, retries reset.
    pub fn requeue_dead_letter(&self, id: &TaskId) -> Result<bool> {
        let Some(task) = self.get_task(id)? else {
            return Ok(false);
        };
        if task.status != TaskStatus::Failed {
            return Ok(false);
        }
        self.retry_task(id)
    }

    // ------------------------------------------------------------------
    // Worker registry
    // ------------------------------------------------------------------

    pub fn register_worker(&self, state: &WorkerState) -> Result<()> {
        self.write_worker(state)?;
        info!(worker_id = %state.worker_id, queues = ?state.queues, "Worker registered");
        self.metrics
            .workers_registered
            .set(self.engine.scard(keys::WORKERS) as i64);
        Ok(())
    }

    pub fn heartbeat(&self, state: &WorkerState) -> Result<()> {
        self.write_worker(state)
    }

    fn write_worker(&self, state: &WorkerState) -> Result<()> {
        let record = serde_json::to_string(state)
            .map_err(|e| QueueError::InvalidInput(format!("unserializable worker state: {}", e)))?;
        self.engine
            .apply(vec![
                Op::Put {
                    key: keys::worker(&state.worker_id),
                    value: record,
                    ttl: None,
                },
                Op::SAdd {
                    key: keys::WORKERS.to_string(),
                    member: state.worker_id.clone(),
                },
            ])
            .map_err(store_err)
    }

    pub fn unregister_worker(&self, worker_id: &str) -> Result<()> {
        self.engine
            .apply(vec![
                Op::Del {
                    key: keys::worker(worker_id),
                },
                Op::SRem {
                    key: keys::WORKERS.to_string(),
                    member: worker_id.to_string(),
                },
            ])
            .map_err(store_err)?;
        self.metrics
            .workers_registered
            .set(self.engine.scard(keys::WORKERS) as i64);
        Ok(())
    }

    pub fn list_workers(&self) -> Result<Vec<WorkerState>> {
        let mut workers = Vec::new();
        for id in self.engine.smembers(keys::WORKERS) {
            if let Some(raw) = self.engine.get(&keys::worker(&id)) {
                match serde_json::from_str(&raw) {
                    Ok(state) => workers.push(state),
                    Err(e) => warn!(worker_id = %id, "Skipping corrupt worker record: {}", e),
                }
            }
        }
        Ok(workers)
    }

    pub fn worker_stats(&self, worker_id: &str) -> Result<WorkerState> {
        let raw = self
            .engine
            .get(&keys::worker(worker_id))
            .ok_or_else(|| QueueError::NotFound(format!("worker {}", worker_id)))?;
        serde_json::from_str(&raw)
            .map_err(|e| QueueError::BrokerUnavailable(format!("corrupt worker record: {}", e)))
    }

    /// Remove worker records whose heartbeat is older than `max_age`.
    pub fn gc_stale_workers(&self, max_age: Duration) -> Result<Vec<String>> {
        let now = now_ms();
        let cutoff = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let mut removed = Vec::new();
        for state in self.list_workers()? {
            if now - state.last_heartbeat > cutoff {
                warn!(worker_id = %state.worker_id, "Garbage-collecting stale worker record");
                self.unregister_worker(&state.worker_id)?;
                removed.push(state.worker_id);
            }
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Fault-handle every task whose processing entry is older than
    /// `now - max_age`, as if its worker had failed. Idempotent: the move out
    /// of processing is conditional on the entry being unchanged, so a task
    /// that completes (or is swept by a peer) concurrently is not recovered
    /// twice. Returns the affected tasks.
    pub fn sweep_stale(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<Vec<Task>> {
        validate_queue_name(queue)?;
        self.promote_due(queue)?;

        let cutoff = now.timestamp_millis() - max_age.as_millis() as i64;
        let mut recovered = Vec::new();

        for (member, ts_raw) in self.engine.hgetall(&keys::processing_ts(queue)) {
            let Ok(ts) = ts_raw.parse::<i64>() else {
                continue;
            };
            if ts > cutoff {
                continue;
            }
            let Ok(id) = Uuid::parse_str(&member) else {
                continue;
            };
            let Some(task) = self.get_task(&id)? else {
                // Record gone; drop the orphaned membership.
                self.engine
                    .apply(vec![
                        Op::SRem {
                            key: keys::processing(queue),
                            member: member.clone(),
                        },
                        Op::HDel {
                            key: keys::processing_ts(queue),
                            field: member.clone(),
                        },
                    ])
                    .map_err(store_err)?;
                continue;
            };
            if task.status != TaskStatus::Processing {
                continue;
            }

            let guard = Cond::HashFieldEquals {
                key: keys::processing_ts(queue),
                field: member.clone(),
                value: ts_raw.clone(),
            };

            let committed = if task.can_retry() {
                let next = task.clone().retried(SWEEP_ERROR)?;
                let mut delay = backoff_delay(
                    self.config.base_retry_delay(),
                    self.config.max_retry_delay(),
                    next.retries,
                );
                if self.config.retry_jitter {
                    delay = with_jitter(delay);
                }
                let visible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
                let committed = self
                    .engine
                    .apply_if(
                        &[guard],
                        vec![
                            Op::Put {
                                key: keys::task(&id),
                                value: next.to_json()?,
                                ttl: None,
                            },
                            Op::SRem {
                                key: keys::processing(queue),
                                member: member.clone(),
                            },
                            Op::HDel {
                                key: keys::processing_ts(queue),
                                field: member.clone(),
                            },
                            Op::ZAdd {
                                key: keys::delayed(queue),
                                member: member.clone(),
                                score: visible_at,
                            },
                        ],
                    )
                    .map_err(store_err)?;
                if committed {
                    warn!(task_id = %id, retries = next.retries, "Swept stale task back to pending");
                    self.metrics.inc_task("retried", queue);
                    self.events.publish_task_update(&next);
                    recovered.push(next);
                }
                committed
            } else {
                let stamp = now_ms();
                let next = task.clone().exhausted(SWEEP_ERROR, stamp)?;
                let committed = self
                    .engine
                    .apply_if(
                        &[guard],
                        vec![
                            Op::Put {
                                key: keys::task(&id),
                                value: next.to_json()?,
                                ttl: Some(self.config.completed_retention()),
                            },
                            Op::SRem {
                                key: keys::processing(queue),
                                member: member.clone(),
                            },
                            Op::HDel {
                                key: keys::processing_ts(queue),
                                field: member.clone(),
                            },
                            Op::SAdd {
                                key: keys::failed(queue),
                                member: member.clone(),
                            },
                            Op::ZAdd {
                                key: keys::dlq(queue),
                                member: member.clone(),
                                score: stamp.timestamp_millis(),
                            },
                        ],
                    )
                    .map_err(store_err)?;
                if committed {
                    warn!(task_id = %id, "Swept stale task to dead letter");
                    self.metrics.inc_task("failed", queue);
                    self.events.publish_task_update(&next);
                    recovered.push(next);
                }
                committed
            };
            if committed {
                self.update_depth(queue);
            }
        }

        Ok(recovered)
    }

    /// Drop expired completed/failed records and their set memberships.
    pub fn cleanup_expired(&self) -> Result<u64> {
        let dropped = self.engine.purge_expired().map_err(store_err)?;
        let mut count = 0u64;
        for (key, value) in dropped {
            let Some(_) = key.strip_prefix("task:") else {
                continue;
            };
            let Ok(task) = Task::from_json(&value) else {
                continue;
            };
            let member = task.id.to_string();
            self.engine
                .apply(vec![
                    Op::SRem {
                        key: keys::completed(&task.queue),
                        member: member.clone(),
                    },
                    Op::SRem {
                        key: keys::failed(&task.queue),
                        member: member.clone(),
                    },
                    Op::ZRem {
                        key: keys::dlq(&task.queue),
                        member,
                    },
                ])
                .map_err(store_err)?;
            self.events.publish_task_deleted(task.id, task.status);
            count += 1;
        }
        if count > 0 {
            debug!(count, "Dropped expired task records");
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Event fan-out
    // ------------------------------------------------------------------

    /// Live status transitions for one task, from subscription time on.
    pub fn subscribe_task(&self, id: &TaskId) -> impl Stream<Item = TaskEvent> + Send + Unpin {
        self.events.subscribe_task(id)
    }

    /// Periodic aggregate snapshots; produced while a dashboard publisher runs.
    pub fn subscribe_dashboard(&self) -> impl Stream<Item = DashboardSnapshot> + Send + Unpin {
        self.events.subscribe_dashboard()
    }

    /// Current per-queue counts and worker totals.
    pub fn dashboard_snapshot(&self) -> Result<DashboardSnapshot> {
        let mut queues = Vec::new();
        for queue in self.list_queues() {
            queues.push(self.queue_stats(&queue)?);
        }

        let interval = self.config.heartbeat_interval();
        let now = now_ms();
        let mut counts = WorkerCounts::default();
        for state in self.list_workers()? {
            counts.total += 1;
            if !state.is_alive(interval, now) {
                continue;
            }
            counts.active += 1;
            match state.status {
                WorkerStatus::Busy => counts.busy += 1,
                WorkerStatus::Idle => counts.idle += 1,
                _ => {}
            }
        }

        Ok(DashboardSnapshot::new(queues, counts, now))
    }

    /// Spawn the periodic dashboard publisher. Stopped by `shutdown`.
    pub fn spawn_dashboard_publisher(self: &Arc<Self>) -> JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(broker.config.dashboard_period());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match broker.dashboard_snapshot() {
                            Ok(snapshot) => broker.events.publish_dashboard(&snapshot),
                            Err(e) => warn!("Dashboard snapshot failed: {}", e),
                        }
                    }
                    _ = broker.shutdown.notified() => break,
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Move due backoff tasks back into pending with their original priority
    /// score.
    fn promote_due(&self, queue: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        for (member, _) in self.engine.zrange_by_score_upto(&keys::delayed(queue), now) {
            let Ok(id) = Uuid::parse_str(&member) else {
                continue;
            };
            let Some(task) = self.get_task(&id)? else {
                self.engine
                    .apply(vec![Op::ZRem {
                        key: keys::delayed(queue),
                        member,
                    }])
                    .map_err(store_err)?;
                continue;
            };
            self.engine
                .apply_if(
                    &[Cond::InZSet {
                        key: keys::delayed(queue),
                        member: member.clone(),
                    }],
                    vec![
                        Op::ZRem {
                            key: keys::delayed(queue),
                            member: member.clone(),
                        },
                        Op::ZAdd {
                            key: keys::pending(queue),
                            member,
                            score: task.priority.score(),
                        },
                    ],
                )
                .map_err(store_err)?;
        }
        Ok(())
    }

    /// Claim the head of a queue's pending set. Loops past candidates lost to
    /// racing consumers; returns `None` once the set is drained.
    fn try_claim(&self, queue: &str) -> Result<Option<Task>> {
        loop {
            let Some((member, _)) = self.engine.zpeek_min(&keys::pending(queue)) else {
                return Ok(None);
            };
            let Ok(id) = Uuid::parse_str(&member) else {
                self.drop_pending_member(queue, &member)?;
                continue;
            };
            let Some(task) = self.get_task(&id)? else {
                warn!(task_id = %member, queue = %queue, "Pending id without record, dropping");
                self.drop_pending_member(queue, &member)?;
                continue;
            };
            if task.status != TaskStatus::Pending {
                warn!(task_id = %id, status = %task.status, "Pending set out of step with record, dropping");
                self.drop_pending_member(queue, &member)?;
                continue;
            }

            let now = now_ms();
            let next = task.started(now)?;
            let committed = self
                .engine
                .apply_if(
                    &[Cond::InZSet {
                        key: keys::pending(queue),
                        member: member.clone(),
                    }],
                    vec![
                        Op::ZRem {
                            key: keys::pending(queue),
                            member: member.clone(),
                        },
                        Op::Put {
                            key: keys::task(&id),
                            value: next.to_json()?,
                            ttl: None,
                        },
                        Op::SAdd {
                            key: keys::processing(queue),
                            member: member.clone(),
                        },
                        Op::HSet {
                            key: keys::processing_ts(queue),
                            field: member,
                            value: now.timestamp_millis().to_string(),
                        },
                    ],
                )
                .map_err(store_err)?;

            if committed {
                debug!(task_id = %id, queue = %queue, "Task claimed");
                self.metrics.inc_task("processing", queue);
                self.update_depth(queue);
                self.events.publish_task_update(&next);
                return Ok(Some(next));
            }
            // Lost the race for this member; try the next one.
        }
    }

    fn drop_pending_member(&self, queue: &str, member: &str) -> Result<()> {
        self.engine
            .apply(vec![Op::ZRem {
                key: keys::pending(queue),
                member: member.to_string(),
            }])
            .map_err(store_err)
    }

    fn update_depth(&self, queue: &str) {
        let pending = self.engine.zcard(&keys::pending(queue))
            + self.engine.zcard(&keys::delayed(queue));
        let processing = self.engine.scard(&keys::processing(queue));
        self.metrics
            .set_depth(queue, pending as i64, processing as i64);
    }
}

fn store_err(e: StoreError) -> QueueError {
    QueueError::BrokerUnavailable(e.to_string())
}

fn validate_queue_name(queue: &str) -> Result<()> {
    relayq_core::validate_queue(queue)
}
