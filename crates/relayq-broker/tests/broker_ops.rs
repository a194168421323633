//! Broker contract tests over the embedded engine: ordering, membership,
//! retry visibility, recovery, pause, fan-out.

use relayq_broker::Broker;
use relayq_core::{
    now_ms, Payload, QueueConfig, QueueError, Task, TaskStatus, WorkerState, WorkerStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_stream::StreamExt;

fn test_config(dir: &TempDir) -> QueueConfig {
    QueueConfig {
        data_dir: dir.path().to_path_buf(),
        base_retry_delay_ms: 100,
        max_retry_delay_ms: 2_000,
        retry_jitter: false,
        completed_retention_ms: 60_000,
        heartbeat_interval_ms: 100,
        dashboard_period_ms: 50,
        ..Default::default()
    }
}

fn open_broker(dir: &TempDir) -> Arc<Broker> {
    Arc::new(Broker::open(test_config(dir)).unwrap())
}

fn make_task(name: &str, priority: u8) -> Task {
    Task::builder(name).priority(priority).build().unwrap()
}

/// Times the task id appears across the queue's status listings. The
/// membership invariant requires exactly 1 for any live task.
fn membership_count(broker: &Broker, queue: &str, task: &Task) -> usize {
    [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ]
    .iter()
    .map(|status| {
        let (tasks, _) = broker.list_tasks(queue, Some(*status), 500, 0).unwrap();
        tasks.iter().filter(|t| t.id == task.id).count()
    })
    .sum()
}

#[tokio::test]
async fn enqueue_then_dequeue_round_trips() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    let mut payload = Payload::new();
    payload.insert("answer".to_string(), json!(42));
    let task = Task::builder("noop").payload(payload).build().unwrap();
    broker.enqueue(&task).unwrap();

    let got = broker
        .dequeue(&["default".to_string()], Duration::from_secs(1))
        .await
        .unwrap()
        .expect("task should be delivered");

    // Equal to the enqueued task except for the claim markers.
    assert_eq!(got.id, task.id);
    assert_eq!(got.name, task.name);
    assert_eq!(got.payload, task.payload);
    assert_eq!(got.priority, task.priority);
    assert_eq!(got.status, TaskStatus::Processing);
    assert!(got.started_at.is_some());

    // Queue is drained now.
    let none = broker
        .dequeue(&["default".to_string()], Duration::from_millis(100))
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn submit_validates_fields_and_returns_the_id() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    let id = broker.submit("report", Payload::new(), 7, "reports", 1).unwrap();
    let task = broker.get_task(&id).unwrap().unwrap();
    assert_eq!(task.queue, "reports");
    assert_eq!(task.priority.value(), 7);
    assert_eq!(task.max_retries, 1);

    assert!(matches!(
        broker.submit("bad name!", Payload::new(), 5, "default", 0),
        Err(QueueError::InvalidInput(_))
    ));
    assert!(matches!(
        broker.submit("ok", Payload::new(), 11, "default", 0),
        Err(QueueError::InvalidInput(_))
    ));
    assert!(matches!(
        broker.submit("ok", Payload::new(), 5, "Bad_Queue", 0),
        Err(QueueError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn duplicate_id_is_a_conflict() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    let task = make_task("noop", 5);
    broker.enqueue(&task).unwrap();
    assert!(matches!(
        broker.enqueue(&task),
        Err(QueueError::Conflict(_))
    ));
}

#[tokio::test]
async fn priority_wins_fifo_breaks_ties() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    let a = make_task("noop", 1);
    let b = make_task("noop", 5);
    let c = make_task("noop", 10);
    let d = make_task("noop", 5);
    for task in [&a, &b, &c, &d] {
        broker.enqueue(task).unwrap();
    }

    let mut order = Vec::new();
    while let Some(task) = broker
        .dequeue(&["default".to_string()], Duration::from_millis(100))
        .await
        .unwrap()
    {
        order.push(task.id);
    }
    assert_eq!(order, vec![c.id, b.id, d.id, a.id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_consumers_no_loss_no_duplicates() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    let total = 24usize;
    let mut expected = std::collections::HashSet::new();
    for i in 0..total {
        let task = make_task("noop", (i % 10 + 1) as u8);
        expected.insert(task.id);
        broker.enqueue(&task).unwrap();
    }

    let mut consumers = Vec::new();
    for _ in 0..4 {
        let broker = broker.clone();
        consumers.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(task) = broker
                .dequeue(&["default".to_string()], Duration::from_millis(200))
                .await
                .unwrap()
            {
                claimed.push(task.id);
            }
            claimed
        }));
    }

    let mut seen = Vec::new();
    for consumer in consumers {
        seen.extend(consumer.await.unwrap());
    }

    assert_eq!(seen.len(), total, "every task delivered exactly once");
    assert_eq!(
        seen.iter().collect::<std::collections::HashSet<_>>().len(),
        total
    );
    assert_eq!(seen.into_iter().collect::<std::collections::HashSet<_>>(), expected);
}

#[tokio::test]
async fn membership_is_exactly_one_through_lifecycle() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    let task = Task::builder("noop").max_retries(1).build().unwrap();
    broker.enqueue(&task).unwrap();
    assert_eq!(membership_count(&broker, "default", &task), 1);

    let claimed = broker
        .dequeue(&["default".to_string()], Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(membership_count(&broker, "default", &task), 1);

    let retried = broker.fail(&claimed, "boom").unwrap();
    assert_eq!(retried.retries, 1);
    assert_eq!(membership_count(&broker, "default", &task), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let claimed = broker
        .dequeue(&["default".to_string()], Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(membership_count(&broker, "default", &task), 1);

    let done = broker.complete(&claimed, json!({"ok": true})).unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(membership_count(&broker, "default", &task), 1);
}

#[tokio::test]
async fn retry_is_invisible_until_backoff_elapses() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    let task = make_task("flaky", 5);
    broker.enqueue(&task).unwrap();

    let claimed = broker
        .dequeue(&["default".to_string()], Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    let retried = broker.fail(&claimed, "first failure").unwrap();
    assert_eq!(retried.status, TaskStatus::Pending);
    assert_eq!(retried.retries, 1);

    // Backoff for retry 1 is 100ms: not visible yet.
    let early = broker
        .dequeue(&["default".to_string()], Duration::from_millis(30))
        .await
        .unwrap();
    assert!(early.is_none(), "task visible before backoff elapsed");

    // A blocking dequeue outlasting the backoff picks it up.
    let late = broker
        .dequeue(&["default".to_string()], Duration::from_secs(2))
        .await
        .unwrap()
        .expect("task should become visible after backoff");
    assert_eq!(late.id, task.id);
    assert_eq!(late.retries, 1);

    // Second failure doubles the delay.
    let retried = broker.fail(&late, "second failure").unwrap();
    assert_eq!(retried.retries, 2);
    let early = broker
        .dequeue(&["default".to_string()], Duration::from_millis(80))
        .await
        .unwrap();
    assert!(early.is_none());
    let late = broker
        .dequeue(&["default".to_string()], Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(late.retries, 2);
}

#[tokio::test]
async fn exhausted_task_parks_in_dead_letter() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    let task = Task::builder("always_fails").max_retries(0).build().unwrap();
    broker.enqueue(&task).unwrap();

    let claimed = broker
        .dequeue(&["default".to_string()], Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    let failed = broker.fail(&claimed, "fatal").unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("fatal"));

    let stats = broker.queue_stats("default").unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 0);

    // Terminal: no further delivery.
    let none = broker
        .dequeue(&["default".to_string()], Duration::from_millis(100))
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn unknown_handler_dead_letters_without_consuming_retries() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    let task = make_task("nobody_home", 5);
    broker.enqueue(&task).unwrap();
    let claimed = broker
        .dequeue(&["default".to_string()], Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    let parked = broker
        .dead_letter(&claimed, "No handler registered for task: nobody_home")
        .unwrap();
    assert_eq!(parked.status, TaskStatus::Failed);
    assert_eq!(parked.retries, 0);
}

#[tokio::test]
async fn paused_queue_blocks_until_resume() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    let task = make_task("noop", 5);
    broker.enqueue(&task).unwrap();
    broker.pause("default").unwrap();
    assert!(broker.queue_stats("default").unwrap().paused);

    let none = broker
        .dequeue(&["default".to_string()], Duration::from_millis(200))
        .await
        .unwrap();
    assert!(none.is_none(), "paused queue must not deliver");

    // A parked consumer is woken by resume, well before its own deadline.
    let waiter = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .dequeue(&["default".to_string()], Duration::from_secs(10))
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    broker.resume("default").unwrap();

    let got = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("resume should release the parked consumer")
        .unwrap()
        .expect("task should be delivered after resume");
    assert_eq!(got.id, task.id);
}

#[tokio::test]
async fn cancel_pending_is_atomic_cancel_processing_is_cooperative() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    // Pending: removed from the queue and parked.
    let pending = make_task("noop", 5);
    broker.enqueue(&pending).unwrap();
    assert!(broker.cancel_task(&pending.id).unwrap());
    let record = broker.get_task(&pending.id).unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("cancelled"));
    assert!(broker
        .dequeue(&["default".to_string()], Duration::from_millis(100))
        .await
        .unwrap()
        .is_none());

    // Processing: only flagged; completion wins.
    let running = make_task("noop", 5);
    broker.enqueue(&running).unwrap();
    let claimed = broker
        .dequeue(&["default".to_string()], Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert!(broker.cancel_task(&running.id).unwrap());
    assert!(broker.get_task(&running.id).unwrap().unwrap().cancel_requested);

    let done = broker.complete(&claimed, json!("finished")).unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(
        broker.get_task(&running.id).unwrap().unwrap().status,
        TaskStatus::Completed
    );

    // Terminal tasks cannot be cancelled.
    assert!(!broker.cancel_task(&running.id).unwrap());
}

#[tokio::test]
async fn dead_letter_requeue_and_purge() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    let task = Task::builder("always_fails").max_retries(0).build().unwrap();
    broker.enqueue(&task).unwrap();
    let claimed = broker
        .dequeue(&["default".to_string()], Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    broker.fail(&claimed, "fatal").unwrap();

    // Requeue resets retries and clears the outcome.
    assert!(broker.requeue_dead_letter(&task.id).unwrap());
    let requeued = broker.get_task(&task.id).unwrap().unwrap();
    assert_eq!(requeued.status, TaskStatus::Pending);
    assert_eq!(requeued.retries, 0);
    assert!(requeued.error.is_none());

    // Exhaust again, then purge: the record goes too.
    let claimed = broker
        .dequeue(&["default".to_string()], Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    broker.fail(&claimed, "fatal again").unwrap();
    assert_eq!(broker.purge_dead_letter("default").unwrap(), 1);
    assert!(broker.get_task(&task.id).unwrap().is_none());
    assert_eq!(broker.queue_stats("default").unwrap().failed, 0);
}

#[tokio::test]
async fn retry_task_requeues_completed_tasks() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    let task = make_task("noop", 5);
    broker.enqueue(&task).unwrap();
    let claimed = broker
        .dequeue(&["default".to_string()], Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    broker.complete(&claimed, json!(1)).unwrap();

    assert!(broker.retry_task(&task.id).unwrap());
    let requeued = broker.get_task(&task.id).unwrap().unwrap();
    assert_eq!(requeued.status, TaskStatus::Pending);
    assert!(requeued.result.is_none());

    // Not terminal anymore: a second retry_task is a no-op.
    assert!(!broker.retry_task(&task.id).unwrap());
}

#[tokio::test]
async fn sweep_recovers_stale_processing_and_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    let task = make_task("noop", 5);
    broker.enqueue(&task).unwrap();
    broker
        .dequeue(&["default".to_string()], Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    // Entry is stale relative to a zero max age.
    let swept = broker
        .sweep_stale("default", now_ms() + chrono::Duration::seconds(1), Duration::ZERO)
        .unwrap();
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].status, TaskStatus::Pending);
    assert_eq!(swept[0].retries, 1);

    // Idempotent: nothing left in processing to recover.
    let swept = broker
        .sweep_stale("default", now_ms() + chrono::Duration::seconds(1), Duration::ZERO)
        .unwrap();
    assert!(swept.is_empty());

    assert_eq!(broker.queue_stats("default").unwrap().processing, 0);
    assert_eq!(broker.queue_stats("default").unwrap().pending, 1);
}

#[tokio::test]
async fn sweep_does_not_recover_completed_tasks() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    let task = make_task("noop", 5);
    broker.enqueue(&task).unwrap();
    let claimed = broker
        .dequeue(&["default".to_string()], Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    broker.complete(&claimed, json!(null)).unwrap();

    let swept = broker
        .sweep_stale("default", now_ms() + chrono::Duration::seconds(1), Duration::ZERO)
        .unwrap();
    assert!(swept.is_empty());
    assert_eq!(
        broker.get_task(&task.id).unwrap().unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn sweep_dead_letters_exhausted_tasks() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    let task = Task::builder("noop").max_retries(0).build().unwrap();
    broker.enqueue(&task).unwrap();
    broker
        .dequeue(&["default".to_string()], Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    let swept = broker
        .sweep_stale("default", now_ms() + chrono::Duration::seconds(1), Duration::ZERO)
        .unwrap();
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].status, TaskStatus::Failed);
    assert_eq!(broker.queue_stats("default").unwrap().failed, 1);
}

#[tokio::test]
async fn list_tasks_paginates_and_clamps() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    let mut ids = Vec::new();
    for _ in 0..5 {
        let task = make_task("noop", 5);
        ids.push(task.id);
        broker.enqueue(&task).unwrap();
    }

    let (page, total) = broker.list_tasks("default", None, 2, 0).unwrap();
    assert_eq!(total, 5);
    assert_eq!(page.len(), 2);

    let (rest, _) = broker.list_tasks("default", None, 500, 3).unwrap();
    assert_eq!(rest.len(), 2);

    // limit 0 clamps up to 1.
    let (one, _) = broker.list_tasks("default", None, 0, 0).unwrap();
    assert_eq!(one.len(), 1);

    // Pending listing is priority-then-insertion: same priority, so FIFO.
    let (in_order, _) = broker
        .list_tasks("default", Some(TaskStatus::Pending), 500, 0)
        .unwrap();
    assert_eq!(in_order.iter().map(|t| t.id).collect::<Vec<_>>(), ids);
}

#[tokio::test]
async fn worker_registry_lifecycle_and_gc() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    let fresh = WorkerState::new("w-fresh", vec!["default".to_string()]);
    broker.register_worker(&fresh).unwrap();

    let mut stale = WorkerState::new("w-stale", vec!["default".to_string()]);
    stale.last_heartbeat = now_ms() - chrono::Duration::seconds(600);
    broker.register_worker(&stale).unwrap();

    assert_eq!(broker.list_workers().unwrap().len(), 2);
    assert_eq!(broker.worker_stats("w-fresh").unwrap().status, WorkerStatus::Starting);
    assert!(matches!(
        broker.worker_stats("w-unknown"),
        Err(QueueError::NotFound(_))
    ));

    let removed = broker.gc_stale_workers(Duration::from_secs(60)).unwrap();
    assert_eq!(removed, vec!["w-stale".to_string()]);
    assert_eq!(broker.list_workers().unwrap().len(), 1);

    broker.unregister_worker("w-fresh").unwrap();
    assert!(broker.list_workers().unwrap().is_empty());
}

#[tokio::test]
async fn fan_out_mirrors_durable_state() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    let task = make_task("noop", 5);
    let mut events = broker.subscribe_task(&task.id);

    broker.enqueue(&task).unwrap();
    let claimed = broker
        .dequeue(&["default".to_string()], Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    broker.complete(&claimed, json!({"n": 7})).unwrap();

    let mut statuses = Vec::new();
    while statuses.last() != Some(&TaskStatus::Completed) {
        let event = tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .expect("event stream should keep up with the broker")
            .expect("stream should stay open");
        assert_eq!(event.task_id, task.id);
        statuses.push(event.status);
    }

    assert_eq!(
        statuses,
        vec![TaskStatus::Pending, TaskStatus::Processing, TaskStatus::Completed]
    );
    // Replaying the stream ends at the same status as the durable record.
    assert_eq!(
        *statuses.last().unwrap(),
        broker.get_task(&task.id).unwrap().unwrap().status
    );
}

#[tokio::test]
async fn dashboard_publisher_pushes_snapshots() {
    let dir = TempDir::new().unwrap();
    let broker = open_broker(&dir);

    broker.enqueue(&make_task("noop", 5)).unwrap();
    let mut snapshots = broker.subscribe_dashboard();
    let publisher = broker.spawn_dashboard_publisher();

    let snapshot = tokio::time::timeout(Duration::from_secs(2), snapshots.next())
        .await
        .expect("publisher should tick")
        .expect("stream should stay open");
    assert_eq!(snapshot.event, "dashboard_update");
    let default_queue = snapshot
        .queues
        .iter()
        .find(|q| q.queue_name == "default")
        .expect("default queue should be in the snapshot");
    assert_eq!(default_queue.pending, 1);

    broker.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(1), publisher).await;
}

#[tokio::test]
async fn state_survives_reopen() {
    let dir = TempDir::new().unwrap();

    let first = make_task("noop", 9);
    let second = make_task("noop", 1);
    {
        let broker = open_broker(&dir);
        broker.enqueue(&first).unwrap();
        broker.enqueue(&second).unwrap();
    }

    let broker = open_broker(&dir);
    let stats = broker.queue_stats("default").unwrap();
    assert_eq!(stats.pending, 2);

    // Priority order survives the restart.
    let got = broker
        .dequeue(&["default".to_string()], Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.id, first.id);
}

#[tokio::test]
async fn retention_cleanup_drops_expired_records() {
    let dir = TempDir::new().unwrap();
    let config = QueueConfig {
        completed_retention_ms: 50,
        ..test_config(&dir)
    };
    let broker = Arc::new(Broker::open(config).unwrap());

    let task = make_task("noop", 5);
    broker.enqueue(&task).unwrap();
    let claimed = broker
        .dequeue(&["default".to_string()], Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    broker.complete(&claimed, json!(null)).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.cleanup_expired().unwrap(), 1);
    assert!(broker.get_task(&task.id).unwrap().is_none());
    assert_eq!(broker.queue_stats("default").unwrap().completed, 0);
}
