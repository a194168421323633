use prometheus::{
    CounterVec, HistogramOpts, HistogramVec, IntGauge, IntGaugeVec, Opts, Registry,
};

/// Prometheus metrics for the broker
pub struct BrokerMetrics {
    pub registry: Registry,

    /// Task transitions by resulting status and queue
    pub tasks_total: CounterVec,

    /// Visible pending depth (including tasks serving backoff) per queue
    pub queue_pending: IntGaugeVec,

    /// In-flight tasks per queue
    pub queue_processing: IntGaugeVec,

    /// Handler wall time by task name
    pub task_duration: HistogramVec,

    /// Currently registered workers
    pub workers_registered: IntGauge,
}

impl BrokerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let tasks_total = CounterVec::new(
            Opts::new("rq_tasks_total", "Task transitions by status and queue"),
            &["status", "queue"],
        )?;
        registry.register(Box::new(tasks_total.clone()))?;

        let queue_pending = IntGaugeVec::new(
            Opts::new("rq_queue_pending", "Pending tasks per queue"),
            &["queue"],
        )?;
        registry.register(Box::new(queue_pending.clone()))?;

        let queue_processing = IntGaugeVec::new(
            Opts::new("rq_queue_processing", "In-flight tasks per queue"),
            &["queue"],
        )?;
        registry.register(Box::new(queue_processing.clone()))?;

        let task_duration = HistogramVec::new(
            HistogramOpts::new(
                "rq_task_duration_seconds",
                "Handler execution duration in seconds",
            ),
            &["name"],
        )?;
        registry.register(Box::new(task_duration.clone()))?;

        let workers_registered =
            IntGauge::new("rq_workers_registered", "Number of registered workers")?;
        registry.register(Box::new(workers_registered.clone()))?;

        Ok(BrokerMetrics {
            registry,
            tasks_total,
            queue_pending,
            queue_processing,
            task_duration,
            workers_registered,
        })
    }

    pub fn inc_task(&self, status: &str, queue: &str) {
        self.tasks_total.with_label_values(&[status, queue]).inc();
    }

    pub fn set_depth(&self, queue: &str, pending: i64, processing: i64) {
        self.queue_pending.with_label_values(&[queue]).set(pending);
        self.queue_processing
            .with_label_values(&[queue])
            .set(processing);
    }

    pub fn observe_duration(&self, name: &str, secs: f64) {
        self.task_duration.with_label_values(&[name]).observe(secs);
    }
}
