use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use market_core::MarketError;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, EventHandler, EventKind, SchedulerEvent};
use crate::stats::{TaskStats, TaskTypeStats};
use crate::task::{ScheduledTask, TaskHandler, TaskType};
use crate::worker_pool::AdaptiveWorkerPool;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub queue_capacity: usize,
    pub max_concurrent_tasks: usize,
    pub dispatch_interval: Duration,
    pub adjust_interval: Duration,
    /// Load above this shrinks the pool; below half of it grows the pool.
    pub load_threshold: f64,
    pub max_backoff: Duration,
    pub default_deadline: Duration,
    pub default_max_retries: u32,
    pub pool_initial: usize,
    pub pool_min: usize,
    pub pool_max: usize,
    pub performance_update_interval: Duration,
    pub performance_interval_min: Duration,
    pub performance_interval_max: Duration,
    pub cache_warmup_interval: Duration,
    pub data_cleanup_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_concurrent_tasks: 8,
            dispatch_interval: Duration::from_millis(100),
            adjust_interval: Duration::from_secs(300),
            load_threshold: 0.8,
            max_backoff: Duration::from_secs(30 * 60),
            default_deadline: Duration::from_secs(300),
            default_max_retries: 3,
            pool_initial: 10,
            pool_min: 5,
            pool_max: 30,
            performance_update_interval: Duration::from_secs(300),
            performance_interval_min: Duration::from_secs(120),
            performance_interval_max: Duration::from_secs(30 * 60),
            cache_warmup_interval: Duration::from_secs(600),
            data_cleanup_interval: Duration::from_secs(3_600),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    pub pool_size: usize,
    pub load: f64,
    pub per_type: HashMap<TaskType, TaskTypeStats>,
}

/// Priority task scheduler with an adaptive worker pool.
///
/// Tasks flow through a bounded channel into the dispatcher, which owns
/// the pending slice: per tick it drains the channel, sorts by priority
/// (FIFO within equal priority), drops expired tasks, and hands work to
/// the pool while respecting the concurrency ceiling. Failed tasks are
/// re-enqueued with exponential backoff at reduced priority until their
/// retry budget runs out.
pub struct SmartScheduler {
    config: SchedulerConfig,
    tx: mpsc::Sender<ScheduledTask>,
    rx: Mutex<Option<mpsc::Receiver<ScheduledTask>>>,
    pool: Arc<AdaptiveWorkerPool>,
    events: Arc<EventBus>,
    stats: Arc<TaskStats>,
    token: CancellationToken,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    queued: Arc<AtomicUsize>,
    perf_interval: Arc<Mutex<Duration>>,
    periodic_handlers: RwLock<HashMap<TaskType, Arc<dyn TaskHandler>>>,
    started: AtomicBool,
}

impl SmartScheduler {
    pub fn new(config: SchedulerConfig, parent: &CancellationToken) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let pool = Arc::new(AdaptiveWorkerPool::new(
            config.pool_initial,
            config.pool_min,
            config.pool_max,
        ));
        let perf_interval = Arc::new(Mutex::new(config.performance_update_interval));

        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            pool,
            events: Arc::new(EventBus::new()),
            stats: Arc::new(TaskStats::new()),
            token: parent.child_token(),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            queued: Arc::new(AtomicUsize::new(0)),
            perf_interval,
            periodic_handlers: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
            config,
        })
    }

    /// Register the body run by one of the periodic timers.
    pub fn set_periodic_handler(&self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        let mut map = self
            .periodic_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        map.insert(task_type, handler);
    }

    pub fn on_event(&self, kind: EventKind, handler: EventHandler) {
        self.events.subscribe(kind, handler);
    }

    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let rx = {
            let mut guard = self.rx.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(rx) = rx {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.dispatch_loop(rx).await });
        }

        for (task_type, fixed_interval) in [
            (TaskType::PerformanceUpdate, None),
            (TaskType::CacheWarmup, Some(self.config.cache_warmup_interval)),
            (TaskType::DataCleanup, Some(self.config.data_cleanup_interval)),
        ] {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.periodic_loop(task_type, fixed_interval).await });
        }

        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.adjust_loop().await });

        tracing::info!(
            "Scheduler started (pool {}, max concurrent {})",
            self.pool.size(),
            self.config.max_concurrent_tasks
        );
    }

    pub fn stop(&self) {
        tracing::info!("Scheduler stopping");
        self.token.cancel();
    }

    pub fn stats(&self) -> SchedulerStats {
        let queued = self.queued.load(Ordering::SeqCst);
        SchedulerStats {
            queued,
            running: self.pool.running(),
            pool_size: self.pool.size(),
            load: self.pool.load_estimate(queued),
            per_type: self.stats.snapshot(),
        }
    }

    /// Enqueue a task. Fails fast when the queue is full or the
    /// scheduler is stopping.
    pub fn submit(
        &self,
        task_type: TaskType,
        priority: u8,
        payload: serde_json::Value,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<u64, MarketError> {
        let task = self.build_task(task_type, priority, payload, handler, 0);
        let id = task.id;

        self.events.emit(SchedulerEvent::TaskScheduled {
            id,
            task_type,
            priority: task.priority,
        });
        self.enqueue(task)?;
        Ok(id)
    }

    /// Enqueue after `delay`. The delay timer is cancellation-aware.
    pub fn submit_delayed(
        self: &Arc<Self>,
        task_type: TaskType,
        priority: u8,
        payload: serde_json::Value,
        handler: Arc<dyn TaskHandler>,
        delay: Duration,
    ) -> u64 {
        let task = self.build_task(task_type, priority, payload, handler, 0);
        let id = task.id;

        self.events.emit(SchedulerEvent::TaskScheduledDelayed {
            id,
            task_type,
            delay_ms: delay.as_millis() as u64,
        });

        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = scheduler.token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = scheduler.enqueue(task) {
                        tracing::warn!("Delayed task {id} could not be enqueued: {e}");
                    }
                }
            }
        });

        id
    }

    fn build_task(
        &self,
        task_type: TaskType,
        priority: u8,
        payload: serde_json::Value,
        handler: Arc<dyn TaskHandler>,
        retry_count: u32,
    ) -> ScheduledTask {
        let now = Utc::now();
        ScheduledTask {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            task_type,
            priority: priority.clamp(1, 10),
            payload,
            created_at: now,
            deadline: Some(
                now + chrono::Duration::from_std(self.config.default_deadline)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            ),
            retry_count,
            max_retries: self.config.default_max_retries,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            handler,
        }
    }

    fn enqueue(&self, task: ScheduledTask) -> Result<(), MarketError> {
        match self.tx.try_send(task) {
            Ok(()) => {
                self.queued.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(task)) => {
                tracing::warn!("Task queue full, rejecting task {}", task.id);
                Err(MarketError::Internal("task queue full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(MarketError::Cancelled),
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::Receiver<ScheduledTask>) {
        // The pending slice is owned here; no reference escapes.
        let mut pending: Vec<ScheduledTask> = Vec::new();

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                received = rx.recv() => match received {
                    Some(task) => pending.push(task),
                    None => break,
                },
                _ = tokio::time::sleep(self.config.dispatch_interval) => {}
            }

            while let Ok(task) = rx.try_recv() {
                pending.push(task);
            }

            // Highest priority first, FIFO within a priority.
            pending.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));

            let now = Utc::now();
            pending.retain(|task| {
                if task.is_expired(now) {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    self.events.emit(SchedulerEvent::TaskExpired {
                        id: task.id,
                        task_type: task.task_type,
                    });
                    tracing::debug!("Task {} expired before dispatch", task.id);
                    false
                } else {
                    true
                }
            });

            while !pending.is_empty() && self.pool.running() < self.config.max_concurrent_tasks {
                let Some(permit) = self.pool.try_acquire() else {
                    break;
                };
                let task = pending.remove(0);
                self.queued.fetch_sub(1, Ordering::SeqCst);

                let scheduler = self.clone();
                tokio::spawn(async move {
                    scheduler.execute(task).await;
                    drop(permit);
                });
            }
        }

        tracing::debug!("Dispatcher stopped with {} tasks pending", pending.len());
    }

    async fn execute(self: &Arc<Self>, task: ScheduledTask) {
        self.events.emit(SchedulerEvent::TaskStarted {
            id: task.id,
            task_type: task.task_type,
        });

        let task_token = self.token.child_token();
        let started = tokio::time::Instant::now();

        let budget = task
            .deadline
            .and_then(|d| (d - Utc::now()).to_std().ok())
            .unwrap_or(self.config.default_deadline);

        let outcome = tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                task_token.cancel();
                // A cancelled task never reports completion.
                return;
            }
            result = tokio::time::timeout(budget, task.handler.handle(&task.payload, &task_token)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => {
                        task_token.cancel();
                        Err(MarketError::Internal("task deadline exceeded".into()))
                    }
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                self.stats.record_success(task.task_type, duration_ms);
                self.events.emit(SchedulerEvent::TaskCompleted {
                    id: task.id,
                    task_type: task.task_type,
                    duration_ms,
                });
            }
            Err(MarketError::Cancelled) => {
                tracing::debug!("Task {} cancelled", task.id);
            }
            Err(e) => {
                self.stats
                    .record_failure(task.task_type, duration_ms, &e.to_string());
                self.schedule_retry(task, e);
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, task: ScheduledTask, error: MarketError) {
        if task.retry_count >= task.max_retries {
            tracing::warn!(
                "Task {} failed after {} retries: {error}",
                task.id,
                task.retry_count
            );
            self.events.emit(SchedulerEvent::TaskFailed {
                id: task.id,
                task_type: task.task_type,
                error: error.to_string(),
            });
            return;
        }

        let exp = Duration::from_secs(1u64 << task.retry_count.min(20));
        let delay = exp.min(self.config.max_backoff);

        self.events.emit(SchedulerEvent::TaskRetry {
            id: task.id,
            task_type: task.task_type,
            retry_count: task.retry_count + 1,
            delay_ms: delay.as_millis() as u64,
        });

        // Retries come back one priority lower so fresh work goes first.
        let mut retry = self.build_task(
            task.task_type,
            task.priority.saturating_sub(1).max(1),
            task.payload.clone(),
            task.handler.clone(),
            task.retry_count + 1,
        );
        retry.id = task.id;

        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = scheduler.token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = scheduler.enqueue(retry) {
                        tracing::warn!("Retry of task {} could not be enqueued: {e}", task.id);
                    }
                }
            }
        });
    }

    async fn periodic_loop(self: Arc<Self>, task_type: TaskType, fixed_interval: Option<Duration>) {
        loop {
            let interval = fixed_interval.unwrap_or_else(|| {
                *self.perf_interval.lock().unwrap_or_else(|e| e.into_inner())
            });

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let handler = {
                let map = self
                    .periodic_handlers
                    .read()
                    .unwrap_or_else(|e| e.into_inner());
                map.get(&task_type).cloned()
            };

            if let Some(handler) = handler {
                if let Err(e) = self.submit(task_type, 5, serde_json::json!({}), handler) {
                    tracing::warn!("Periodic {task_type:?} submission failed: {e}");
                }
            }
        }
    }

    /// Every `adjust_interval`: estimate load and steer both the pool
    /// size and the performance-update cadence.
    async fn adjust_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.config.adjust_interval) => {}
            }

            let queued = self.queued.load(Ordering::SeqCst);
            let load = self.pool.load_estimate(queued);

            self.events.emit(SchedulerEvent::PerformanceMetrics {
                queue_len: queued,
                running: self.pool.running(),
                pool_size: self.pool.size(),
                load,
            });

            if load > self.config.load_threshold {
                self.pool.shrink();
                self.stretch_perf_interval(1.5);
                tracing::info!("High load {load:.2}: pool shrunk, update interval stretched");
            } else if load < 0.5 * self.config.load_threshold {
                self.pool.grow();
                self.stretch_perf_interval(0.8);
            }
        }
    }

    fn stretch_perf_interval(&self, factor: f64) {
        let mut interval = self.perf_interval.lock().unwrap_or_else(|e| e.into_inner());
        let next = Duration::from_secs_f64(interval.as_secs_f64() * factor);
        *interval = next.clamp(
            self.config.performance_interval_min,
            self.config.performance_interval_max,
        );
    }

    pub fn performance_update_interval(&self) -> Duration {
        *self.perf_interval.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}
