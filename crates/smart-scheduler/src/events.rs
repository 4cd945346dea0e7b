use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::task::TaskType;

/// Everything observable about the scheduler's lifecycle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    TaskScheduled {
        id: u64,
        task_type: TaskType,
        priority: u8,
    },
    TaskScheduledDelayed {
        id: u64,
        task_type: TaskType,
        delay_ms: u64,
    },
    TaskStarted {
        id: u64,
        task_type: TaskType,
    },
    TaskCompleted {
        id: u64,
        task_type: TaskType,
        duration_ms: u64,
    },
    TaskFailed {
        id: u64,
        task_type: TaskType,
        error: String,
    },
    TaskRetry {
        id: u64,
        task_type: TaskType,
        retry_count: u32,
        delay_ms: u64,
    },
    TaskExpired {
        id: u64,
        task_type: TaskType,
    },
    PerformanceMetrics {
        queue_len: usize,
        running: usize,
        pool_size: usize,
        load: f64,
    },
}

/// Discriminant used for handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskScheduled,
    TaskScheduledDelayed,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskRetry,
    TaskExpired,
    PerformanceMetrics,
}

impl SchedulerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SchedulerEvent::TaskScheduled { .. } => EventKind::TaskScheduled,
            SchedulerEvent::TaskScheduledDelayed { .. } => EventKind::TaskScheduledDelayed,
            SchedulerEvent::TaskStarted { .. } => EventKind::TaskStarted,
            SchedulerEvent::TaskCompleted { .. } => EventKind::TaskCompleted,
            SchedulerEvent::TaskFailed { .. } => EventKind::TaskFailed,
            SchedulerEvent::TaskRetry { .. } => EventKind::TaskRetry,
            SchedulerEvent::TaskExpired { .. } => EventKind::TaskExpired,
            SchedulerEvent::PerformanceMetrics { .. } => EventKind::PerformanceMetrics,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(SchedulerEvent) + Send + Sync>;

/// Best-effort event bus: a bounded channel feeds a dispatch loop that
/// runs each registered handler in its own spawned context. When the
/// channel is full the event is dropped and logged, never blocking the
/// scheduler.
pub struct EventBus {
    tx: mpsc::Sender<SchedulerEvent>,
    handlers: Arc<RwLock<HashMap<EventKind, Vec<EventHandler>>>>,
}

const EVENT_CAPACITY: usize = 256;

impl EventBus {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::channel::<SchedulerEvent>(EVENT_CAPACITY);
        let handlers: Arc<RwLock<HashMap<EventKind, Vec<EventHandler>>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let dispatch_handlers = handlers.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let registered = {
                    let map = dispatch_handlers.read().unwrap_or_else(|e| e.into_inner());
                    map.get(&event.kind()).cloned().unwrap_or_default()
                };
                for handler in registered {
                    let event = event.clone();
                    tokio::spawn(async move { handler(event) });
                }
            }
        });

        Self { tx, handlers }
    }

    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) {
        let mut map = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        map.entry(kind).or_default().push(handler);
    }

    pub fn emit(&self, event: SchedulerEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::debug!("Event bus full, dropping event: {e}");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
