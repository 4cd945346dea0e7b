pub mod events;
pub mod fallback;
pub mod scheduler;
pub mod shutdown;
pub mod stats;
pub mod task;
pub mod worker_pool;

#[cfg(test)]
mod scheduler_tests;

pub use events::{EventBus, EventHandler, EventKind, SchedulerEvent};
pub use fallback::{Component, FallbackLevel, FallbackStrategy};
pub use scheduler::{SchedulerConfig, SchedulerStats, SmartScheduler};
pub use shutdown::{ShutdownManager, ShutdownPhase, ShutdownTimeout};
pub use stats::{TaskStats, TaskTypeStats};
pub use task::{ScheduledTask, TaskHandler, TaskType};
pub use worker_pool::AdaptiveWorkerPool;
