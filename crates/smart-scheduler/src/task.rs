use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use market_core::MarketError;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Every analytics task the scheduler knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    PerformanceUpdate,
    CacheWarmup,
    DataCleanup,
    DataFetch,
    Backtest,
    Recommendation,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::PerformanceUpdate => "performance_update",
            TaskType::CacheWarmup => "cache_warmup",
            TaskType::DataCleanup => "data_cleanup",
            TaskType::DataFetch => "data_fetch",
            TaskType::Backtest => "backtest",
            TaskType::Recommendation => "recommendation",
        }
    }
}

/// Work body invoked by the worker pool. The token carries the task's
/// deadline and the scheduler's cancellation.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(
        &self,
        payload: &serde_json::Value,
        token: &CancellationToken,
    ) -> Result<(), MarketError>;
}

/// One scheduled unit of work.
#[derive(Clone)]
pub struct ScheduledTask {
    pub id: u64,
    pub task_type: TaskType,
    /// 1 (lowest) ..= 10 (highest).
    pub priority: u8,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// FIFO tiebreak among equal priorities.
    pub(crate) seq: u64,
    pub handler: Arc<dyn TaskHandler>,
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("task_type", &self.task_type)
            .field("priority", &self.priority)
            .field("retry_count", &self.retry_count)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl ScheduledTask {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| d < now)
    }
}
