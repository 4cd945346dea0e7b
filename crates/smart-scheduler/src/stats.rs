use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;

use crate::task::TaskType;

/// EMA smoothing for task durations.
const EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskTypeStats {
    pub executed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Exponential moving average of execution time.
    pub avg_duration_ms: f64,
    pub success_rate: f64,
    pub last_error: Option<String>,
}

/// Per task-type execution counters.
#[derive(Default)]
pub struct TaskStats {
    inner: RwLock<HashMap<TaskType, TaskTypeStats>>,
}

impl TaskStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, task_type: TaskType, duration_ms: u64) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(task_type).or_default();
        entry.executed += 1;
        entry.succeeded += 1;
        entry.avg_duration_ms = ema(entry.avg_duration_ms, duration_ms as f64, entry.executed);
        entry.success_rate = entry.succeeded as f64 / entry.executed as f64;
    }

    pub fn record_failure(&self, task_type: TaskType, duration_ms: u64, error: &str) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(task_type).or_default();
        entry.executed += 1;
        entry.failed += 1;
        entry.avg_duration_ms = ema(entry.avg_duration_ms, duration_ms as f64, entry.executed);
        entry.success_rate = entry.succeeded as f64 / entry.executed as f64;
        entry.last_error = Some(error.to_string());
    }

    pub fn snapshot(&self) -> HashMap<TaskType, TaskTypeStats> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

fn ema(previous: f64, sample: f64, executed: u64) -> f64 {
    if executed <= 1 {
        sample
    } else {
        previous + EMA_ALPHA * (sample - previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_tracks_outcomes() {
        let stats = TaskStats::new();
        stats.record_success(TaskType::Backtest, 100);
        stats.record_success(TaskType::Backtest, 200);
        stats.record_failure(TaskType::Backtest, 50, "boom");

        let snapshot = stats.snapshot();
        let entry = &snapshot[&TaskType::Backtest];
        assert_eq!(entry.executed, 3);
        assert!((entry.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(entry.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn duration_is_smoothed_not_averaged() {
        let stats = TaskStats::new();
        stats.record_success(TaskType::CacheWarmup, 100);
        stats.record_success(TaskType::CacheWarmup, 200);

        let snapshot = stats.snapshot();
        // 100 + 0.2 * (200 - 100)
        assert!((snapshot[&TaskType::CacheWarmup].avg_duration_ms - 120.0).abs() < 1e-9);
    }
}
