use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Phases run sequentially; callbacks within one phase run concurrently
/// under the phase deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownPhase {
    PreShutdown,
    Shutdown,
    PostShutdown,
}

impl ShutdownPhase {
    pub fn default_timeout(&self) -> Duration {
        match self {
            ShutdownPhase::PreShutdown => Duration::from_secs(5),
            ShutdownPhase::Shutdown => Duration::from_secs(30),
            ShutdownPhase::PostShutdown => Duration::from_secs(10),
        }
    }

    fn all() -> [ShutdownPhase; 3] {
        [
            ShutdownPhase::PreShutdown,
            ShutdownPhase::Shutdown,
            ShutdownPhase::PostShutdown,
        ]
    }
}

pub type CleanupFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Resource {
    name: String,
    /// Higher priorities are cleaned first (DB 100, caches 90, pools 80).
    priority: u8,
    phase: ShutdownPhase,
    cleanup: CleanupFn,
}

/// Coordinates the drain of every background resource on termination.
///
/// The root cancellation token fires first, then each phase runs its
/// registered cleanups in priority order. A phase that overruns its
/// deadline is abandoned and the next phase proceeds; a shutdown that
/// overruns the total budget reports failure so the process can exit
/// non-zero.
pub struct ShutdownManager {
    resources: Mutex<Vec<Resource>>,
    root_token: CancellationToken,
    total_budget: Duration,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(Vec::new()),
            root_token: CancellationToken::new(),
            total_budget: Duration::from_secs(60),
        }
    }

    pub fn with_total_budget(mut self, budget: Duration) -> Self {
        self.total_budget = budget;
        self
    }

    /// Token tree root: every scheduler, task and upstream call derives
    /// from this.
    pub fn root_token(&self) -> CancellationToken {
        self.root_token.clone()
    }

    pub fn register<F, Fut>(&self, name: &str, priority: u8, phase: ShutdownPhase, cleanup: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cleanup: CleanupFn = Arc::new(move || Box::pin(cleanup()));
        let mut resources = self.resources.lock().unwrap_or_else(|e| e.into_inner());
        resources.push(Resource {
            name: name.to_string(),
            priority,
            phase,
            cleanup,
        });
    }

    /// Run the full shutdown. `Ok` means every phase finished inside the
    /// total budget; `Err` maps to a non-zero process exit.
    pub async fn shutdown(&self) -> Result<(), ShutdownTimeout> {
        tracing::info!("Shutdown initiated");
        self.root_token.cancel();

        let started = Instant::now();
        let deadline = started + self.total_budget;

        for phase in ShutdownPhase::all() {
            if Instant::now() >= deadline {
                tracing::error!("Shutdown exceeded the total budget before {phase:?}");
                return Err(ShutdownTimeout);
            }
            let phase_deadline =
                (Instant::now() + phase.default_timeout()).min(deadline);
            self.run_phase(phase, phase_deadline).await;
        }

        if Instant::now() >= deadline {
            tracing::error!("Shutdown exceeded the total budget");
            return Err(ShutdownTimeout);
        }

        tracing::info!("Shutdown complete in {:?}", started.elapsed());
        Ok(())
    }

    async fn run_phase(&self, phase: ShutdownPhase, phase_deadline: Instant) {
        let mut batch: Vec<(String, CleanupFn)> = {
            let resources = self.resources.lock().unwrap_or_else(|e| e.into_inner());
            let mut batch: Vec<&Resource> =
                resources.iter().filter(|r| r.phase == phase).collect();
            batch.sort_by(|a, b| b.priority.cmp(&a.priority));
            batch
                .iter()
                .map(|r| (r.name.clone(), r.cleanup.clone()))
                .collect()
        };

        if batch.is_empty() {
            return;
        }
        tracing::info!("Shutdown phase {phase:?}: {} resources", batch.len());

        // Spawn in priority order; all run concurrently under the deadline.
        let handles: Vec<(String, tokio::task::JoinHandle<()>)> = batch
            .drain(..)
            .map(|(name, cleanup)| {
                let task_name = name.clone();
                (name, tokio::spawn(async move {
                    cleanup().await;
                    tracing::debug!("Cleaned up {task_name}");
                }))
            })
            .collect();

        for (name, handle) in handles {
            match tokio::time::timeout_at(phase_deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Cleanup {name} panicked: {e}"),
                Err(_) => {
                    tracing::warn!("Phase {phase:?} deadline hit while waiting on {name}; abandoning the rest");
                    return;
                }
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct ShutdownTimeout;

impl std::fmt::Display for ShutdownTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shutdown exceeded its total budget")
    }
}

impl std::error::Error for ShutdownTimeout {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn phases_run_in_order_and_priorities_first() {
        let manager = ShutdownManager::new();
        let order = Arc::new(Mutex::new(Vec::<String>::new()));

        for (name, priority, phase) in [
            ("pool", 80u8, ShutdownPhase::Shutdown),
            ("db", 100u8, ShutdownPhase::Shutdown),
            ("flush", 50u8, ShutdownPhase::PreShutdown),
            ("report", 10u8, ShutdownPhase::PostShutdown),
        ] {
            let order = order.clone();
            manager.register(name, priority, phase, move || {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(name.to_string());
                }
            });
        }

        manager.shutdown().await.unwrap();

        let seen = order.lock().unwrap().clone();
        assert_eq!(seen, vec!["flush", "db", "pool", "report"]);
    }

    #[tokio::test]
    async fn root_token_fires_before_cleanups() {
        let manager = ShutdownManager::new();
        let token = manager.root_token();
        let observed = Arc::new(AtomicUsize::new(0));

        let observed_in_cleanup = observed.clone();
        let cleanup_token = token.clone();
        manager.register("probe", 50, ShutdownPhase::PreShutdown, move || {
            let observed = observed_in_cleanup.clone();
            let token = cleanup_token.clone();
            async move {
                if token.is_cancelled() {
                    observed.store(1, Ordering::SeqCst);
                }
            }
        });

        manager.shutdown().await.unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_phase_is_abandoned() {
        let manager = ShutdownManager::new();
        let finished = Arc::new(AtomicUsize::new(0));

        let slow_finished = finished.clone();
        manager.register("slow", 90, ShutdownPhase::PreShutdown, move || {
            let finished = slow_finished.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            }
        });

        let fast_finished = finished.clone();
        manager.register("fast", 10, ShutdownPhase::PostShutdown, move || {
            let finished = fast_finished.clone();
            async move {
                finished.fetch_add(1, Ordering::SeqCst);
            }
        });

        // The slow pre-shutdown callback never finishes, yet later phases run.
        let result = manager.shutdown().await;
        assert!(result.is_ok());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn busting_the_total_budget_reports_failure() {
        let manager = ShutdownManager::new().with_total_budget(Duration::from_secs(8));

        manager.register("glacial", 90, ShutdownPhase::PreShutdown, move || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        manager.register("stuck", 90, ShutdownPhase::Shutdown, move || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        assert!(manager.shutdown().await.is_err());
    }
}
