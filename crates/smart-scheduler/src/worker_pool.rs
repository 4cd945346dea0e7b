use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Worker pool whose size can be adjusted at runtime.
///
/// Resizing swaps in a fresh semaphore carrying `new_size` minus the
/// currently running workers, so outstanding permits keep counting
/// against the new capacity. Permits on the retired semaphore simply
/// evaporate when dropped.
pub struct AdaptiveWorkerPool {
    semaphore: RwLock<Arc<Semaphore>>,
    size: AtomicUsize,
    running: Arc<AtomicUsize>,
    min_size: usize,
    max_size: usize,
}

pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
    running: Arc<AtomicUsize>,
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdaptiveWorkerPool {
    pub fn new(initial: usize, min_size: usize, max_size: usize) -> Self {
        let initial = initial.clamp(min_size.max(1), max_size.max(1));
        Self {
            semaphore: RwLock::new(Arc::new(Semaphore::new(initial))),
            size: AtomicUsize::new(initial),
            running: Arc::new(AtomicUsize::new(0)),
            min_size: min_size.max(1),
            max_size: max_size.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn acquire(&self) -> Option<WorkerPermit> {
        let semaphore = {
            let guard = self.semaphore.read().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        match semaphore.acquire_owned().await {
            Ok(permit) => {
                self.running.fetch_add(1, Ordering::SeqCst);
                Some(WorkerPermit {
                    _permit: permit,
                    running: self.running.clone(),
                })
            }
            Err(_) => None,
        }
    }

    pub fn try_acquire(&self) -> Option<WorkerPermit> {
        let semaphore = {
            let guard = self.semaphore.read().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        match semaphore.try_acquire_owned() {
            Ok(permit) => {
                self.running.fetch_add(1, Ordering::SeqCst);
                Some(WorkerPermit {
                    _permit: permit,
                    running: self.running.clone(),
                })
            }
            Err(_) => None,
        }
    }

    /// Clamp and apply a new size; returns the size actually in effect.
    pub fn resize(&self, new_size: usize) -> usize {
        let target = new_size.clamp(self.min_size, self.max_size);
        let current = self.size.swap(target, Ordering::SeqCst);
        if target == current {
            return target;
        }

        let running = self.running();
        let available = target.saturating_sub(running);
        let fresh = Arc::new(Semaphore::new(available));
        {
            let mut guard = self.semaphore.write().unwrap_or_else(|e| e.into_inner());
            guard.close();
            *guard = fresh;
        }

        tracing::info!("Worker pool resized {current} -> {target} ({running} running)");
        target
    }

    /// Grow by 20%, capped.
    pub fn grow(&self) -> usize {
        let size = self.size();
        self.resize(((size as f64 * 1.2).ceil() as usize).max(size + 1))
    }

    /// Shrink by 20%, floored.
    pub fn shrink(&self) -> usize {
        let size = self.size();
        self.resize(((size as f64 * 0.8).floor() as usize).min(size.saturating_sub(1)))
    }

    /// Load estimate in [0, 1]: queue pressure plus worker occupancy.
    pub fn load_estimate(&self, queue_len: usize) -> f64 {
        let size = self.size().max(1);
        let load = queue_len as f64 / 100.0 + self.running() as f64 / size as f64;
        load.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_bound_concurrency() {
        let pool = AdaptiveWorkerPool::new(2, 1, 10);

        let p1 = pool.try_acquire().unwrap();
        let _p2 = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.running(), 2);

        drop(p1);
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn resize_accounts_for_running_workers() {
        let pool = AdaptiveWorkerPool::new(4, 1, 10);
        let _held = pool.try_acquire().unwrap();
        let _held2 = pool.try_acquire().unwrap();

        pool.resize(3);
        assert_eq!(pool.size(), 3);

        // Two running + one fresh permit = 3 total capacity.
        let third = pool.try_acquire();
        assert!(third.is_some());
        assert!(pool.try_acquire().is_none());
    }

    #[tokio::test]
    async fn grow_and_shrink_respect_bounds() {
        let pool = AdaptiveWorkerPool::new(5, 5, 30);
        assert_eq!(pool.shrink(), 5); // floored at min
        let grown = pool.grow();
        assert_eq!(grown, 6);

        let pool = AdaptiveWorkerPool::new(30, 5, 30);
        assert_eq!(pool.grow(), 30); // capped at max
    }

    #[tokio::test]
    async fn load_combines_queue_and_occupancy() {
        let pool = AdaptiveWorkerPool::new(10, 1, 30);
        assert_eq!(pool.load_estimate(0), 0.0);

        let _p = pool.try_acquire().unwrap();
        let load = pool.load_estimate(20);
        assert!((load - (0.2 + 0.1)).abs() < 1e-9);
        assert_eq!(pool.load_estimate(1_000), 1.0);
    }
}
