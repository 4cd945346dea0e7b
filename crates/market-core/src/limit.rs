use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Token-bucket budget for outbound requests.
///
/// `capacity` tokens refill evenly across `window`; every request
/// reserves one token and is held back once the bucket runs dry. This
/// sits next to [`crate::RetryPolicy`] so rate limiting and backoff are
/// one shared concern instead of per-client code.
pub struct RequestBudget {
    state: Mutex<BudgetState>,
    capacity: f64,
    refill_per_sec: f64,
}

struct BudgetState {
    tokens: f64,
    topped_up_at: Instant,
}

impl RequestBudget {
    pub fn new(capacity: u32, window: Duration) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            state: Mutex::new(BudgetState {
                tokens: capacity,
                topped_up_at: Instant::now(),
            }),
            capacity,
            refill_per_sec: capacity / window.as_secs_f64().max(f64::EPSILON),
        }
    }

    pub fn per_minute(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(60))
    }

    /// Reserve one token, sleeping until the refill covers the shortfall.
    pub async fn reserve(&self) {
        loop {
            let shortfall = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let gained =
                    now.duration_since(state.topped_up_at).as_secs_f64() * self.refill_per_sec;
                state.tokens = (state.tokens + gained).min(self.capacity);
                state.topped_up_at = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                1.0 - state.tokens
            };

            let wait = Duration::from_secs_f64(shortfall / self.refill_per_sec);
            tracing::debug!("Request budget exhausted, backing off {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }
}
