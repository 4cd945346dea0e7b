use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::MarketError;

/// Capped-exponential retry for upstream calls.
///
/// All acquisition paths share this one policy instead of hand-rolling
/// backoff per call site. Only transient errors are retried; semantic
/// errors (invalid input, insufficient data) surface immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // 1s, 2s, 4s
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        exp.min(self.max_delay)
    }

    /// Run `op`, retrying transient failures until the attempt budget is
    /// spent. Cancellation wins over both the operation and the backoff
    /// sleep.
    pub async fn run<T, F, Fut>(
        &self,
        op_name: &str,
        token: &CancellationToken,
        mut op: F,
    ) -> Result<T, MarketError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MarketError>>,
    {
        let mut last_err = MarketError::UpstreamUnavailable(format!("{op_name}: no attempts made"));

        for attempt in 0..self.max_attempts.max(1) {
            if token.is_cancelled() {
                return Err(MarketError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(MarketError::Cancelled),
                r = op() => r,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "{op_name}: attempt {}/{} failed ({e}), retrying in {:?}",
                        attempt + 1,
                        self.max_attempts,
                        delay
                    );
                    last_err = e;
                    if attempt + 1 < self.max_attempts {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => return Err(MarketError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        Err(last_err)
    }
}
