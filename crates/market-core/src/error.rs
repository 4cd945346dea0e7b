use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Control-flow signal, not a failure.
    #[error("Cache miss")]
    CacheMiss,

    #[error("Strategy failure: {0}")]
    StrategyFailure(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MarketError {
    /// Transient faults are retried locally; semantic errors surface at once.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MarketError::UpstreamUnavailable(_) | MarketError::Database(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, MarketError::Cancelled)
    }
}
