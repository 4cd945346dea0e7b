use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{Bar, Interval, MarketError, MarketKind, TimeRange};

/// One upstream producer of bars (DB cache, exchange API, aggregator, ...).
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Static trust used to break conflicts at shared timestamps.
    /// DB-backed sources are 10, primary APIs 8, fallbacks 6, mocks 1.
    fn trust(&self) -> u8;

    async fn fetch_bars(
        &self,
        symbol: &str,
        kind: MarketKind,
        interval: Interval,
        range: TimeRange,
        token: &CancellationToken,
    ) -> Result<Vec<Bar>, MarketError>;
}

/// The fused-series contract consumed by the backtest engine.
///
/// Lower layers implement this; upper layers depend only on the trait, so
/// the composition root can wire them without back-pointers.
#[async_trait]
pub trait HistoricalDataProvider: Send + Sync {
    async fn historical_bars(
        &self,
        symbol: &str,
        interval: Interval,
        range: TimeRange,
        token: &CancellationToken,
    ) -> Result<Vec<Bar>, MarketError>;
}
