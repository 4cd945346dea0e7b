use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kline_store::KlineStore;
use market_core::{Bar, Interval, MarketDataSource, MarketError, MarketKind, TimeRange};
use tokio_util::sync::CancellationToken;

use crate::client::{AggregatorClient, ExchangeClient};

const FETCH_LIMIT: usize = 1000;

/// Bars already persisted in the kline store. Highest trust: these have
/// been validated and upserted before.
pub struct DbSource {
    store: Arc<KlineStore>,
}

impl DbSource {
    pub fn new(store: Arc<KlineStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MarketDataSource for DbSource {
    fn name(&self) -> &'static str {
        "db-cache"
    }

    fn trust(&self) -> u8 {
        10
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        kind: MarketKind,
        interval: Interval,
        range: TimeRange,
        _token: &CancellationToken,
    ) -> Result<Vec<Bar>, MarketError> {
        let bars = self
            .store
            .get_bars(symbol, kind, interval, Some(range.from), Some(range.to), FETCH_LIMIT)
            .await?;
        // Placeholder rows are storage artifacts, not source data.
        Ok(bars.into_iter().filter(|b| b.is_valid).collect())
    }
}

/// Primary upstream: the exchange's spot K-line endpoint.
pub struct SpotApiSource {
    client: Arc<ExchangeClient>,
}

impl SpotApiSource {
    pub fn new(client: Arc<ExchangeClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MarketDataSource for SpotApiSource {
    fn name(&self) -> &'static str {
        "exchange-spot"
    }

    fn trust(&self) -> u8 {
        8
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        kind: MarketKind,
        interval: Interval,
        range: TimeRange,
        token: &CancellationToken,
    ) -> Result<Vec<Bar>, MarketError> {
        if kind != MarketKind::Spot {
            return Ok(Vec::new());
        }
        self.client
            .spot_klines(symbol, interval, range, FETCH_LIMIT, token)
            .await
    }
}

/// Primary upstream for futures symbols: the derivatives K-line endpoint.
pub struct DerivativesApiSource {
    client: Arc<ExchangeClient>,
}

impl DerivativesApiSource {
    pub fn new(client: Arc<ExchangeClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MarketDataSource for DerivativesApiSource {
    fn name(&self) -> &'static str {
        "exchange-derivatives"
    }

    fn trust(&self) -> u8 {
        8
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        kind: MarketKind,
        interval: Interval,
        range: TimeRange,
        token: &CancellationToken,
    ) -> Result<Vec<Bar>, MarketError> {
        if kind != MarketKind::Futures {
            return Ok(Vec::new());
        }
        self.client
            .futures_klines(symbol, interval, range, FETCH_LIMIT, token)
            .await
    }
}

/// Fallback source: hourly/daily closes from the aggregator, reshaped into
/// bars. Lower trust than exchange data.
pub struct AggregatorSource {
    client: Arc<AggregatorClient>,
}

impl AggregatorSource {
    pub fn new(client: Arc<AggregatorClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MarketDataSource for AggregatorSource {
    fn name(&self) -> &'static str {
        "aggregator"
    }

    fn trust(&self) -> u8 {
        6
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        kind: MarketKind,
        interval: Interval,
        range: TimeRange,
        token: &CancellationToken,
    ) -> Result<Vec<Bar>, MarketError> {
        if kind != MarketKind::Spot {
            return Ok(Vec::new());
        }

        let days = ((Utc::now() - range.from).num_days().max(1) as u32).min(365);
        let bars = self.client.market_chart(symbol, interval, days, token).await?;
        Ok(bars
            .into_iter()
            .filter(|b| range.contains(b.open_time))
            .collect())
    }
}
