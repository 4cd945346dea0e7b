//! Deterministic bar generation for tests and local stubs.
//!
//! Nothing in this module is reachable from production acquisition paths;
//! when live data is missing the fusion layer fails with
//! `InsufficientData` instead of synthesising a series.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use market_core::{Bar, Interval, MarketDataSource, MarketError, MarketKind, TimeRange};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

/// Generate `n` bars with a per-bar drift and seeded noise.
pub fn synthetic_bars(
    symbol: &str,
    kind: MarketKind,
    interval: Interval,
    start: DateTime<Utc>,
    n: usize,
    start_price: f64,
    drift_per_bar: f64,
    seed: u64,
) -> Vec<Bar> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut price = start_price;
    let stride = interval.duration();

    (0..n)
        .map(|i| {
            let open = price;
            let noise = 1.0 + rng.gen_range(-0.002..0.002);
            price = (price * (1.0 + drift_per_bar) * noise).max(1e-6);
            let close = price;
            Bar {
                symbol: symbol.to_string(),
                kind,
                interval,
                open_time: start + stride * i as i32,
                open,
                high: open.max(close) * 1.001,
                low: open.min(close) * 0.999,
                close,
                volume: 1_000.0 + rng.gen_range(0.0..500.0),
                is_valid: true,
                quality_score: 100,
            }
        })
        .collect()
}

/// Linear close ramp from `first_close` to `last_close` inclusive, with
/// constant volume. Handy for scenario tests with exact expectations.
pub fn ramp_bars(
    symbol: &str,
    interval: Interval,
    start: DateTime<Utc>,
    n: usize,
    first_close: f64,
    last_close: f64,
) -> Vec<Bar> {
    let stride = interval.duration();
    let step = if n > 1 {
        (last_close - first_close) / (n - 1) as f64
    } else {
        0.0
    };

    (0..n)
        .map(|i| {
            let close = first_close + step * i as f64;
            let open = if i == 0 { close } else { first_close + step * (i - 1) as f64 };
            Bar {
                symbol: symbol.to_string(),
                kind: MarketKind::Spot,
                interval,
                open_time: start + stride * i as i32,
                open,
                high: open.max(close),
                low: open.min(close),
                close,
                volume: 1_000.0,
                is_valid: true,
                quality_score: 100,
            }
        })
        .collect()
}

/// A canned source with mock-grade trust. Test harness only.
pub struct MockSource {
    pub bars: Vec<Bar>,
}

impl MockSource {
    pub fn new(bars: Vec<Bar>) -> Arc<Self> {
        Arc::new(Self { bars })
    }
}

#[async_trait]
impl MarketDataSource for MockSource {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn trust(&self) -> u8 {
        1
    }

    async fn fetch_bars(
        &self,
        _symbol: &str,
        _kind: MarketKind,
        _interval: Interval,
        range: TimeRange,
        _token: &CancellationToken,
    ) -> Result<Vec<Bar>, MarketError> {
        Ok(self
            .bars
            .iter()
            .filter(|b| range.contains(b.open_time))
            .cloned()
            .collect())
    }
}

/// A provider that serves a fixed series, for driving the backtest engine
/// in tests without any acquisition stack.
pub struct FixedProvider {
    pub bars: Vec<Bar>,
}

impl FixedProvider {
    pub fn new(bars: Vec<Bar>) -> Arc<Self> {
        Arc::new(Self { bars })
    }
}

#[async_trait]
impl market_core::HistoricalDataProvider for FixedProvider {
    async fn historical_bars(
        &self,
        _symbol: &str,
        _interval: Interval,
        range: TimeRange,
        _token: &CancellationToken,
    ) -> Result<Vec<Bar>, MarketError> {
        Ok(self
            .bars
            .iter()
            .filter(|b| range.contains(b.open_time))
            .cloned()
            .collect())
    }
}
