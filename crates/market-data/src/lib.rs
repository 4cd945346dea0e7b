pub mod client;
pub mod fusion;
pub mod quality;
pub mod sources;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

#[cfg(test)]
mod fusion_tests;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use market_core::{
    Bar, HistoricalDataProvider, Interval, MarketDataSource, MarketError, MarketKind, TimeRange,
};
use tokio_util::sync::CancellationToken;

use fusion::{fuse, FusionOutcome, FusionReport};
use quality::{assess_quality, StabilityConfig};

pub use client::{AggregatorClient, ExchangeClient, ExchangeConfig};
pub use fusion::MIN_USABLE_BARS;
pub use quality::QualityScore;

/// Multi-source acquisition front-end: pulls every configured source,
/// quality-scores each, and fuses the survivors into one series.
pub struct DataManager {
    sources: Vec<Arc<dyn MarketDataSource>>,
    stability: StabilityConfig,
}

impl DataManager {
    pub fn new(sources: Vec<Arc<dyn MarketDataSource>>) -> Self {
        Self {
            sources,
            stability: StabilityConfig::default(),
        }
    }

    pub fn with_stability(mut self, stability: StabilityConfig) -> Self {
        self.stability = stability;
        self
    }

    /// Pull the window from every source concurrently, score and fuse.
    ///
    /// A failing source contributes nothing; only when no source yields
    /// enough usable bars does the request fail.
    pub async fn get_historical_data(
        &self,
        symbol: &str,
        kind: MarketKind,
        interval: Interval,
        range: TimeRange,
        token: &CancellationToken,
    ) -> Result<(Vec<Bar>, FusionReport), MarketError> {
        let mut handles = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let source = source.clone();
            let symbol = symbol.to_string();
            let child = token.child_token();
            handles.push(tokio::spawn(async move {
                let name = source.name();
                let trust = source.trust();
                let result = source.fetch_bars(&symbol, kind, interval, range, &child).await;
                (name, trust, result)
            }));
        }

        let now = Utc::now();
        let mut pulls = Vec::with_capacity(handles.len());
        for handle in handles {
            let (name, trust, result) = handle
                .await
                .map_err(|e| MarketError::Internal(format!("source task panicked: {e}")))?;

            match result {
                Ok(bars) if bars.is_empty() => {
                    tracing::debug!("Source {name} returned no bars for {symbol}");
                }
                Ok(bars) => {
                    let quality = assess_quality(&bars, now);
                    tracing::debug!(
                        "Source {name}: {} bars, quality {:.3}",
                        bars.len(),
                        quality.overall
                    );
                    pulls.push(fusion::SourcePull {
                        name,
                        trust,
                        bars,
                        quality,
                    });
                }
                Err(MarketError::Cancelled) => return Err(MarketError::Cancelled),
                Err(e) => {
                    tracing::warn!("Source {name} failed for {symbol}: {e}");
                }
            }
        }

        if pulls.is_empty() {
            return Err(MarketError::UpstreamUnavailable(format!(
                "all sources failed for {symbol}"
            )));
        }

        let FusionOutcome { bars, report } = fuse(pulls, &self.stability)?;
        Ok((bars, report))
    }
}

#[async_trait]
impl HistoricalDataProvider for DataManager {
    async fn historical_bars(
        &self,
        symbol: &str,
        interval: Interval,
        range: TimeRange,
        token: &CancellationToken,
    ) -> Result<Vec<Bar>, MarketError> {
        let (bars, _) = self
            .get_historical_data(symbol, MarketKind::Spot, interval, range, token)
            .await?;
        Ok(bars)
    }
}
