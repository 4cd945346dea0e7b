use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use indicator_cache::IndicatorCache;
use kline_store::KlineStore;
use market_core::{Interval, MarketError, MarketKind, TimeRange};
use market_data::DataManager;
use recommendation_cache::{QueryShape, RecommendationCache};
use smart_scheduler::{Component, FallbackStrategy, TaskHandler};
use tokio_util::sync::CancellationToken;

/// Periodic `performance_update`: keep each tracked symbol's hourly
/// series fresh in the kline store and surface source health into the
/// fallback strategy.
pub struct DataRefreshHandler {
    pub manager: Arc<DataManager>,
    pub store: Arc<KlineStore>,
    pub fallback: Arc<FallbackStrategy>,
    pub symbols: Vec<String>,
}

#[async_trait]
impl TaskHandler for DataRefreshHandler {
    async fn handle(
        &self,
        _payload: &serde_json::Value,
        token: &CancellationToken,
    ) -> Result<(), MarketError> {
        let interval = Interval::Hour1;

        for symbol in &self.symbols {
            if token.is_cancelled() {
                return Err(MarketError::Cancelled);
            }

            let fresh = self
                .store
                .is_fresh(symbol, MarketKind::Spot, interval, interval.freshness_budget())
                .await
                .unwrap_or(false);
            if fresh {
                continue;
            }

            let range = TimeRange::new(Utc::now() - Duration::hours(48), Utc::now());
            match self
                .manager
                .get_historical_data(symbol, MarketKind::Spot, interval, range, token)
                .await
            {
                Ok((bars, report)) => {
                    tracing::info!(
                        "Refreshed {symbol}: {} bars from {}",
                        bars.len(),
                        report.base_source
                    );
                    self.fallback.record_success(Component::MarketData);
                    if let Err(e) = self.store.upsert_bars(&bars).await {
                        self.fallback.record_failure(Component::Database);
                        return Err(e);
                    }
                    self.fallback.record_success(Component::Database);
                }
                Err(MarketError::Cancelled) => return Err(MarketError::Cancelled),
                Err(e) => {
                    tracing::warn!("Refresh of {symbol} failed: {e}");
                    self.fallback.record_failure(Component::MarketData);
                }
            }
        }

        Ok(())
    }
}

/// Periodic `cache_warmup`: pre-populate the standard global query shapes.
pub struct CacheWarmupHandler {
    pub recommendations: Arc<RecommendationCache>,
}

pub fn standard_shapes() -> Vec<QueryShape> {
    ["trend", "momentum", "breakout"]
        .into_iter()
        .map(|kind| QueryShape {
            user_id: None,
            kind: kind.to_string(),
            limit: 20,
            min_score: 50.0,
            time_range_hours: 24,
            sort_by: "score".to_string(),
        })
        .collect()
}

#[async_trait]
impl TaskHandler for CacheWarmupHandler {
    async fn handle(
        &self,
        _payload: &serde_json::Value,
        _token: &CancellationToken,
    ) -> Result<(), MarketError> {
        self.recommendations.warmup(standard_shapes()).await;
        let stats = self.recommendations.stats();
        tracing::debug!(
            "Warmup done (hit rate {:.2}, {} precompute tasks queued)",
            stats.hit_rate,
            stats.precompute_enqueued
        );
        Ok(())
    }
}

/// Periodic `data_cleanup`: apply the kline retention policy and drain
/// pending indicator-cache writes.
pub struct DataCleanupHandler {
    pub store: Arc<KlineStore>,
    pub indicator_cache: Arc<IndicatorCache>,
    pub fallback: Arc<FallbackStrategy>,
    pub retention_days: i64,
}

#[async_trait]
impl TaskHandler for DataCleanupHandler {
    async fn handle(
        &self,
        _payload: &serde_json::Value,
        _token: &CancellationToken,
    ) -> Result<(), MarketError> {
        let cutoff = Utc::now() - Duration::days(self.retention_days);
        match self.store.prune_before(cutoff).await {
            Ok(removed) => {
                self.fallback.record_success(Component::Database);
                tracing::debug!("Cleanup removed {removed} bars");
            }
            Err(e) => {
                self.fallback.record_failure(Component::Database);
                return Err(e);
            }
        }

        self.indicator_cache.flush().await;
        Ok(())
    }
}
