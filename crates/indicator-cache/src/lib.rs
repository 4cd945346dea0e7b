use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use indicator_engine::{compute_bundle, IndicatorBundle};
use market_core::{Bar, Interval, MarketError, MarketKind};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};

const LOCAL_TTL_SECS: i64 = 300; // 5 minutes
const DURABLE_FRESHNESS_SECS: i64 = 300;
const WRITE_QUEUE_CAPACITY: usize = 64;

struct CacheEntry {
    bundle: IndicatorBundle,
    cached_at: DateTime<Utc>,
}

enum WriteJob {
    Upsert {
        symbol: String,
        kind: MarketKind,
        interval: Interval,
        data_points: usize,
        indicators_json: String,
        calculated_at: DateTime<Utc>,
        data_from: Option<DateTime<Utc>>,
        data_to: Option<DateTime<Utc>>,
    },
    Flush(oneshot::Sender<()>),
}

/// Hit/miss counters for observability.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Memoises indicator bundles per `(symbol, kind, interval, data_points)`.
///
/// Lookup order: process-local map (5m TTL) → durable row (fresh within
/// 5m) → compute from the provided bars. Durable writes go through a
/// bounded background worker so request paths never block on the write.
pub struct IndicatorCache {
    local: DashMap<String, CacheEntry>,
    pool: SqlitePool,
    writer_tx: mpsc::Sender<WriteJob>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Keys are fixed string compositions so prefix invalidation is
/// deterministic; no hashing is involved.
pub fn cache_key(symbol: &str, kind: MarketKind, interval: Interval, data_points: usize) -> String {
    format!("{symbol}:{}:{}:{data_points}", kind.as_str(), interval.as_str())
}

impl IndicatorCache {
    pub fn new(pool: SqlitePool) -> Self {
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        tokio::spawn(write_worker(pool.clone(), writer_rx));

        Self {
            local: DashMap::new(),
            pool,
            writer_tx,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub async fn init_tables(&self) -> Result<(), MarketError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS technical_indicators_caches (
                symbol TEXT NOT NULL,
                kind TEXT NOT NULL,
                interval TEXT NOT NULL,
                data_points INTEGER NOT NULL,
                indicators TEXT NOT NULL,
                calculated_at INTEGER NOT NULL,
                data_from INTEGER,
                data_to INTEGER,
                PRIMARY KEY (symbol, kind, interval, data_points)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MarketError::Database(e.to_string()))?;

        Ok(())
    }

    /// Fetch or compute the indicator bundle for `bars`.
    ///
    /// `bars` must already be the window the caller wants scored; the
    /// cache trusts `data_points` as part of the identity.
    pub async fn get_indicators(
        &self,
        symbol: &str,
        kind: MarketKind,
        interval: Interval,
        data_points: usize,
        bars: &[Bar],
    ) -> IndicatorBundle {
        let key = cache_key(symbol, kind, interval, data_points);
        let now = Utc::now();

        if let Some(entry) = self.local.get(&key) {
            if now - entry.cached_at < Duration::seconds(LOCAL_TTL_SECS) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return entry.bundle.clone();
            }
        }

        if let Some(bundle) = self.load_durable(symbol, kind, interval, data_points, now).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.local.insert(
                key,
                CacheEntry {
                    bundle: bundle.clone(),
                    cached_at: now,
                },
            );
            return bundle;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let bundle = compute_bundle(bars);

        self.local.insert(
            key,
            CacheEntry {
                bundle: bundle.clone(),
                cached_at: now,
            },
        );

        match serde_json::to_string(&bundle) {
            Ok(indicators_json) => {
                let job = WriteJob::Upsert {
                    symbol: symbol.to_string(),
                    kind,
                    interval,
                    data_points,
                    indicators_json,
                    calculated_at: now,
                    data_from: bars.first().map(|b| b.open_time),
                    data_to: bars.last().map(|b| b.open_time),
                };
                if self.writer_tx.try_send(job).is_err() {
                    tracing::warn!("Indicator cache write queue full, dropping durable write for {symbol}");
                }
            }
            Err(e) => tracing::warn!("Failed to serialise indicator bundle: {e}"),
        }

        bundle
    }

    async fn load_durable(
        &self,
        symbol: &str,
        kind: MarketKind,
        interval: Interval,
        data_points: usize,
        now: DateTime<Utc>,
    ) -> Option<IndicatorBundle> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT indicators, calculated_at FROM technical_indicators_caches
             WHERE symbol = ? AND kind = ? AND interval = ? AND data_points = ?",
        )
        .bind(symbol)
        .bind(kind.as_str())
        .bind(interval.as_str())
        .bind(data_points as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| tracing::warn!("Indicator cache read failed: {e}"))
        .ok()
        .flatten();

        let (json, calculated_ms) = row?;
        let calculated_at = DateTime::from_timestamp_millis(calculated_ms)?;
        if now - calculated_at >= Duration::seconds(DURABLE_FRESHNESS_SECS) {
            return None;
        }

        serde_json::from_str(&json)
            .map_err(|e| tracing::warn!("Stale indicator JSON for {symbol}: {e}"))
            .ok()
    }

    /// Drop every local entry whose key starts with `prefix` and the
    /// matching durable rows. Key composition is fixed, so `"BTCUSDT:"`
    /// clears every bundle of that symbol.
    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<u64, MarketError> {
        self.local.retain(|key, _| !key.starts_with(prefix));

        let symbol = prefix.split(':').next().unwrap_or(prefix);
        let result = sqlx::query("DELETE FROM technical_indicators_caches WHERE symbol = ?")
            .bind(symbol)
            .execute(&self.pool)
            .await
            .map_err(|e| MarketError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Wait until every queued durable write has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writer_tx.send(WriteJob::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn write_worker(pool: SqlitePool, mut rx: mpsc::Receiver<WriteJob>) {
    while let Some(job) = rx.recv().await {
        match job {
            WriteJob::Flush(ack) => {
                let _ = ack.send(());
            }
            WriteJob::Upsert {
                symbol,
                kind,
                interval,
                data_points,
                indicators_json,
                calculated_at,
                data_from,
                data_to,
            } => {
                let result = sqlx::query(
                    "INSERT INTO technical_indicators_caches (
                        symbol, kind, interval, data_points,
                        indicators, calculated_at, data_from, data_to
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT (symbol, kind, interval, data_points) DO UPDATE SET
                        indicators = excluded.indicators,
                        calculated_at = excluded.calculated_at,
                        data_from = excluded.data_from,
                        data_to = excluded.data_to",
                )
                .bind(&symbol)
                .bind(kind.as_str())
                .bind(interval.as_str())
                .bind(data_points as i64)
                .bind(&indicators_json)
                .bind(calculated_at.timestamp_millis())
                .bind(data_from.map(|t| t.timestamp_millis()))
                .bind(data_to.map(|t| t.timestamp_millis()))
                .execute(&pool)
                .await;

                // Cache write failures never fail the request that queued them.
                if let Err(e) = result {
                    tracing::warn!("Indicator cache durable write failed for {symbol}: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_data::testkit::synthetic_bars;

    async fn cache() -> IndicatorCache {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let cache = IndicatorCache::new(pool);
        cache.init_tables().await.unwrap();
        cache
    }

    fn bars() -> Vec<Bar> {
        synthetic_bars(
            "BTCUSDT",
            MarketKind::Spot,
            Interval::Hour1,
            Utc::now() - Duration::hours(200),
            120,
            40_000.0,
            0.001,
            17,
        )
    }

    #[test]
    fn keys_compose_deterministically() {
        assert_eq!(
            cache_key("BTCUSDT", MarketKind::Spot, Interval::Hour1, 100),
            "BTCUSDT:spot:1h:100"
        );
    }

    #[tokio::test]
    async fn second_lookup_hits_local_tier() {
        let cache = cache().await;
        let bars = bars();

        let first = cache
            .get_indicators("BTCUSDT", MarketKind::Spot, Interval::Hour1, 120, &bars)
            .await;
        let second = cache
            .get_indicators("BTCUSDT", MarketKind::Spot, Interval::Hour1, 120, &bars)
            .await;

        assert_eq!(first.rsi, second.rsi);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn durable_tier_survives_local_eviction() {
        let cache = cache().await;
        let bars = bars();

        cache
            .get_indicators("BTCUSDT", MarketKind::Spot, Interval::Hour1, 120, &bars)
            .await;
        cache.flush().await;

        // Simulate a fresh process: local tier empty, durable row fresh.
        cache.local.clear();
        let again = cache
            .get_indicators("BTCUSDT", MarketKind::Spot, Interval::Hour1, 120, &bars)
            .await;

        assert!((0.0..=100.0).contains(&again.rsi));
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn prefix_invalidation_clears_both_tiers() {
        let cache = cache().await;
        let bars = bars();

        cache
            .get_indicators("BTCUSDT", MarketKind::Spot, Interval::Hour1, 120, &bars)
            .await;
        cache.flush().await;

        let removed = cache.invalidate_prefix("BTCUSDT:").await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.local.is_empty());

        // Next lookup recomputes.
        cache
            .get_indicators("BTCUSDT", MarketKind::Spot, Interval::Hour1, 120, &bars)
            .await;
        assert_eq!(cache.stats().misses, 2);
    }
}
