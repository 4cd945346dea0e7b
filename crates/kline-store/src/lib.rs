use chrono::{DateTime, Duration, Utc};
use market_core::{Bar, Interval, MarketError, MarketKind};
use sqlx::SqlitePool;

/// Canonical store of validated OHLCV bars, keyed on
/// `(symbol, kind, interval, open_time)`.
///
/// Reads come back strictly ascending by open-time; missing slots are
/// materialised as invalid placeholder bars that inherit the prior close,
/// so consumers always see a constant stride.
pub struct KlineStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct KlineRow {
    symbol: String,
    kind: String,
    interval: String,
    open_time: i64,
    open_price: f64,
    high_price: f64,
    low_price: f64,
    close_price: f64,
    volume: f64,
    is_valid: bool,
    quality_score: i64,
}

impl KlineRow {
    fn into_bar(self) -> Option<Bar> {
        Some(Bar {
            symbol: self.symbol,
            kind: MarketKind::parse(&self.kind)?,
            interval: Interval::parse(&self.interval)?,
            open_time: DateTime::from_timestamp_millis(self.open_time)?,
            open: self.open_price,
            high: self.high_price,
            low: self.low_price,
            close: self.close_price,
            volume: self.volume,
            is_valid: self.is_valid,
            quality_score: self.quality_score.clamp(0, 100) as u8,
        })
    }
}

impl KlineStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_tables(&self) -> Result<(), MarketError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS market_klines (
                symbol TEXT NOT NULL,
                kind TEXT NOT NULL,
                interval TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                open_price REAL NOT NULL,
                high_price REAL NOT NULL,
                low_price REAL NOT NULL,
                close_price REAL NOT NULL,
                volume REAL NOT NULL,
                is_valid INTEGER NOT NULL DEFAULT 1,
                quality_score INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (symbol, kind, interval, open_time)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MarketError::Database(e.to_string()))?;

        Ok(())
    }

    /// Keyed upsert: conflicting rows are overwritten field-for-field, so
    /// re-applying the same batch is idempotent.
    pub async fn upsert_bars(&self, bars: &[Bar]) -> Result<u64, MarketError> {
        let mut written = 0u64;

        for bar in bars {
            sqlx::query(
                "INSERT INTO market_klines (
                    symbol, kind, interval, open_time,
                    open_price, high_price, low_price, close_price, volume,
                    is_valid, quality_score
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (symbol, kind, interval, open_time) DO UPDATE SET
                    open_price = excluded.open_price,
                    high_price = excluded.high_price,
                    low_price = excluded.low_price,
                    close_price = excluded.close_price,
                    volume = excluded.volume,
                    is_valid = excluded.is_valid,
                    quality_score = excluded.quality_score,
                    updated_at = CURRENT_TIMESTAMP",
            )
            .bind(&bar.symbol)
            .bind(bar.kind.as_str())
            .bind(bar.interval.as_str())
            .bind(bar.open_time.timestamp_millis())
            .bind(bar.open)
            .bind(bar.high)
            .bind(bar.low)
            .bind(bar.close)
            .bind(bar.volume)
            .bind(bar.is_valid)
            .bind(bar.quality_score as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| MarketError::Database(e.to_string()))?;

            written += 1;
        }

        Ok(written)
    }

    /// Fetch up to `max_points` of the most recent bars in `[from, to)`,
    /// returned ascending with gap slots filled by placeholders.
    pub async fn get_bars(
        &self,
        symbol: &str,
        kind: MarketKind,
        interval: Interval,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Result<Vec<Bar>, MarketError> {
        let from_ms = from.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);
        let to_ms = to.map(|t| t.timestamp_millis()).unwrap_or(i64::MAX);

        let rows: Vec<KlineRow> = sqlx::query_as(
            "SELECT symbol, kind, interval, open_time,
                    open_price, high_price, low_price, close_price, volume,
                    is_valid, quality_score
             FROM market_klines
             WHERE symbol = ? AND kind = ? AND interval = ?
               AND open_time >= ? AND open_time < ?
             ORDER BY open_time DESC
             LIMIT ?",
        )
        .bind(symbol)
        .bind(kind.as_str())
        .bind(interval.as_str())
        .bind(from_ms)
        .bind(to_ms)
        .bind(max_points as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MarketError::Database(e.to_string()))?;

        let mut bars: Vec<Bar> = rows.into_iter().filter_map(KlineRow::into_bar).collect();
        bars.reverse();

        Ok(fill_gaps(bars, interval))
    }

    /// True iff the newest bar's close-time is within `max_age` of now.
    pub async fn is_fresh(
        &self,
        symbol: &str,
        kind: MarketKind,
        interval: Interval,
        max_age: Duration,
    ) -> Result<bool, MarketError> {
        let newest = self.latest_open_time(symbol, kind, interval).await?;

        Ok(match newest {
            Some(open_time) => {
                let close_time = open_time + interval.duration();
                Utc::now() - close_time <= max_age
            }
            None => false,
        })
    }

    pub async fn latest_open_time(
        &self,
        symbol: &str,
        kind: MarketKind,
        interval: Interval,
    ) -> Result<Option<DateTime<Utc>>, MarketError> {
        let (newest_ms,): (Option<i64>,) = sqlx::query_as(
            "SELECT MAX(open_time) FROM market_klines
             WHERE symbol = ? AND kind = ? AND interval = ?",
        )
        .bind(symbol)
        .bind(kind.as_str())
        .bind(interval.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| MarketError::Database(e.to_string()))?;

        Ok(newest_ms.and_then(DateTime::from_timestamp_millis))
    }

    pub async fn count_bars(
        &self,
        symbol: &str,
        kind: MarketKind,
        interval: Interval,
    ) -> Result<i64, MarketError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM market_klines
             WHERE symbol = ? AND kind = ? AND interval = ?",
        )
        .bind(symbol)
        .bind(kind.as_str())
        .bind(interval.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| MarketError::Database(e.to_string()))?;

        Ok(count)
    }

    /// Retention: delete bars whose open-time precedes `cutoff`.
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, MarketError> {
        let result = sqlx::query("DELETE FROM market_klines WHERE open_time < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| MarketError::Database(e.to_string()))?;

        let removed = result.rows_affected();
        if removed > 0 {
            tracing::info!("Pruned {removed} bars older than {cutoff}");
        }
        Ok(removed)
    }
}

/// Rebuild a constant-stride series: any missing open-time slot between
/// consecutive stored bars becomes an invalid placeholder holding the
/// prior close.
pub fn fill_gaps(bars: Vec<Bar>, interval: Interval) -> Vec<Bar> {
    if bars.len() < 2 {
        return bars;
    }

    let stride = interval.duration();
    let mut filled = Vec::with_capacity(bars.len());
    let mut iter = bars.into_iter();
    let first = match iter.next() {
        Some(b) => b,
        None => return Vec::new(),
    };

    let mut prev_close = first.close;
    let mut expected = first.open_time + stride;
    filled.push(first);

    for bar in iter {
        while bar.open_time > expected {
            filled.push(Bar::gap_placeholder(
                &bar.symbol,
                bar.kind,
                bar.interval,
                expected,
                prev_close,
            ));
            expected = expected + stride;
        }
        prev_close = bar.close;
        expected = bar.open_time + stride;
        filled.push(bar);
    }

    filled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(offset_hours: i64, close: f64) -> Bar {
        let base = DateTime::from_timestamp_millis(1_700_000_400_000).unwrap();
        Bar {
            symbol: "BTCUSDT".into(),
            kind: MarketKind::Spot,
            interval: Interval::Hour1,
            open_time: base + Duration::hours(offset_hours),
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            volume: 10.0,
            is_valid: true,
            quality_score: 90,
        }
    }

    async fn store() -> KlineStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = KlineStore::new(pool);
        store.init_tables().await.unwrap();
        store
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = store().await;
        let bars = vec![bar(0, 100.0), bar(1, 101.0)];

        store.upsert_bars(&bars).await.unwrap();
        store.upsert_bars(&bars).await.unwrap();

        assert_eq!(
            store
                .count_bars("BTCUSDT", MarketKind::Spot, Interval::Hour1)
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn upsert_overwrites_conflicting_fields() {
        let store = store().await;
        store.upsert_bars(&[bar(0, 100.0)]).await.unwrap();

        let mut updated = bar(0, 100.0);
        updated.close = 250.0;
        store.upsert_bars(&[updated]).await.unwrap();

        let bars = store
            .get_bars("BTCUSDT", MarketKind::Spot, Interval::Hour1, None, None, 10)
            .await
            .unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 250.0);
    }

    #[tokio::test]
    async fn reads_are_ascending_with_gap_placeholders() {
        let store = store().await;
        // Hours 0, 1, 4 — slots 2 and 3 are missing.
        store
            .upsert_bars(&[bar(0, 100.0), bar(1, 101.0), bar(4, 104.0)])
            .await
            .unwrap();

        let bars = store
            .get_bars("BTCUSDT", MarketKind::Spot, Interval::Hour1, None, None, 10)
            .await
            .unwrap();

        assert_eq!(bars.len(), 5);
        for w in bars.windows(2) {
            assert_eq!(w[1].open_time - w[0].open_time, Duration::hours(1));
        }
        assert!(!bars[2].is_valid);
        assert!(!bars[3].is_valid);
        assert_eq!(bars[2].close, 101.0);
        assert_eq!(bars[3].close, 101.0);
        assert!(bars[4].is_valid);
    }

    #[tokio::test]
    async fn range_and_limit_apply_before_gap_fill() {
        let store = store().await;
        let all: Vec<Bar> = (0..10).map(|i| bar(i, 100.0 + i as f64)).collect();
        store.upsert_bars(&all).await.unwrap();

        let bars = store
            .get_bars("BTCUSDT", MarketKind::Spot, Interval::Hour1, None, None, 3)
            .await
            .unwrap();

        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].close, 107.0);
        assert_eq!(bars[2].close, 109.0);
    }

    #[tokio::test]
    async fn freshness_tracks_newest_close_time() {
        let store = store().await;
        assert!(!store
            .is_fresh("BTCUSDT", MarketKind::Spot, Interval::Hour1, Duration::hours(2))
            .await
            .unwrap());

        let mut recent = bar(0, 100.0);
        recent.open_time = Utc::now() - Duration::minutes(30);
        store.upsert_bars(&[recent]).await.unwrap();

        assert!(store
            .is_fresh("BTCUSDT", MarketKind::Spot, Interval::Hour1, Duration::hours(2))
            .await
            .unwrap());
        assert!(!store
            .is_fresh("BTCUSDT", MarketKind::Spot, Interval::Minute1, Duration::minutes(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn prune_removes_old_rows() {
        let store = store().await;
        let all: Vec<Bar> = (0..5).map(|i| bar(i, 100.0)).collect();
        store.upsert_bars(&all).await.unwrap();

        let cutoff = all[2].open_time;
        let removed = store.prune_before(cutoff).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(
            store
                .count_bars("BTCUSDT", MarketKind::Spot, Interval::Hour1)
                .await
                .unwrap(),
            3
        );
    }
}
