use chrono::{DateTime, Utc};
use market_core::MarketError;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::models::{BacktestConfig, BacktestResult};
use crate::strategy_exec::SimulationOutcome;

/// Stored numbers are clamped to the table precision DECIMAL(10,4):
/// ±999,999.9999.
pub fn clamp_stored(value: f64) -> f64 {
    let limit = Decimal::new(9_999_999_999, 4);
    Decimal::from_f64(value)
        .unwrap_or_default()
        .round_dp(4)
        .clamp(-limit, limit)
        .to_f64()
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

/// Listing filter for the paged record query.
#[derive(Debug, Clone)]
pub struct RecordFilter {
    pub user_id: Option<i64>,
    pub symbol: Option<String>,
    pub status: Option<RunStatus>,
    pub page: u32,
    pub page_size: u32,
}

impl Default for RecordFilter {
    fn default() -> Self {
        Self {
            user_id: None,
            symbol: None,
            status: None,
            page: 0,
            page_size: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BacktestRecord {
    pub id: i64,
    pub user_id: i64,
    pub symbol: String,
    pub strategy: String,
    pub start_date: String,
    pub end_date: String,
    pub status: String,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub initial_capital: f64,
    pub position_size: f64,
}

/// Persists backtest runs and recommendation-performance rows.
pub struct BacktestDb {
    pool: SqlitePool,
}

impl BacktestDb {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_tables(&self) -> Result<(), MarketError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS async_backtest_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                strategy TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                result TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                completed_at TEXT,
                initial_capital REAL NOT NULL,
                position_size REAL NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MarketError::Database(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS recommendation_performance (
                recommendation_id INTEGER PRIMARY KEY,
                symbol TEXT NOT NULL,
                recommended_at INTEGER NOT NULL,
                recommended_price REAL NOT NULL,
                total_score REAL NOT NULL,
                price_24h REAL,
                price_7d REAL,
                price_30d REAL,
                return_24h REAL,
                return_7d REAL,
                return_30d REAL,
                max_gain REAL,
                max_drawdown REAL,
                entry_price REAL,
                entry_time INTEGER,
                exit_price REAL,
                exit_time INTEGER,
                exit_reason TEXT,
                actual_return REAL,
                holding_period_minutes INTEGER,
                mfe REAL,
                mae REAL,
                strategy_config TEXT,
                status TEXT NOT NULL DEFAULT 'pending'
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MarketError::Database(e.to_string()))?;

        Ok(())
    }

    // --- async backtest records ---

    pub async fn create_record(
        &self,
        user_id: i64,
        config: &BacktestConfig,
    ) -> Result<i64, MarketError> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO async_backtest_records (
                user_id, symbol, strategy, start_date, end_date,
                status, initial_capital, position_size
            ) VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)
            RETURNING id",
        )
        .bind(user_id)
        .bind(&config.symbol)
        .bind(config.strategy.as_str())
        .bind(config.start.to_rfc3339())
        .bind(config.end.to_rfc3339())
        .bind(config.initial_cash)
        .bind(config.max_position)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| MarketError::Database(e.to_string()))?;

        Ok(id)
    }

    pub async fn mark_record_running(&self, id: i64) -> Result<(), MarketError> {
        sqlx::query("UPDATE async_backtest_records SET status = 'running' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| MarketError::Database(e.to_string()))?;
        Ok(())
    }

    pub async fn complete_record(
        &self,
        id: i64,
        result: &BacktestResult,
    ) -> Result<(), MarketError> {
        let result_json = serde_json::to_string(result)
            .map_err(|e| MarketError::Internal(format!("result serialisation failed: {e}")))?;

        sqlx::query(
            "UPDATE async_backtest_records
             SET status = 'completed', result = ?, completed_at = CURRENT_TIMESTAMP
             WHERE id = ?",
        )
        .bind(result_json)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| MarketError::Database(e.to_string()))?;
        Ok(())
    }

    pub async fn fail_record(&self, id: i64, error: &str) -> Result<(), MarketError> {
        sqlx::query(
            "UPDATE async_backtest_records
             SET status = 'failed', error_message = ?, completed_at = CURRENT_TIMESTAMP
             WHERE id = ?",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| MarketError::Database(e.to_string()))?;
        Ok(())
    }

    /// Paged, sorted, filterable listing (newest first).
    pub async fn list_records(
        &self,
        filter: &RecordFilter,
    ) -> Result<Vec<BacktestRecord>, MarketError> {
        let page_size = filter.page_size.clamp(1, 200) as i64;
        let offset = filter.page as i64 * page_size;
        let status = filter.status.map(|s| s.as_str().to_string());

        let rows: Vec<BacktestRecord> = sqlx::query_as(
            "SELECT id, user_id, symbol, strategy, start_date, end_date,
                    status, result, error_message, created_at, completed_at,
                    initial_capital, position_size
             FROM async_backtest_records
             WHERE (? IS NULL OR user_id = ?)
               AND (? IS NULL OR symbol = ?)
               AND (? IS NULL OR status = ?)
             ORDER BY created_at DESC, id DESC
             LIMIT ? OFFSET ?",
        )
        .bind(filter.user_id)
        .bind(filter.user_id)
        .bind(&filter.symbol)
        .bind(&filter.symbol)
        .bind(&status)
        .bind(&status)
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MarketError::Database(e.to_string()))?;

        Ok(rows)
    }

    // --- recommendation performance ---

    /// Seed (or reset) the performance row for a recommendation.
    pub async fn seed_performance(
        &self,
        recommendation_id: i64,
        symbol: &str,
        recommended_at: DateTime<Utc>,
        recommended_price: f64,
        total_score: f64,
    ) -> Result<(), MarketError> {
        sqlx::query(
            "INSERT INTO recommendation_performance (
                recommendation_id, symbol, recommended_at,
                recommended_price, total_score, status
            ) VALUES (?, ?, ?, ?, ?, 'pending')
            ON CONFLICT (recommendation_id) DO UPDATE SET
                symbol = excluded.symbol,
                recommended_at = excluded.recommended_at,
                recommended_price = excluded.recommended_price,
                total_score = excluded.total_score,
                status = 'pending'",
        )
        .bind(recommendation_id)
        .bind(symbol)
        .bind(recommended_at.timestamp_millis())
        .bind(clamp_stored(recommended_price))
        .bind(clamp_stored(total_score))
        .execute(&self.pool)
        .await
        .map_err(|e| MarketError::Database(e.to_string()))?;
        Ok(())
    }

    pub async fn mark_performance_running(&self, recommendation_id: i64) -> Result<(), MarketError> {
        sqlx::query("UPDATE recommendation_performance SET status = 'running' WHERE recommendation_id = ?")
            .bind(recommendation_id)
            .execute(&self.pool)
            .await
            .map_err(|e| MarketError::Database(e.to_string()))?;
        Ok(())
    }

    /// Record a completed simulation, clamped to the stored precision.
    pub async fn complete_performance(
        &self,
        recommendation_id: i64,
        outcome: &SimulationOutcome,
        strategy_config_json: &str,
    ) -> Result<(), MarketError> {
        sqlx::query(
            "UPDATE recommendation_performance SET
                entry_price = ?, entry_time = ?,
                exit_price = ?, exit_time = ?, exit_reason = ?,
                actual_return = ?, holding_period_minutes = ?,
                mfe = ?, mae = ?, strategy_config = ?,
                status = 'completed'
             WHERE recommendation_id = ?",
        )
        .bind(clamp_stored(outcome.entry_price))
        .bind(outcome.entry_time.timestamp_millis())
        .bind(clamp_stored(outcome.exit_price))
        .bind(outcome.exit_time.timestamp_millis())
        .bind(outcome.exit_reason.as_str())
        .bind(clamp_stored(outcome.actual_return))
        .bind(outcome.holding_minutes)
        .bind(clamp_stored(outcome.mfe))
        .bind(clamp_stored(outcome.mae))
        .bind(strategy_config_json)
        .bind(recommendation_id)
        .execute(&self.pool)
        .await
        .map_err(|e| MarketError::Database(e.to_string()))?;
        Ok(())
    }

    pub async fn fail_performance(
        &self,
        recommendation_id: i64,
        _error: &str,
    ) -> Result<(), MarketError> {
        sqlx::query("UPDATE recommendation_performance SET status = 'failed' WHERE recommendation_id = ?")
            .bind(recommendation_id)
            .execute(&self.pool)
            .await
            .map_err(|e| MarketError::Database(e.to_string()))?;
        Ok(())
    }

    pub async fn performance_status(
        &self,
        recommendation_id: i64,
    ) -> Result<Option<String>, MarketError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM recommendation_performance WHERE recommendation_id = ?",
        )
        .bind(recommendation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MarketError::Database(e.to_string()))?;

        Ok(row.map(|(s,)| s))
    }
}
