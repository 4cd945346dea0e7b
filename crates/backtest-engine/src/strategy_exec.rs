use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use market_core::{Bar, HistoricalDataProvider, Interval, MarketError, TimeRange};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::db::BacktestDb;
use crate::models::ExitReason;

/// Direction variant picked from the observed 24h move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StrategyVariant {
    Long,
    Short,
    Range,
}

/// Risk parameters applied to one recommendation simulation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskParams {
    pub stop_loss: f64,
    pub take_profit: f64,
    pub max_holding_hours: i64,
    pub trailing_stop: bool,
    pub trailing_pct: f64,
}

impl RiskParams {
    /// Defaults: 3% stop, 8% target, 24h holding, 1.5% trailing stop.
    pub fn standard() -> Self {
        Self {
            stop_loss: 0.03,
            take_profit: 0.08,
            max_holding_hours: 24,
            trailing_stop: true,
            trailing_pct: 0.015,
        }
    }

    /// Tightened variant for symbols with violent history.
    pub fn tightened() -> Self {
        Self {
            stop_loss: 0.02,
            take_profit: 0.06,
            max_holding_hours: 12,
            trailing_stop: true,
            trailing_pct: 0.01,
        }
    }
}

/// The recommendation being replayed against real bars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationInput {
    pub recommendation_id: i64,
    pub symbol: String,
    pub recommended_at: DateTime<Utc>,
    pub recommended_price: f64,
    pub total_score: f64,
    /// Observed 24h return of the underlying at recommendation time.
    pub return_24h: f64,
    #[serde(default)]
    pub historical_max_drawdown: Option<f64>,
    #[serde(default)]
    pub historical_max_gain: Option<f64>,
}

/// Result of one recommendation simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationOutcome {
    pub variant: StrategyVariant,
    pub params: RiskParams,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_reason: ExitReason,
    /// Directional return of the trade (positive = favourable).
    pub actual_return: f64,
    pub holding_minutes: i64,
    /// Max favourable excursion along the path (>= 0).
    pub mfe: f64,
    /// Max adverse excursion along the path (<= 0).
    pub mae: f64,
}

/// Simulates one strategy variant per recommendation over real bars and
/// persists the outcome. Refuses to run without real data.
pub struct StrategyExecutor {
    data: Arc<dyn HistoricalDataProvider>,
    db: Option<Arc<BacktestDb>>,
}

impl StrategyExecutor {
    pub fn new(data: Arc<dyn HistoricalDataProvider>) -> Self {
        Self { data, db: None }
    }

    pub fn with_db(mut self, db: Arc<BacktestDb>) -> Self {
        self.db = Some(db);
        self
    }

    /// Variant selection: >5% 24h move rides LONG, <-5% rides SHORT,
    /// everything else trades the RANGE.
    pub fn pick_variant(return_24h: f64) -> StrategyVariant {
        if return_24h > 0.05 {
            StrategyVariant::Long
        } else if return_24h < -0.05 {
            StrategyVariant::Short
        } else {
            StrategyVariant::Range
        }
    }

    /// Default risk, tightened when history shows deep drawdowns or
    /// outsized spikes.
    pub fn pick_params(input: &RecommendationInput) -> RiskParams {
        let violent = input.historical_max_drawdown.is_some_and(|dd| dd < -0.10)
            || input.historical_max_gain.is_some_and(|g| g > 0.20);
        if violent {
            RiskParams::tightened()
        } else {
            RiskParams::standard()
        }
    }

    pub async fn execute(
        &self,
        input: &RecommendationInput,
        token: &CancellationToken,
    ) -> Result<SimulationOutcome, MarketError> {
        if input.recommended_price <= 0.0 {
            return Err(MarketError::InvalidInput(
                "recommended_price must be positive".into(),
            ));
        }

        let variant = Self::pick_variant(input.return_24h);
        let params = Self::pick_params(input);

        if let Some(db) = &self.db {
            db.seed_performance(
                input.recommendation_id,
                &input.symbol,
                input.recommended_at,
                input.recommended_price,
                input.total_score,
            )
            .await?;
            db.mark_performance_running(input.recommendation_id).await?;
        }

        let result = self.simulate(input, variant, params, token).await;

        // Persistence failures are logged, never allowed to mask the
        // simulation outcome itself.
        match &result {
            Ok(outcome) => {
                if let Some(db) = &self.db {
                    let config_json = serde_json::to_string(&params)
                        .unwrap_or_else(|_| "{}".to_string());
                    if let Err(e) = db
                        .complete_performance(input.recommendation_id, outcome, &config_json)
                        .await
                    {
                        tracing::warn!(
                            "Failed to persist outcome for recommendation {}: {e}",
                            input.recommendation_id
                        );
                    }
                }
            }
            Err(MarketError::Cancelled) => {}
            Err(e) => {
                if let Some(db) = &self.db {
                    if let Err(db_err) = db
                        .fail_performance(input.recommendation_id, &e.to_string())
                        .await
                    {
                        tracing::warn!(
                            "Failed to mark recommendation {} failed: {db_err}",
                            input.recommendation_id
                        );
                    }
                }
            }
        }

        result
    }

    async fn simulate(
        &self,
        input: &RecommendationInput,
        variant: StrategyVariant,
        params: RiskParams,
        token: &CancellationToken,
    ) -> Result<SimulationOutcome, MarketError> {
        let range = TimeRange::new(
            input.recommended_at,
            input.recommended_at + Duration::hours(params.max_holding_hours + 2),
        );
        let bars: Vec<Bar> = self
            .data
            .historical_bars(&input.symbol, Interval::Hour1, range, token)
            .await?
            .into_iter()
            .filter(|b| b.is_valid)
            .collect();

        // No real bars, no simulation. Mock data never backs a stored outcome.
        if bars.len() < 2 {
            return Err(MarketError::InsufficientData(format!(
                "{} real bars for {} after {}",
                bars.len(),
                input.symbol,
                input.recommended_at
            )));
        }

        let entry = &bars[0];
        let entry_price = entry.close;
        let entry_time = entry.open_time;
        if entry_price <= 0.0 {
            return Err(MarketError::StrategyFailure("entry price is not positive".into()));
        }

        let directional = |price: f64| -> f64 {
            match variant {
                StrategyVariant::Long | StrategyVariant::Range => (price - entry_price) / entry_price,
                StrategyVariant::Short => (entry_price - price) / entry_price,
            }
        };

        let mut mfe = 0.0f64;
        let mut mae = 0.0f64;
        let mut peak_return = 0.0f64;
        let max_holding = Duration::hours(params.max_holding_hours);

        let mut exit: Option<(ExitReason, &Bar)> = None;

        for bar in &bars[1..] {
            // Excursions use the bar extremes, not just the close.
            let (favourable, adverse) = match variant {
                StrategyVariant::Long | StrategyVariant::Range => {
                    (directional(bar.high), directional(bar.low))
                }
                StrategyVariant::Short => (directional(bar.low), directional(bar.high)),
            };
            mfe = mfe.max(favourable);
            mae = mae.min(adverse);

            let r = directional(bar.close);

            if r <= -params.stop_loss {
                exit = Some((ExitReason::Loss, bar));
                break;
            }
            if r >= params.take_profit {
                exit = Some((ExitReason::Profit, bar));
                break;
            }
            if variant == StrategyVariant::Range && r >= params.take_profit / 2.0 {
                exit = Some((ExitReason::RangeTarget, bar));
                break;
            }
            if params.trailing_stop {
                peak_return = peak_return.max(r);
                if peak_return - r >= params.trailing_pct && peak_return > 0.0 {
                    exit = Some((
                        if r > 0.0 { ExitReason::Profit } else { ExitReason::Loss },
                        bar,
                    ));
                    break;
                }
            }
            if bar.close_time() - entry_time >= max_holding {
                exit = Some((ExitReason::Time, bar));
                break;
            }
        }

        let (exit_reason, exit_bar) = exit.unwrap_or((ExitReason::Force, &bars[bars.len() - 1]));
        let exit_price = exit_bar.close;
        let actual_return = directional(exit_price);
        if !actual_return.is_finite() {
            return Err(MarketError::StrategyFailure(
                "simulated return is not finite".into(),
            ));
        }

        // Sanity gate: a simulated move beyond twice what the underlying
        // actually did within 24h is a data artifact, not a result. A flat
        // 24h window therefore rejects any nonzero simulated return.
        let ceiling = 2.0 * input.return_24h.abs();
        if actual_return.abs() > ceiling {
            return Err(MarketError::StrategyFailure(format!(
                "simulated return {:.4} exceeds 2x the observed 24h move {:.4}",
                actual_return, input.return_24h
            )));
        }

        let exit_time = exit_bar.close_time();

        Ok(SimulationOutcome {
            variant,
            params,
            entry_price,
            entry_time,
            exit_price,
            exit_time,
            exit_reason,
            actual_return,
            holding_minutes: (exit_time - entry_time).num_minutes(),
            mfe,
            mae,
        })
    }
}
