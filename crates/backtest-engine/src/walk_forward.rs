use chrono::Duration;
use market_core::MarketError;
use tokio_util::sync::CancellationToken;

use crate::engine::BacktestEngine;
use crate::models::*;

/// Calendar months are approximated as 30 days for window arithmetic.
const DAYS_PER_MONTH: i64 = 30;

impl BacktestEngine {
    /// Rolling in-sample/out-of-sample validation.
    ///
    /// `[start, end]` is sliced into windows of `in_sample + out_of_sample`
    /// months advanced by `step` months. Each window optimises on the
    /// in-sample span and evaluates the winning parameters out-of-sample;
    /// only out-of-sample metrics are aggregated.
    pub async fn walk_forward(
        &self,
        base: &BacktestConfig,
        in_sample_months: u32,
        out_of_sample_months: u32,
        step_months: u32,
        token: &CancellationToken,
    ) -> Result<WalkForwardResult, MarketError> {
        base.validate()?;
        if in_sample_months == 0 || out_of_sample_months == 0 || step_months == 0 {
            return Err(MarketError::InvalidInput(
                "walk-forward window sizes must be positive".into(),
            ));
        }

        let in_sample = Duration::days(DAYS_PER_MONTH * in_sample_months as i64);
        let out_of_sample = Duration::days(DAYS_PER_MONTH * out_of_sample_months as i64);
        let step = Duration::days(DAYS_PER_MONTH * step_months as i64);
        let ranges = ParamRanges::around(base);

        let mut windows: Vec<WalkForwardWindow> = Vec::new();
        let mut cursor = base.start;

        while cursor + in_sample + out_of_sample <= base.end {
            if token.is_cancelled() {
                return Err(MarketError::Cancelled);
            }

            let window_number = windows.len() as u32 + 1;
            let is_start = cursor;
            let is_end = cursor + in_sample;
            let oos_start = is_end;
            let oos_end = is_end + out_of_sample;

            let mut in_sample_config = base.clone();
            in_sample_config.start = is_start;
            in_sample_config.end = is_end;

            let optimised = self
                .optimize(
                    &in_sample_config,
                    &ranges,
                    Objective::Sharpe,
                    OptimizeMethod::Grid,
                    ranges.expand(base).len(),
                    None,
                    token,
                )
                .await;

            match optimised {
                Ok(result) => {
                    let mut oos_config = result.best.params.apply(base);
                    oos_config.start = oos_start;
                    oos_config.end = oos_end;

                    match self.run(&oos_config, token).await {
                        Ok(oos) => windows.push(WalkForwardWindow {
                            window_number,
                            in_sample_start: is_start,
                            in_sample_end: is_end,
                            out_of_sample_start: oos_start,
                            out_of_sample_end: oos_end,
                            best_params: result.best.params,
                            in_sample_return: result.best.summary.total_return,
                            out_of_sample_return: oos.summary.total_return,
                            out_of_sample_sharpe: oos.summary.sharpe,
                            out_of_sample_trades: oos.summary.total_trades,
                        }),
                        Err(MarketError::Cancelled) => return Err(MarketError::Cancelled),
                        Err(e) => {
                            tracing::warn!("Walk-forward window {window_number} OOS run failed: {e}")
                        }
                    }
                }
                Err(MarketError::Cancelled) => return Err(MarketError::Cancelled),
                Err(e) => {
                    tracing::warn!("Walk-forward window {window_number} optimisation failed: {e}")
                }
            }

            cursor = cursor + step;
        }

        if windows.is_empty() {
            return Err(MarketError::InsufficientData(
                "date range does not fit a single walk-forward window".into(),
            ));
        }

        let n = windows.len() as f64;
        let avg_is = windows.iter().map(|w| w.in_sample_return).sum::<f64>() / n;
        let avg_oos = windows.iter().map(|w| w.out_of_sample_return).sum::<f64>() / n;
        let overfitting_ratio = if avg_oos.abs() > f64::EPSILON {
            avg_is / avg_oos
        } else {
            f64::INFINITY
        };

        Ok(WalkForwardResult {
            total_out_of_sample_trades: windows.iter().map(|w| w.out_of_sample_trades).sum(),
            avg_in_sample_return: avg_is,
            avg_out_of_sample_return: avg_oos,
            overfitting_ratio,
            windows,
        })
    }
}
