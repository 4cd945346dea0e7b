use market_core::{MarketError, TimeRange};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::engine::{BacktestEngine, MIN_BARS};
use crate::models::{BacktestConfig, MonteCarloResult};

impl BacktestEngine {
    /// Bootstrap Monte Carlo over the window's bar returns.
    ///
    /// Each simulation resamples `bootstrap_size` single-bar returns with
    /// replacement and replays them from the initial cash, producing a
    /// distribution of outcomes and a symmetric confidence interval.
    pub async fn monte_carlo(
        &self,
        base: &BacktestConfig,
        simulations: u32,
        bootstrap_size: usize,
        confidence_level: f64,
        token: &CancellationToken,
    ) -> Result<MonteCarloResult, MarketError> {
        base.validate()?;
        if simulations == 0 {
            return Err(MarketError::InvalidInput("simulations must be positive".into()));
        }
        if !(0.0 < confidence_level && confidence_level < 1.0) {
            return Err(MarketError::InvalidInput(
                "confidence_level must be in (0, 1)".into(),
            ));
        }

        let range = TimeRange::new(base.start, base.end);
        let bars = self
            .provider()
            .historical_bars(&base.symbol, base.timeframe, range, token)
            .await?;
        if bars.len() < MIN_BARS {
            return Err(MarketError::InsufficientData(format!(
                "{} bars fetched, {MIN_BARS} required",
                bars.len()
            )));
        }

        let returns: Vec<f64> = bars
            .windows(2)
            .filter(|w| w[0].close > 0.0)
            .map(|w| w[1].close / w[0].close - 1.0)
            .collect();
        if returns.is_empty() {
            return Err(MarketError::InsufficientData("no usable bar returns".into()));
        }

        let sample_len = if bootstrap_size == 0 {
            returns.len()
        } else {
            bootstrap_size
        };

        let outcomes: Vec<(f64, f64)> = (0..simulations)
            .into_par_iter()
            .map(|sim| {
                // Seed per simulation so runs are reproducible in tests.
                let mut rng = StdRng::seed_from_u64(0x5eed_0000 + sim as u64);
                let mut equity = 1.0f64;
                let mut peak = 1.0f64;
                let mut max_dd = 0.0f64;

                for _ in 0..sample_len {
                    let r = returns[rng.gen_range(0..returns.len())];
                    equity *= 1.0 + r;
                    if equity > peak {
                        peak = equity;
                    }
                    let dd = if peak > 0.0 { (peak - equity) / peak } else { 0.0 };
                    if dd > max_dd {
                        max_dd = dd;
                    }
                }

                (equity - 1.0, max_dd)
            })
            .collect();

        let mut sim_returns: Vec<f64> = outcomes.iter().map(|(r, _)| *r).collect();
        let mut drawdowns: Vec<f64> = outcomes.iter().map(|(_, d)| *d).collect();
        sim_returns.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        drawdowns.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let n = sim_returns.len() as f64;
        let mean = sim_returns.iter().sum::<f64>() / n;
        let variance = sim_returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;

        let tail = (1.0 - confidence_level) / 2.0;

        Ok(MonteCarloResult {
            simulations,
            bootstrap_size: sample_len,
            confidence_level,
            mean_return: mean,
            median_return: percentile(&sim_returns, 0.5),
            std_dev_return: variance.sqrt(),
            ci_lower: percentile(&sim_returns, tail),
            ci_upper: percentile(&sim_returns, 1.0 - tail),
            probability_of_profit: sim_returns.iter().filter(|r| **r > 0.0).count() as f64 / n,
            median_max_drawdown: percentile(&drawdowns, 0.5),
            return_distribution: sample_distribution(&sim_returns, 200),
        })
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (p * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn sample_distribution(sorted: &[f64], max_points: usize) -> Vec<f64> {
    if sorted.len() <= max_points {
        return sorted.to_vec();
    }
    let step = sorted.len() as f64 / max_points as f64;
    (0..max_points)
        .map(|i| sorted[(i as f64 * step) as usize])
        .collect()
}
