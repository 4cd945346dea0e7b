use chrono::Duration;
use market_core::{MarketError, TimeRange};
use tokio_util::sync::CancellationToken;

use crate::engine::BacktestEngine;
use crate::models::{AttributionResult, BacktestConfig};

impl BacktestEngine {
    /// Benchmark attribution over the trailing `horizon_days` of the
    /// config window: CAPM-style beta/alpha of the strategy's bar returns
    /// against the benchmark's close-to-close returns.
    pub async fn attribution(
        &self,
        base: &BacktestConfig,
        benchmark_symbol: &str,
        horizon_days: u32,
        token: &CancellationToken,
    ) -> Result<AttributionResult, MarketError> {
        base.validate()?;
        if benchmark_symbol.is_empty() {
            return Err(MarketError::InvalidInput("benchmark symbol is empty".into()));
        }
        if horizon_days == 0 {
            return Err(MarketError::InvalidInput("horizon must be positive".into()));
        }

        let mut config = base.clone();
        let horizon_start = base.end - Duration::days(horizon_days as i64);
        if horizon_start > config.start {
            config.start = horizon_start;
        }

        let strategy = self.run(&config, token).await?;

        let bench_range = TimeRange::new(config.start, config.end);
        let bench_bars = self
            .provider()
            .historical_bars(benchmark_symbol, config.timeframe, bench_range, token)
            .await?;

        let bench_returns: Vec<f64> = bench_bars
            .windows(2)
            .filter(|w| w[0].close > 0.0)
            .map(|w| w[1].close / w[0].close - 1.0)
            .collect();

        let n = strategy.daily_returns.len().min(bench_returns.len());
        if n < 2 {
            return Err(MarketError::InsufficientData(
                "not enough aligned returns for attribution".into(),
            ));
        }
        let s = &strategy.daily_returns[strategy.daily_returns.len() - n..];
        let b = &bench_returns[bench_returns.len() - n..];

        let mean_s = s.iter().sum::<f64>() / n as f64;
        let mean_b = b.iter().sum::<f64>() / n as f64;

        let mut cov = 0.0;
        let mut var_b = 0.0;
        let mut var_s = 0.0;
        for i in 0..n {
            cov += (s[i] - mean_s) * (b[i] - mean_b);
            var_b += (b[i] - mean_b).powi(2);
            var_s += (s[i] - mean_s).powi(2);
        }
        cov /= n as f64;
        var_b /= n as f64;
        var_s /= n as f64;

        let beta = if var_b > 0.0 { cov / var_b } else { 0.0 };
        let r_squared = if var_b > 0.0 && var_s > 0.0 {
            (cov * cov) / (var_b * var_s)
        } else {
            0.0
        };

        let minutes = config.timeframe.duration().num_minutes().max(1) as f64;
        let periods_per_year = 365.0 * 24.0 * 60.0 / minutes;
        let alpha = (mean_s - beta * mean_b) * periods_per_year;

        let diffs: Vec<f64> = (0..n).map(|i| s[i] - b[i]).collect();
        let mean_diff = diffs.iter().sum::<f64>() / n as f64;
        let tracking_var =
            diffs.iter().map(|d| (d - mean_diff).powi(2)).sum::<f64>() / n as f64;
        let tracking_error = tracking_var.sqrt() * periods_per_year.sqrt();

        let benchmark_return = if let (Some(first), Some(last)) =
            (bench_bars.first(), bench_bars.last())
        {
            if first.close > 0.0 {
                last.close / first.close - 1.0
            } else {
                0.0
            }
        } else {
            0.0
        };

        Ok(AttributionResult {
            benchmark_symbol: benchmark_symbol.to_string(),
            strategy_return: strategy.summary.total_return,
            benchmark_return,
            beta,
            alpha,
            r_squared,
            tracking_error,
        })
    }
}
