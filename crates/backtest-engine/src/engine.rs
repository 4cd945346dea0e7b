use std::sync::Arc;

use chrono::{DateTime, Utc};
use indicator_engine::indicators;
use market_core::{Bar, HistoricalDataProvider, MarketError, TimeRange};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::models::*;

/// Minimum bars a run needs before any simulation starts.
pub const MIN_BARS: usize = 50;

/// Bars consumed as indicator warm-up for signal-driven strategies.
const WARMUP_BARS: usize = 50;

/// Backtesting engine over a fused historical bar series.
///
/// The engine owns no data; it pulls through the `HistoricalDataProvider`
/// seam so the composition root decides where bars come from.
#[derive(Clone)]
pub struct BacktestEngine {
    data: Arc<dyn HistoricalDataProvider>,
    /// Bound on concurrent evaluations in batch/optimization drivers.
    concurrency: usize,
}

struct OpenPosition {
    quantity: f64,
    entry_price: f64,
    entry_commission: f64,
}

impl BacktestEngine {
    pub fn new(data: Arc<dyn HistoricalDataProvider>) -> Self {
        Self {
            data,
            concurrency: 4,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Run one backtest end-to-end: fetch, gate, simulate, summarise.
    pub async fn run(
        &self,
        config: &BacktestConfig,
        token: &CancellationToken,
    ) -> Result<BacktestResult, MarketError> {
        config.validate()?;

        let range = TimeRange::new(config.start, config.end);
        let bars = self
            .data
            .historical_bars(&config.symbol, config.timeframe, range, token)
            .await?;

        if bars.len() < MIN_BARS {
            return Err(MarketError::InsufficientData(format!(
                "{} bars fetched, {MIN_BARS} required",
                bars.len()
            )));
        }

        self.simulate(config, &bars)
    }

    /// Pure simulation over an already-fetched series.
    pub fn simulate(
        &self,
        config: &BacktestConfig,
        bars: &[Bar],
    ) -> Result<BacktestResult, MarketError> {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        if closes.iter().any(|c| !c.is_finite() || *c <= 0.0) {
            return Err(MarketError::StrategyFailure(
                "bar series contains non-finite or non-positive closes".into(),
            ));
        }

        let buy_and_hold = config.strategy == StrategyKind::BuyAndHold;
        let start_index = if buy_and_hold {
            0
        } else {
            WARMUP_BARS.min(bars.len() - 1)
        };

        let mut cash = config.initial_cash;
        let mut position: Option<OpenPosition> = None;
        let mut entered_once = false;

        let mut trades: Vec<Trade> = Vec::new();
        let mut equity_curve: Vec<EquityPoint> = Vec::new();
        let mut daily_returns: Vec<f64> = Vec::new();

        let mut total_trades = 0u32;
        let mut winning_trades = 0u32;
        let mut peak_equity = config.initial_cash;
        let mut max_drawdown = 0.0f64;

        for (i, bar) in bars.iter().enumerate().skip(start_index) {
            let price = bar.close;

            // Exits first.
            if let Some(pos) = &position {
                let excursion = (price - pos.entry_price) / pos.entry_price;
                let exit = if config.stop_loss > 0.0 && excursion <= -config.stop_loss {
                    Some(ExitReason::Loss)
                } else if config.take_profit > 0.0 && excursion >= config.take_profit {
                    Some(ExitReason::Profit)
                } else {
                    None
                };

                if let Some(reason) = exit {
                    if let Some(pos) = position.take() {
                        let (trade, won) = close_position(
                            &mut cash,
                            pos,
                            price,
                            bar.open_time,
                            config.commission,
                            reason,
                        );
                        total_trades += 1;
                        if won {
                            winning_trades += 1;
                        }
                        trades.push(trade);
                    }
                }
            }

            // Entries.
            if position.is_none() && !(buy_and_hold && entered_once) {
                let should_enter = if buy_and_hold {
                    true
                } else {
                    let score = decision_score(config.strategy, &closes[..=i]);
                    if !score.is_finite() {
                        return Err(MarketError::StrategyFailure(
                            "decision score is not finite".into(),
                        ));
                    }
                    score > config.stop_loss
                };

                if should_enter {
                    let invest = cash * config.max_position;
                    if invest > 0.0 && price > 0.0 {
                        let commission = invest * config.commission;
                        let quantity = (invest - commission) / price;
                        cash -= invest;
                        entered_once = true;

                        trades.push(Trade {
                            side: TradeSide::Buy,
                            quantity,
                            price,
                            timestamp: bar.open_time,
                            commission,
                            realized_pnl: 0.0,
                            exit_reason: None,
                        });
                        position = Some(OpenPosition {
                            quantity,
                            entry_price: price,
                            entry_commission: commission,
                        });
                    }
                }
            }

            // Mark to market.
            let equity = cash + position.as_ref().map_or(0.0, |p| p.quantity * price);
            if !equity.is_finite() {
                return Err(MarketError::StrategyFailure(
                    "equity became non-finite during simulation".into(),
                ));
            }

            if let Some(last) = equity_curve.last() {
                if last.equity > 0.0 {
                    daily_returns.push(equity / last.equity - 1.0);
                }
            }

            if equity > peak_equity {
                peak_equity = equity;
            }
            let drawdown = if peak_equity > 0.0 {
                (peak_equity - equity) / peak_equity
            } else {
                0.0
            };
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
            }

            equity_curve.push(EquityPoint {
                timestamp: bar.open_time,
                equity,
                drawdown,
            });
        }

        // Liquidate anything still open at the final close.
        if let Some(pos) = position.take() {
            let last = &bars[bars.len() - 1];
            let (trade, won) = close_position(
                &mut cash,
                pos,
                last.close,
                last.open_time,
                config.commission,
                ExitReason::Force,
            );
            total_trades += 1;
            if won {
                winning_trades += 1;
            }
            trades.push(trade);

            if let Some(point) = equity_curve.last_mut() {
                point.equity = cash;
            }
        }

        let final_equity = cash;
        let total_return = (final_equity - config.initial_cash) / config.initial_cash;
        let win_rate = if total_trades > 0 {
            winning_trades as f64 / total_trades as f64
        } else {
            0.0
        };

        let summary = BacktestSummary {
            total_trades,
            winning_trades,
            total_return,
            win_rate,
            sharpe: annualised_sharpe(&daily_returns, config.timeframe),
            max_drawdown,
            final_equity,
        };

        Ok(BacktestResult {
            config: config.clone(),
            summary,
            trades,
            daily_returns,
            equity_curve,
        })
    }

    /// Run several configs with bounded concurrency. Results keep the
    /// input order; individual failures do not abort the batch.
    pub async fn run_batch(
        &self,
        configs: Vec<BacktestConfig>,
        token: &CancellationToken,
    ) -> Vec<Result<BacktestResult, MarketError>> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(configs.len());

        for config in configs {
            let engine = self.clone();
            let semaphore = semaphore.clone();
            let child = token.child_token();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| MarketError::Cancelled)?;
                engine.run(&config, &child).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(e) => Err(MarketError::Internal(format!("backtest task panicked: {e}"))),
            });
        }
        results
    }

    /// Run the same window under every provided config and rank the
    /// strategies by realised return.
    pub async fn compare_strategies(
        &self,
        configs: Vec<BacktestConfig>,
        token: &CancellationToken,
    ) -> Result<StrategyComparison, MarketError> {
        if configs.is_empty() {
            return Err(MarketError::InvalidInput("no configs to compare".into()));
        }

        let strategies: Vec<StrategyKind> = configs.iter().map(|c| c.strategy).collect();
        let results = self.run_batch(configs, token).await;

        let mut ranked: Vec<(StrategyKind, BacktestSummary)> = strategies
            .into_iter()
            .zip(results)
            .filter_map(|(strategy, result)| result.ok().map(|r| (strategy, r.summary)))
            .collect();

        if ranked.is_empty() {
            return Err(MarketError::StrategyFailure(
                "every strategy run failed".into(),
            ));
        }

        ranked.sort_by(|a, b| {
            b.1.total_return
                .partial_cmp(&a.1.total_return)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let best = ranked[0].0;

        Ok(StrategyComparison { ranked, best })
    }

    pub(crate) fn provider(&self) -> Arc<dyn HistoricalDataProvider> {
        self.data.clone()
    }

    pub(crate) fn concurrency(&self) -> usize {
        self.concurrency
    }
}

fn close_position(
    cash: &mut f64,
    pos: OpenPosition,
    price: f64,
    timestamp: DateTime<Utc>,
    commission_rate: f64,
    reason: ExitReason,
) -> (Trade, bool) {
    let proceeds = pos.quantity * price;
    let commission = proceeds * commission_rate;
    *cash += proceeds - commission;

    let realized_pnl = (price - pos.entry_price) * pos.quantity;
    let won = realized_pnl - commission - pos.entry_commission > 0.0;

    let trade = Trade {
        side: TradeSide::Sell,
        quantity: pos.quantity,
        price,
        timestamp,
        commission,
        realized_pnl,
        exit_reason: Some(reason),
    };

    (trade, won)
}

/// Cheap point-in-time decision score from short-horizon trend, RSI and
/// volatility. Strategy families weigh the same inputs differently.
fn decision_score(strategy: StrategyKind, window: &[f64]) -> f64 {
    let (w_trend, w_rsi, w_vol) = match strategy {
        StrategyKind::BuyAndHold => (0.0, 0.0, 0.0),
        StrategyKind::MlPrediction => (8.0, 0.5, 4.0),
        StrategyKind::Ensemble => (10.0, 0.8, 5.0),
        StrategyKind::DeepLearning => (12.0, 1.0, 6.0),
    };

    let trend_5 = indicators::momentum(window, 5);
    let rsi = indicators::rsi(window, 14);
    let vol = indicators::volatility(window, 20);

    trend_5 * w_trend + (50.0 - rsi) / 100.0 * w_rsi - vol * w_vol
}

/// Simplified Sharpe: mean per-bar return over its deviation, annualised
/// by the bar frequency. Not risk-free-rate adjusted.
pub fn annualised_sharpe(returns: &[f64], timeframe: market_core::Interval) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();
    if std == 0.0 {
        return 0.0;
    }

    let minutes = timeframe.duration().num_minutes().max(1) as f64;
    let periods_per_year = 365.0 * 24.0 * 60.0 / minutes;

    (mean / std) * periods_per_year.sqrt()
}
