use market_core::{MarketError, TimeRange};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::engine::{BacktestEngine, MIN_BARS};
use crate::models::*;

const GENETIC_POPULATION: usize = 16;
const GENETIC_MUTATION: f64 = 0.2;

impl ParamRanges {
    /// A small search neighbourhood around a base config, used when the
    /// caller does not supply explicit axes (walk-forward does this).
    pub fn around(base: &BacktestConfig) -> Self {
        let spread = |v: f64| -> Vec<f64> {
            if v > 0.0 {
                vec![v * 0.5, v, v * 1.5]
            } else {
                vec![v]
            }
        };
        Self {
            max_positions: vec![base.max_position],
            stop_losses: spread(base.stop_loss),
            take_profits: spread(base.take_profit),
        }
    }

    fn axis_or<'a>(axis: &'a [f64], fallback: f64, buf: &'a mut Vec<f64>) -> &'a [f64] {
        if axis.is_empty() {
            buf.push(fallback);
            buf
        } else {
            axis
        }
    }

    /// Cartesian product of the three axes, empty axes pinned to the base.
    pub fn expand(&self, base: &BacktestConfig) -> Vec<ParamPoint> {
        let mut mp_buf = Vec::new();
        let mut sl_buf = Vec::new();
        let mut tp_buf = Vec::new();
        let max_positions = Self::axis_or(&self.max_positions, base.max_position, &mut mp_buf);
        let stop_losses = Self::axis_or(&self.stop_losses, base.stop_loss, &mut sl_buf);
        let take_profits = Self::axis_or(&self.take_profits, base.take_profit, &mut tp_buf);

        let mut points =
            Vec::with_capacity(max_positions.len() * stop_losses.len() * take_profits.len());
        for &mp in max_positions {
            for &sl in stop_losses {
                for &tp in take_profits {
                    points.push(ParamPoint {
                        max_position: mp,
                        stop_loss: sl,
                        take_profit: tp,
                    });
                }
            }
        }
        points
    }

    fn sample(&self, base: &BacktestConfig, rng: &mut StdRng) -> ParamPoint {
        let pick = |axis: &[f64], fallback: f64, rng: &mut StdRng| -> f64 {
            axis.choose(rng).copied().unwrap_or(fallback)
        };
        ParamPoint {
            max_position: pick(&self.max_positions, base.max_position, rng),
            stop_loss: pick(&self.stop_losses, base.stop_loss, rng),
            take_profit: pick(&self.take_profits, base.take_profit, rng),
        }
    }
}

fn objective_score(objective: Objective, summary: &BacktestSummary) -> f64 {
    match objective {
        Objective::Sharpe => summary.sharpe,
        Objective::Return => summary.total_return,
        Objective::Winrate => summary.win_rate,
        // Less drawdown is better.
        Objective::Drawdown => -summary.max_drawdown,
    }
}

impl BacktestEngine {
    /// Parameter optimisation over one fetched bar window.
    ///
    /// Candidates are evaluated in rounds of `concurrency`; an
    /// `early_stop_rounds` budget without improvement stops the search.
    pub async fn optimize(
        &self,
        base: &BacktestConfig,
        ranges: &ParamRanges,
        objective: Objective,
        method: OptimizeMethod,
        max_iterations: usize,
        early_stop_rounds: Option<usize>,
        token: &CancellationToken,
    ) -> Result<OptimizationResult, MarketError> {
        base.validate()?;
        if max_iterations == 0 {
            return Err(MarketError::InvalidInput(
                "max_iterations must be positive".into(),
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

        let evaluate = |points: &[ParamPoint]| -> Vec<Evaluation> {
            points
                .par_iter()
                .filter_map(|point| {
                    let config = point.apply(base);
                    match self.simulate(&config, &bars) {
                        Ok(result) => Some(Evaluation {
                            params: *point,
                            score: objective_score(objective, &result.summary),
                            summary: result.summary,
                        }),
                        Err(e) => {
                            tracing::debug!("Candidate {point:?} failed: {e}");
                            None
                        }
                    }
                })
                .collect()
        };

        let history = match method {
            OptimizeMethod::Grid => {
                let mut candidates = ranges.expand(base);
                candidates.truncate(max_iterations);
                self.evaluate_rounds(candidates, early_stop_rounds, token, &evaluate)?
            }
            OptimizeMethod::Random => {
                let mut rng = StdRng::seed_from_u64(0xa11ce);
                let candidates: Vec<ParamPoint> = (0..max_iterations)
                    .map(|_| ranges.sample(base, &mut rng))
                    .collect();
                self.evaluate_rounds(candidates, early_stop_rounds, token, &evaluate)?
            }
            OptimizeMethod::Genetic => {
                self.evolve(base, ranges, max_iterations, token, &evaluate)?
            }
        };

        let best = history
            .iter()
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
            .cloned()
            .ok_or_else(|| {
                MarketError::StrategyFailure("every optimisation candidate failed".into())
            })?;

        Ok(OptimizationResult {
            objective,
            method,
            evaluations: history.len(),
            best,
            history,
        })
    }

    fn evaluate_rounds(
        &self,
        candidates: Vec<ParamPoint>,
        early_stop_rounds: Option<usize>,
        token: &CancellationToken,
        evaluate: &dyn Fn(&[ParamPoint]) -> Vec<Evaluation>,
    ) -> Result<Vec<Evaluation>, MarketError> {
        let mut history: Vec<Evaluation> = Vec::with_capacity(candidates.len());
        let mut best_score = f64::NEG_INFINITY;
        let mut stagnant_rounds = 0usize;

        for round in candidates.chunks(self.concurrency().max(1)) {
            if token.is_cancelled() {
                return Err(MarketError::Cancelled);
            }

            let evals = evaluate(round);
            let round_best = evals
                .iter()
                .map(|e| e.score)
                .fold(f64::NEG_INFINITY, f64::max);
            history.extend(evals);

            if round_best > best_score {
                best_score = round_best;
                stagnant_rounds = 0;
            } else {
                stagnant_rounds += 1;
                if let Some(limit) = early_stop_rounds {
                    if stagnant_rounds >= limit {
                        tracing::debug!(
                            "Optimisation stopped early after {stagnant_rounds} stagnant rounds"
                        );
                        break;
                    }
                }
            }
        }

        Ok(history)
    }

    /// Simple evolutionary search: tournament selection over the scored
    /// population, blend-and-jitter offspring, until the evaluation
    /// budget is spent.
    fn evolve(
        &self,
        base: &BacktestConfig,
        ranges: &ParamRanges,
        max_iterations: usize,
        token: &CancellationToken,
        evaluate: &dyn Fn(&[ParamPoint]) -> Vec<Evaluation>,
    ) -> Result<Vec<Evaluation>, MarketError> {
        let mut rng = StdRng::seed_from_u64(0x9e7e71c);
        let population_size = GENETIC_POPULATION.min(max_iterations);

        let mut population: Vec<ParamPoint> = (0..population_size)
            .map(|_| ranges.sample(base, &mut rng))
            .collect();
        let mut history: Vec<Evaluation> = Vec::with_capacity(max_iterations);

        while history.len() < max_iterations {
            if token.is_cancelled() {
                return Err(MarketError::Cancelled);
            }

            let budget = max_iterations - history.len();
            let round: Vec<ParamPoint> = population.iter().copied().take(budget).collect();
            let mut evals = evaluate(&round);
            evals.sort_by(|a, b| {
                b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
            });
            if evals.is_empty() {
                break;
            }

            let parents: Vec<ParamPoint> = evals
                .iter()
                .take((evals.len() / 2).max(1))
                .map(|e| e.params)
                .collect();
            history.extend(evals);

            population = (0..population_size)
                .map(|_| {
                    let a = parents[rng.gen_range(0..parents.len())];
                    let b = parents[rng.gen_range(0..parents.len())];
                    let blend = |x: f64, y: f64, rng: &mut StdRng| -> f64 {
                        let mid = (x + y) / 2.0;
                        let jitter = 1.0 + rng.gen_range(-GENETIC_MUTATION..GENETIC_MUTATION);
                        (mid * jitter).max(0.0)
                    };
                    ParamPoint {
                        max_position: blend(a.max_position, b.max_position, &mut rng)
                            .clamp(0.01, 1.0),
                        stop_loss: blend(a.stop_loss, b.stop_loss, &mut rng).min(1.0),
                        take_profit: blend(a.take_profit, b.take_profit, &mut rng).min(1.0),
                    }
                })
                .collect();
        }

        Ok(history)
    }
}
