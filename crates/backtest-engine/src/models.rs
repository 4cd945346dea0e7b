use chrono::{DateTime, Utc};
use market_core::{Interval, MarketError};
use serde::{Deserialize, Serialize};

/// Strategy family driving entry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    BuyAndHold,
    MlPrediction,
    Ensemble,
    DeepLearning,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::BuyAndHold => "buy_and_hold",
            StrategyKind::MlPrediction => "ml_prediction",
            StrategyKind::Ensemble => "ensemble",
            StrategyKind::DeepLearning => "deep_learning",
        }
    }
}

/// Configuration for a backtest run. Immutable once a run begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub symbol: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub initial_cash: f64,
    pub strategy: StrategyKind,
    pub timeframe: Interval,
    /// Fraction of cash deployed on entry, in (0, 1].
    pub max_position: f64,
    /// Loss fraction that forces an exit, in [0, 1].
    pub stop_loss: f64,
    /// Gain fraction that takes profit, in [0, 1].
    pub take_profit: f64,
    /// Per-fill commission rate, in [0, 0.1].
    pub commission: f64,
    #[serde(default)]
    pub user_strategy_id: Option<i64>,
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<(), MarketError> {
        if self.symbol.is_empty() || !self.symbol.is_ascii() {
            return Err(MarketError::InvalidInput("symbol must be non-empty ASCII".into()));
        }
        if self.end <= self.start {
            return Err(MarketError::InvalidInput("end must be after start".into()));
        }
        if self.initial_cash <= 0.0 {
            return Err(MarketError::InvalidInput("initial_cash must be positive".into()));
        }
        if !(0.0 < self.max_position && self.max_position <= 1.0) {
            return Err(MarketError::InvalidInput("max_position must be in (0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.stop_loss) {
            return Err(MarketError::InvalidInput("stop_loss must be in [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.take_profit) {
            return Err(MarketError::InvalidInput("take_profit must be in [0, 1]".into()));
        }
        if !(0.0..=0.1).contains(&self.commission) {
            return Err(MarketError::InvalidInput("commission must be in [0, 0.1]".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Profit,
    Loss,
    Time,
    RangeTarget,
    Force,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Profit => "profit",
            ExitReason::Loss => "loss",
            ExitReason::Time => "time",
            ExitReason::RangeTarget => "range_target",
            ExitReason::Force => "force",
        }
    }
}

/// A single fill. Sells carry the realised P&L of the round trip they
/// close and the reason the position was exited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub side: TradeSide,
    pub quantity: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub commission: f64,
    pub realized_pnl: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<ExitReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub drawdown: f64,
}

/// Summary counters: `total_trades` counts completed round trips.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub total_return: f64,
    pub win_rate: f64,
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub final_equity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub config: BacktestConfig,
    pub summary: BacktestSummary,
    pub trades: Vec<Trade>,
    pub daily_returns: Vec<f64>,
    pub equity_curve: Vec<EquityPoint>,
}

// --- Optimization ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Objective {
    Sharpe,
    Return,
    Winrate,
    Drawdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizeMethod {
    Grid,
    Random,
    Genetic,
}

/// Enumerated parameter axes for the optimizer. Empty axes fall back to
/// the base config's value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamRanges {
    #[serde(default)]
    pub max_positions: Vec<f64>,
    #[serde(default)]
    pub stop_losses: Vec<f64>,
    #[serde(default)]
    pub take_profits: Vec<f64>,
}

/// One concrete point in the parameter space.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ParamPoint {
    pub max_position: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
}

impl ParamPoint {
    pub fn apply(&self, base: &BacktestConfig) -> BacktestConfig {
        let mut config = base.clone();
        config.max_position = self.max_position;
        config.stop_loss = self.stop_loss;
        config.take_profit = self.take_profit;
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub params: ParamPoint,
    pub score: f64,
    pub summary: BacktestSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub objective: Objective,
    pub method: OptimizeMethod,
    pub evaluations: usize,
    pub best: Evaluation,
    pub history: Vec<Evaluation>,
}

// --- Walk-forward ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardWindow {
    pub window_number: u32,
    pub in_sample_start: DateTime<Utc>,
    pub in_sample_end: DateTime<Utc>,
    pub out_of_sample_start: DateTime<Utc>,
    pub out_of_sample_end: DateTime<Utc>,
    pub best_params: ParamPoint,
    pub in_sample_return: f64,
    pub out_of_sample_return: f64,
    pub out_of_sample_sharpe: f64,
    pub out_of_sample_trades: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardResult {
    pub windows: Vec<WalkForwardWindow>,
    pub avg_in_sample_return: f64,
    pub avg_out_of_sample_return: f64,
    /// In-sample over out-of-sample; near 1.0 means little overfitting.
    pub overfitting_ratio: f64,
    pub total_out_of_sample_trades: u32,
}

// --- Monte Carlo ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonteCarloResult {
    pub simulations: u32,
    pub bootstrap_size: usize,
    pub confidence_level: f64,
    pub mean_return: f64,
    pub median_return: f64,
    pub std_dev_return: f64,
    /// Lower/upper bounds of the symmetric confidence interval.
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub probability_of_profit: f64,
    pub median_max_drawdown: f64,
    /// Sampled return values for histograms (up to 200 points).
    pub return_distribution: Vec<f64>,
}

// --- Attribution ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionResult {
    pub benchmark_symbol: String,
    pub strategy_return: f64,
    pub benchmark_return: f64,
    pub beta: f64,
    pub alpha: f64,
    pub r_squared: f64,
    pub tracking_error: f64,
}

// --- Strategy comparison ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyComparison {
    pub ranked: Vec<(StrategyKind, BacktestSummary)>,
    pub best: StrategyKind,
}
