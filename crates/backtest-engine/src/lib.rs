pub mod attribution;
pub mod db;
pub mod engine;
pub mod models;
pub mod monte_carlo;
pub mod optimize;
pub mod strategy_exec;
pub mod walk_forward;


pub use db::{BacktestDb, BacktestRecord, RecordFilter, RunStatus};
pub use engine::{BacktestEngine, MIN_BARS};
pub use models::*;
pub use strategy_exec::{
    RecommendationInput, RiskParams, SimulationOutcome, StrategyExecutor, StrategyVariant,
};
