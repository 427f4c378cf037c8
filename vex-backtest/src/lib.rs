//! Backtest harness: virtual clock runner, orchestrator and reporting.
//!
//! A run owns an isolated `{runner, engine, wallet}` bundle; nothing is
//! shared across runs except the read-only data sources.

pub mod orchestrator;
pub mod report;
pub mod runner;
pub mod strategy;

use chrono::{DateTime, Utc};
use thiserror::Error;
use vex_data::DataError;
use vex_engine::EngineError;

pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use report::{CompletedTrade, PortfolioMetrics, Report, Reproducibility, RunStatus};
pub use runner::BacktestRunner;
pub use strategy::{
    CancelOrderArgs, HttpStrategyClient, PlaceOrderArgs, StrategyAction, StrategyReply,
    StrategyService, ToolCall, TpslArgs,
};

/// Result alias for backtest operations.
pub type BacktestResult<T> = Result<T, BacktestError>;

/// Errors surfaced while preparing or driving a run.
#[derive(Debug, Error)]
pub enum BacktestError {
    /// Includes `DataGap`, which is fatal before any order is accepted.
    #[error(transparent)]
    Data(#[from] DataError),
    /// The virtual clock only moves forward within a run.
    #[error("clock regression: requested {requested}, current {current}")]
    ClockRegression {
        current: DateTime<Utc>,
        requested: DateTime<Utc>,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Transport-level failure talking to the strategy service; soft per
    /// step, fatal only to that step's order intake.
    #[error("strategy service unavailable: {0}")]
    StrategyUnavailable(String),
    #[error("strategy call timed out after {0:?}")]
    StrategyTimeout(std::time::Duration),
    #[error("invalid run configuration: {0}")]
    InvalidConfig(String),
}
