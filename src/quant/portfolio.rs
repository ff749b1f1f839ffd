//! # Portfolio
//!
//! $$
//! \min_{\mathbf{w}} \mathbf{w}^\top \Sigma \mathbf{w}
//! \quad \text{s.t.} \quad \mathbf{1}^\top \mathbf{w} = 1,\ \mu^\top \mathbf{w} \ge r_{min},\ 0 \le w_i \le w_{max}
//! $$
//!
//! Candidate selection, mean-variance optimization, efficient frontier and
//! tangency portfolio selection, and historical backtests of a chosen mix.

pub mod backtest;
pub mod data;
pub mod engine;
pub mod frontier;
pub mod optimizers;
pub mod selection;
pub mod types;

pub use backtest::BacktestReport;
pub use backtest::BacktestRequest;
pub use backtest::OneTimeMetrics;
pub use backtest::SipMetrics;
pub use backtest::ValueSeries;
pub use backtest::run_backtest;
pub use data::CandidateSet;
pub use data::ReturnSeries;
pub use engine::Allocation;
pub use engine::PortfolioEngine;
pub use engine::PortfolioEngineConfig;
pub use frontier::EfficientFrontier;
pub use frontier::FrontierPoint;
pub use optimizers::MinVariance;
pub use optimizers::SolverOptions;
pub use optimizers::find_min_variance;
pub use selection::CandidateSelector;
pub use selection::SelectionConfig;
pub use selection::rank_candidates;
pub use types::ParsedPortfolio;
pub use types::Portfolio;
pub use types::RiskFreeAsset;
