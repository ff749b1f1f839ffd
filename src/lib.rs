//! # frontier-rs
//!
//! $$
//! \mathbf{w}^\* = \arg\min_{\mathbf{w}} \mathbf{w}^\top \Sigma \mathbf{w}
//! \quad \text{s.t.} \quad \mu^\top \mathbf{w} \ge m \cdot R_{tan}
//! $$
//!
//! Liquidity-ranked, de-correlated candidate selection over a shared metadata
//! cache, long-only mean-variance efficient frontiers and tangency portfolios,
//! run as asynchronous tasks on a bounded worker pool.

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod provider;
pub mod quant;
pub mod retry;
pub mod task;

pub use config::Settings;
pub use error::Error;
pub use error::Result;
pub use pipeline::OptimizationRequest;
pub use pipeline::OptimizerPipeline;
pub use quant::portfolio::Portfolio;
pub use task::TaskOrchestrator;
pub use task::TaskState;
