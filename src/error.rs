//! # Errors
//!
//! One variant per failure kind a caller has to handle explicitly: data-source
//! faults, bad data, solver failures, cache contention and everything else.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
  /// Transient data-source failure, surfaced after the provider's own retries.
  #[error("DownloadError: {symbol}: {reason}")]
  Download { symbol: String, reason: String },

  /// Data present but outside sanity bounds. Never retried.
  #[error("DataQualityError: ticker {symbol} has returns > {threshold} (max |r| = {max_abs_return:.2})")]
  DataQuality {
    symbol: String,
    max_abs_return: f64,
    threshold: f64,
  },

  /// The quadratic program could not be solved.
  #[error("optimizer failed after {iterations} iterations: {reason}")]
  OptimizerFailure { iterations: usize, reason: String },

  /// The cache lease could not be taken within the bounded wait.
  #[error("timed out after {waited:?} waiting for cache lock {}", path.display())]
  CacheLockTimeout { path: PathBuf, waited: Duration },

  #[error("no eligible candidates in {currency}")]
  NoCandidates { currency: String },

  #[error("efficient frontier is empty: every sweep point failed")]
  EmptyFrontier,

  #[error("invalid request: {0}")]
  InvalidRequest(String),

  #[error("invalid portfolio: {0}")]
  InvalidPortfolio(String),

  #[error("task queue is full")]
  QueueFull,

  #[error("task {0} already has a terminal result")]
  TaskAlreadyCompleted(String),

  #[error("invalid configuration: {0}")]
  Config(String),

  #[error("universe provider failed: {0}")]
  Universe(String),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error(transparent)]
  Unexpected(#[from] anyhow::Error),
}

impl Error {
  /// Whether a caller-side retry may succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Error::Download { .. } | Error::CacheLockTimeout { .. })
  }

  /// Message safe to show outside the process.
  ///
  /// Data-source errors describe the market data and are passed through;
  /// anything else collapses to a generic message so internals never leak.
  pub fn public_message(&self, task_id: &str) -> String {
    match self {
      Error::Download { .. } | Error::DataQuality { .. } | Error::NoCandidates { .. } => {
        self.to_string()
      }
      Error::OptimizerFailure { .. } | Error::EmptyFrontier => {
        format!("Optimizer did not converge for task ID {task_id}")
      }
      _ => format!("Unexpected error in running task ID {task_id}"),
    }
  }
}

pub type Result<T> = std::result::Result<T, Error>;
