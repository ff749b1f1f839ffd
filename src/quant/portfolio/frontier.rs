//! # Efficient Frontier
//!
//! $$
//! \sigma^\*(r) = \min \{ \sqrt{\mathbf{w}^\top \Sigma \mathbf{w}} : \mu^\top \mathbf{w} \ge r \},
//! \qquad r \in [\max(\min_i \mu_i, 0),\ \max_i \mu_i]
//! $$
//!
//! Sweep of minimum-variance solves over evenly spaced return floors. Sweep
//! points whose solve fails are skipped, so the frontier may be shorter than the
//! requested resolution.

use ndarray::Array1;
use ndarray::Array2;
use rayon::prelude::*;

use super::optimizers::find_min_variance;
use super::optimizers::SolverOptions;

/// One retained point of the frontier.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrontierPoint {
  /// Requested return floor.
  pub target_return: f64,
  /// Realized portfolio return.
  pub expected_return: f64,
  pub volatility: f64,
  /// `expected_return / volatility`.
  pub sharpe: f64,
}

/// Frontier points in sweep order.
#[derive(Clone, Debug, Default)]
pub struct EfficientFrontier {
  points: Vec<FrontierPoint>,
}

impl EfficientFrontier {
  /// Wrap points already in sweep order.
  pub fn from_points(points: Vec<FrontierPoint>) -> Self {
    Self { points }
  }

  /// Borrow the points in sweep order.
  pub fn points(&self) -> &[FrontierPoint] {
    &self.points
  }

  /// Number of points.
  pub fn len(&self) -> usize {
    self.points.len()
  }

  /// Whether every sweep point failed.
  pub fn is_empty(&self) -> bool {
    self.points.is_empty()
  }

  /// Volatility of each point.
  pub fn volatilities(&self) -> Vec<f64> {
    self.points.iter().map(|p| p.volatility).collect()
  }

  /// Realized return of each point.
  pub fn returns(&self) -> Vec<f64> {
    self.points.iter().map(|p| p.expected_return).collect()
  }

  /// Sharpe ratio of each point.
  pub fn sharpe_ratios(&self) -> Vec<f64> {
    self.points.iter().map(|p| p.sharpe).collect()
  }
}

/// Evenly spaced return floors between the clamped lowest and the highest mean.
pub fn sweep_targets(mu: &Array1<f64>, steps: usize) -> Array1<f64> {
  if mu.is_empty() || steps == 0 {
    return Array1::zeros(0);
  }
  let lo = mu.iter().cloned().fold(f64::INFINITY, f64::min).max(0.0);
  let hi = mu.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
  Array1::linspace(lo, hi, steps)
}

/// Build the frontier; sweep points are solved in parallel and kept in order.
pub fn efficient_frontier(
  mu: &Array1<f64>,
  cov: &Array2<f64>,
  steps: usize,
  opts: &SolverOptions,
) -> EfficientFrontier {
  let targets = sweep_targets(mu, steps).to_vec();
  let tol = opts.tolerance;

  let points = targets
    .into_par_iter()
    .map(|r_min| match find_min_variance(mu, cov, r_min, opts) {
      Ok(res) if res.expected_return >= r_min - tol * (1.0 + r_min.abs()) => {
        tracing::info!(
          "r_min: {:.3}%, ret: {:.3}%, vol: {:.2}%",
          r_min,
          res.expected_return,
          res.volatility
        );
        let sharpe = if res.volatility > 1e-15 {
          res.expected_return / res.volatility
        } else {
          0.0
        };
        Some(FrontierPoint {
          target_return: r_min,
          expected_return: res.expected_return,
          volatility: res.volatility,
          sharpe,
        })
      }
      Ok(res) => {
        tracing::debug!(r_min, ret = res.expected_return, "sweep point below its return floor");
        None
      }
      Err(e) => {
        tracing::warn!(r_min, error = %e, "skipping frontier point");
        None
      }
    })
    .collect::<Vec<_>>()
    .into_iter()
    .flatten()
    .collect();

  EfficientFrontier { points }
}
