//! # Portfolio Engine
//!
//! $$
//! t^\* = \arg\max_{k} \frac{R_k - r_f}{\sigma_k}, \qquad
//! \mathbf{w}^\* = \operatorname{MinVar}(\mu, \Sigma, m \cdot R_{t^\*})
//! $$
//!
//! Picks the risk-free proxy and the tangency point of the frontier, then
//! re-solves for the final weights with a small return margin `m`.

use ndarray::Array1;
use ndarray::Array2;
use ndarray_stats::QuantileExt;
use serde::Deserialize;

use super::data::CandidateSet;
use super::frontier::efficient_frontier;
use super::frontier::EfficientFrontier;
use super::frontier::FrontierPoint;
use super::optimizers::find_min_variance;
use super::optimizers::SolverOptions;
use super::types::Portfolio;
use super::types::RiskFreeAsset;
use crate::error::Error;
use crate::error::Result;

/// Runtime configuration for [`PortfolioEngine`].
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PortfolioEngineConfig {
  /// Upper bound on any single weight.
  pub w_max: f64,
  /// Number of return floors swept by the frontier.
  pub frontier_steps: usize,
  /// Fraction of the tangency return used as the final return floor.
  pub tangency_margin: f64,
  /// Iteration cap of every solve.
  pub max_iter: usize,
  pub tolerance: f64,
}

impl Default for PortfolioEngineConfig {
  fn default() -> Self {
    Self {
      w_max: 1.0,
      frontier_steps: 25,
      tangency_margin: 0.99,
      max_iter: 500,
      tolerance: 1e-9,
    }
  }
}

impl PortfolioEngineConfig {
  /// Solver settings derived from this configuration.
  pub fn solver_options(&self) -> SolverOptions {
    SolverOptions {
      w_max: self.w_max,
      max_iter: self.max_iter,
      tolerance: self.tolerance,
    }
  }
}

/// Final allocation together with the frontier it was picked from.
#[derive(Clone, Debug)]
pub struct Allocation {
  pub portfolio: Portfolio,
  pub frontier: EfficientFrontier,
  pub tangency: FrontierPoint,
  pub risk_free: RiskFreeAsset,
}

/// Asset with the lowest individual volatility, used as the risk-free proxy.
pub fn risk_free_proxy(
  symbols: &[String],
  mu: &Array1<f64>,
  cov: &Array2<f64>,
) -> Result<RiskFreeAsset> {
  let vols: Array1<f64> = cov.diag().mapv(|v| v.max(0.0).sqrt());
  let idx = vols
    .argmin()
    .map_err(|e| Error::InvalidRequest(format!("cannot rank asset volatilities: {e}")))?;
  let symbol = symbols
    .get(idx)
    .cloned()
    .ok_or_else(|| Error::InvalidRequest("symbol list shorter than covariance".into()))?;

  Ok(RiskFreeAsset {
    symbol,
    expected_return: mu[idx],
    volatility: vols[idx],
  })
}

/// Frontier point with the highest excess return per unit of volatility.
///
/// Ties keep the earliest point in sweep order.
pub fn tangency_point(frontier: &EfficientFrontier, risk_free_return: f64) -> Option<FrontierPoint> {
  let mut best: Option<(f64, FrontierPoint)> = None;
  for p in frontier.points() {
    let ratio = if p.volatility > 1e-15 {
      (p.expected_return - risk_free_return) / p.volatility
    } else {
      f64::NEG_INFINITY
    };
    match best {
      Some((b, _)) if ratio <= b => {}
      _ => best = Some((ratio, *p)),
    }
  }
  best.map(|(_, p)| p)
}

/// Selector over a fixed configuration.
#[derive(Clone, Debug, Default)]
pub struct PortfolioEngine {
  config: PortfolioEngineConfig,
}

impl PortfolioEngine {
  /// Construct a new engine with explicit configuration.
  pub fn new(config: PortfolioEngineConfig) -> Self {
    Self { config }
  }

  /// Borrow engine configuration.
  pub fn config(&self) -> &PortfolioEngineConfig {
    &self.config
  }

  /// Sweep the frontier with this engine's settings.
  pub fn efficient_frontier(&self, mu: &Array1<f64>, cov: &Array2<f64>) -> EfficientFrontier {
    efficient_frontier(
      mu,
      cov,
      self.config.frontier_steps,
      &self.config.solver_options(),
    )
  }

  /// Frontier, tangency point and the re-solved final portfolio.
  pub fn allocate(
    &self,
    symbols: &[String],
    mu: &Array1<f64>,
    cov: &Array2<f64>,
    days_per_year: f64,
  ) -> Result<Allocation> {
    let frontier = self.efficient_frontier(mu, cov);
    self.select(symbols, mu, cov, frontier, days_per_year)
  }

  /// Pick the tangency point of an already computed `frontier` and re-solve
  /// for the final weights.
  pub fn select(
    &self,
    symbols: &[String],
    mu: &Array1<f64>,
    cov: &Array2<f64>,
    frontier: EfficientFrontier,
    days_per_year: f64,
  ) -> Result<Allocation> {
    if symbols.len() != mu.len() {
      return Err(Error::InvalidRequest(format!(
        "{} symbols for {} expected returns",
        symbols.len(),
        mu.len()
      )));
    }

    let risk_free = risk_free_proxy(symbols, mu, cov)?;
    tracing::info!(
      symbol = %risk_free.symbol,
      "Using {:.2}% as the annualized risk-free rate",
      risk_free.expected_return * days_per_year
    );
    let tangency = tangency_point(&frontier, risk_free.expected_return).ok_or(Error::EmptyFrontier)?;

    let r_min = self.config.tangency_margin * tangency.expected_return;
    let solved = find_min_variance(mu, cov, r_min, &self.config.solver_options())?;
    tracing::info!(
      r_min,
      ret = solved.expected_return,
      vol = solved.volatility,
      iterations = solved.iterations,
      "final portfolio solved"
    );

    let weights = symbols
      .iter()
      .cloned()
      .zip(solved.weights.iter().copied())
      .collect();
    let portfolio = Portfolio::new(weights)?
      .with_statistics(mu.clone(), cov.clone())?
      .with_risk_free(risk_free.clone())
      .with_days_per_year(days_per_year);

    Ok(Allocation {
      portfolio,
      frontier,
      tangency,
      risk_free,
    })
  }

  /// Allocate over a finished candidate set spanning `years` of history.
  pub fn optimize(&self, set: &CandidateSet, years: f64) -> Result<Allocation> {
    if !(years > 0.0) {
      return Err(Error::InvalidRequest(format!("lookback of {years} years")));
    }
    let days_per_year = set.n_rows() as f64 / years;
    self.allocate(
      set.symbols(),
      &set.mean_returns(),
      &set.covariance(),
      days_per_year,
    )
  }
}
