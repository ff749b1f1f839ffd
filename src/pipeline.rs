//! # Optimizer Pipeline
//!
//! $$
//! \text{cache} \to \text{rank} \to \text{select} \to (\mu, \Sigma) \to \text{frontier} \to \text{tangency} \to \mathbf{w}^\*
//! $$
//!
//! One end-to-end optimisation run, writing progress lines to the task log.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::cache::MetadataCache;
use crate::config::Settings;
use crate::error::Error;
use crate::error::Result;
use crate::provider::MetadataSource;
use crate::provider::RetryingProvider;
use crate::provider::ReturnSeriesProvider;
use crate::provider::UniverseProvider;
use crate::quant::portfolio::rank_candidates;
use crate::quant::portfolio::CandidateSelector;
use crate::quant::portfolio::Portfolio;
use crate::quant::portfolio::PortfolioEngine;
use crate::task::TaskLog;
use crate::task::TaskRunner;

/// Parameters of one optimisation run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRequest {
  pub currency: String,
  /// Maximum number of instruments in the candidate set.
  pub target_contract_count: usize,
  /// Largest tolerated pairwise correlation.
  pub correlation_cutoff: f64,
  pub lookback_years: f64,
}

impl Default for OptimizationRequest {
  fn default() -> Self {
    Self {
      currency: "USD".to_string(),
      target_contract_count: 100,
      correlation_cutoff: 0.99,
      lookback_years: 5.0,
    }
  }
}

impl OptimizationRequest {
  /// Construct a request with explicit parameters.
  pub fn new(currency: &str, target_contract_count: usize, correlation_cutoff: f64, lookback_years: f64) -> Self {
    Self {
      currency: currency.to_string(),
      target_contract_count,
      correlation_cutoff,
      lookback_years,
    }
  }

  /// Reject requests no run could satisfy.
  pub fn validate(&self) -> Result<()> {
    if self.currency.trim().is_empty() {
      return Err(Error::InvalidRequest("currency is empty".into()));
    }
    if self.target_contract_count == 0 {
      return Err(Error::InvalidRequest("target_contract_count must be at least 1".into()));
    }
    if !self.correlation_cutoff.is_finite() || !(-1.0..=1.0).contains(&self.correlation_cutoff) {
      return Err(Error::InvalidRequest(format!(
        "correlation_cutoff {} outside [-1, 1]",
        self.correlation_cutoff
      )));
    }
    if !(self.lookback_years.is_finite() && self.lookback_years > 0.0) {
      return Err(Error::InvalidRequest(format!(
        "lookback_years {} must be positive",
        self.lookback_years
      )));
    }
    Ok(())
  }
}

/// Collaborators and components of a run.
pub struct OptimizerPipeline {
  cache: MetadataCache,
  universe: Arc<dyn UniverseProvider>,
  metadata: Arc<dyn MetadataSource>,
  returns: Arc<dyn ReturnSeriesProvider>,
  selector: CandidateSelector,
  engine: PortfolioEngine,
}

impl OptimizerPipeline {
  /// Construct a pipeline over explicit collaborators.
  pub fn new(
    cache: MetadataCache,
    universe: Arc<dyn UniverseProvider>,
    metadata: Arc<dyn MetadataSource>,
    returns: Arc<dyn ReturnSeriesProvider>,
    selector: CandidateSelector,
    engine: PortfolioEngine,
  ) -> Self {
    Self {
      cache,
      universe,
      metadata,
      returns,
      selector,
      engine,
    }
  }

  /// Wire a pipeline from settings; `returns` is wrapped with retries.
  pub fn from_settings<P>(
    settings: &Settings,
    universe: Arc<dyn UniverseProvider>,
    metadata: Arc<dyn MetadataSource>,
    returns: P,
  ) -> Self
  where
    P: ReturnSeriesProvider + 'static,
  {
    Self::new(
      MetadataCache::new(settings.cache.clone()),
      universe,
      metadata,
      Arc::new(RetryingProvider::new(returns, settings.provider.clone())),
      CandidateSelector::new(settings.selection.clone()),
      PortfolioEngine::new(settings.engine.clone()),
    )
  }

  /// Borrow the metadata cache.
  pub fn cache(&self) -> &MetadataCache {
    &self.cache
  }

  /// Run the whole optimisation for `request`.
  pub async fn execute(&self, request: &OptimizationRequest, log: &TaskLog) -> Result<Portfolio> {
    request.validate()?;
    log.write("Starting optimizer");

    match self.cache.process(&*self.universe, &*self.metadata).await {
      Ok(cycle) => tracing::info!(?cycle, "metadata cache processed"),
      Err(e @ Error::Universe(_)) => tracing::warn!(error = %e, "skipping cache population"),
      Err(e) => return Err(e),
    }
    log.write("Updated ETF metadata cache");

    let rows = self.cache.as_of().await?;
    let candidates = rank_candidates(&rows, &request.currency);
    tracing::info!("Using {} ETFs in {}", candidates.len(), request.currency);

    let end = Utc::now().date_naive();
    let start = end - Duration::days((365.0 * request.lookback_years) as i64);
    let set = self
      .selector
      .select(
        &candidates,
        &*self.returns,
        start,
        end,
        request.target_contract_count,
        request.correlation_cutoff,
      )
      .await?;
    if set.is_empty() {
      return Err(Error::NoCandidates {
        currency: request.currency.clone(),
      });
    }
    log.write("ETF data loaded");
    tracing::info!(symbols = ?set.symbols(), "Using the following ETFs for optimization");

    let engine = self.engine.clone();
    let years = request.lookback_years;
    let task_log = log.clone();
    let allocation = tokio::task::spawn_blocking(move || {
      let mu = set.mean_returns();
      let cov = set.covariance();
      if !mu.iter().chain(cov.iter()).all(|v| v.is_finite()) {
        return Err(Error::Unexpected(anyhow::anyhow!(
          "non-finite return statistics for {:?}",
          set.symbols()
        )));
      }
      let days_per_year = set.n_rows() as f64 / years;

      let frontier = engine.efficient_frontier(&mu, &cov);
      task_log.write("Calculated efficient frontier");
      engine.select(set.symbols(), &mu, &cov, frontier, days_per_year)
    })
    .await
    .map_err(|e| Error::Unexpected(anyhow::anyhow!("optimizer worker failed: {e}")))??;

    tracing::info!(
      "Best Portfolio: mu: {:.2}%, sigma: {:.2}%",
      allocation.tangency.expected_return,
      allocation.tangency.volatility
    );
    log.write("Finished optimization");
    Ok(allocation.portfolio)
  }
}

#[async_trait]
impl TaskRunner for OptimizerPipeline {
  async fn run(&self, request: OptimizationRequest, log: TaskLog) -> Result<Portfolio> {
    self.execute(&request, &log).await
  }
}
