//! # Portfolio Types
//!
//! $$
//! R_p = D \cdot \mathbf{w}^\top \mu, \qquad
//! \sigma_p^2 = D \cdot \mathbf{w}^\top \Sigma \mathbf{w}, \qquad
//! S = \frac{R_p - r_f}{\sigma_p}
//! $$
//!
//! The chosen allocation, its compact `symbol:weight|...` form and the metrics
//! derived from it on demand (`D` is trading days per year).

use std::collections::HashSet;
use std::fmt;

use ndarray::Array1;
use ndarray::Array2;
use prettytable::row;
use prettytable::Cell;
use prettytable::Row;
use prettytable::Table;
use serde::Deserialize;
use serde::Serialize;

use super::data::corr_from_cov;
use crate::error::Error;
use crate::error::Result;

/// Tolerance on the sum of weights.
pub const WEIGHT_EPS: f64 = 1e-6;

/// Components at or below this weight are hidden from reports.
pub const MIN_DISPLAY_WEIGHT: f64 = 0.001;

pub const DEFAULT_DAYS_PER_YEAR: f64 = 250.0;

/// Asset whose own mean return stands in for the risk-free rate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskFreeAsset {
  pub symbol: String,
  /// Daily mean return (percent).
  pub expected_return: f64,
  /// Daily volatility (percent).
  pub volatility: f64,
}

/// Per-component annualized figures.
#[derive(Clone, Debug, PartialEq)]
pub struct ComponentMetrics {
  pub symbol: String,
  pub weight: f64,
  pub annualized_return: f64,
  pub annualized_volatility: f64,
  pub return_contribution: f64,
  pub variance_contribution: f64,
}

/// Pairwise correlations of the displayed components.
#[derive(Clone, Debug)]
pub struct CorrelationTable {
  pub symbols: Vec<String>,
  pub matrix: Array2<f64>,
}

/// Immutable allocation: weights in optimizer order plus optional statistics.
#[derive(Clone, Debug)]
pub struct Portfolio {
  weights: Vec<(String, f64)>,
  expected_returns: Option<Array1<f64>>,
  covariance: Option<Array2<f64>>,
  risk_free: Option<RiskFreeAsset>,
  days_per_year: f64,
}

/// Result of parsing the compact form.
#[derive(Clone, Debug)]
pub struct ParsedPortfolio {
  pub portfolio: Portfolio,
  /// Duplicate or renormalization notice, if any.
  pub warning: Option<String>,
}

impl Portfolio {
  /// Build from `(symbol, weight)` pairs that already sum to one.
  pub fn new(weights: Vec<(String, f64)>) -> Result<Self> {
    if weights.is_empty() {
      return Err(Error::InvalidPortfolio("no components".into()));
    }
    let mut seen = HashSet::new();
    for (symbol, w) in &weights {
      if !w.is_finite() {
        return Err(Error::InvalidPortfolio(format!("non-finite weight for {symbol}")));
      }
      if !seen.insert(symbol.as_str()) {
        return Err(Error::InvalidPortfolio(format!("duplicate component {symbol}")));
      }
    }
    let sum: f64 = weights.iter().map(|(_, w)| w).sum();
    if (sum - 1.0).abs() >= WEIGHT_EPS {
      return Err(Error::InvalidPortfolio(format!("weights sum to {sum}, expected 1")));
    }

    Ok(Self {
      weights,
      expected_returns: None,
      covariance: None,
      risk_free: None,
      days_per_year: DEFAULT_DAYS_PER_YEAR,
    })
  }

  /// Attach the daily mean vector and covariance the weights were fitted on.
  pub fn with_statistics(mut self, mu: Array1<f64>, cov: Array2<f64>) -> Result<Self> {
    let n = self.weights.len();
    if mu.len() != n || cov.dim() != (n, n) {
      return Err(Error::InvalidPortfolio(format!(
        "statistics of shape {} / {:?} do not match {n} components",
        mu.len(),
        cov.dim()
      )));
    }
    self.expected_returns = Some(mu);
    self.covariance = Some(cov);
    Ok(self)
  }

  /// Attach the risk-free proxy.
  pub fn with_risk_free(mut self, asset: RiskFreeAsset) -> Self {
    self.risk_free = Some(asset);
    self
  }

  /// Override the annualization factor.
  pub fn with_days_per_year(mut self, days: f64) -> Self {
    self.days_per_year = days;
    self
  }

  /// Borrow the weights in optimizer order.
  pub fn weights(&self) -> &[(String, f64)] {
    &self.weights
  }

  /// Weight of `symbol`, if held.
  pub fn weight(&self, symbol: &str) -> Option<f64> {
    self
      .weights
      .iter()
      .find(|(s, _)| s == symbol)
      .map(|(_, w)| *w)
  }

  /// Component symbols in order.
  pub fn symbols(&self) -> impl Iterator<Item = &str> {
    self.weights.iter().map(|(s, _)| s.as_str())
  }

  /// Borrow the daily mean returns.
  pub fn expected_returns(&self) -> Option<&Array1<f64>> {
    self.expected_returns.as_ref()
  }

  /// Borrow the daily covariance.
  pub fn covariance(&self) -> Option<&Array2<f64>> {
    self.covariance.as_ref()
  }

  /// Borrow the risk-free proxy.
  pub fn risk_free(&self) -> Option<&RiskFreeAsset> {
    self.risk_free.as_ref()
  }

  /// Annualization factor.
  pub fn days_per_year(&self) -> f64 {
    self.days_per_year
  }

  fn weight_vector(&self) -> Array1<f64> {
    self.weights.iter().map(|(_, w)| *w).collect()
  }

  /// `D * w . mu`.
  pub fn annualized_return(&self) -> Option<f64> {
    let mu = self.expected_returns.as_ref()?;
    Some(self.weight_vector().dot(mu) * self.days_per_year)
  }

  /// `D * w' Sigma w`.
  pub fn annualized_variance(&self) -> Option<f64> {
    let cov = self.covariance.as_ref()?;
    let w = self.weight_vector();
    Some(w.dot(&cov.dot(&w)) * self.days_per_year)
  }

  /// Square root of the annualized variance.
  pub fn annualized_volatility(&self) -> Option<f64> {
    self.annualized_variance().map(|v| v.max(0.0).sqrt())
  }

  /// Annualized mean return of the risk-free proxy.
  pub fn annualized_risk_free_rate(&self) -> Option<f64> {
    self
      .risk_free
      .as_ref()
      .map(|rf| rf.expected_return * self.days_per_year)
  }

  /// `(R_p - r_f) / sigma_p`, all annualized.
  pub fn sharpe_ratio(&self) -> Option<f64> {
    let ret = self.annualized_return()?;
    let vol = self.annualized_volatility()?;
    let rf = self.annualized_risk_free_rate()?;
    (vol > 1e-15).then(|| (ret - rf) / vol)
  }

  /// Per-component annualized return, volatility and contributions.
  pub fn components(&self) -> Option<Vec<ComponentMetrics>> {
    let mu = self.expected_returns.as_ref()?;
    let cov = self.covariance.as_ref()?;
    let d = self.days_per_year;
    let w = self.weight_vector();
    let marginal = cov.dot(&w);

    Some(
      self
        .weights
        .iter()
        .enumerate()
        .map(|(i, (symbol, weight))| ComponentMetrics {
          symbol: symbol.clone(),
          weight: *weight,
          annualized_return: mu[i] * d,
          annualized_volatility: (cov[[i, i]].max(0.0) * d).sqrt(),
          return_contribution: weight * mu[i] * d,
          variance_contribution: weight * marginal[i] * d,
        })
        .collect(),
    )
  }

  /// Correlations among components heavier than `min_weight`.
  pub fn correlation_table(&self, min_weight: f64) -> Option<CorrelationTable> {
    let cov = self.covariance.as_ref()?;
    let keep: Vec<usize> = (0..self.weights.len())
      .filter(|&i| self.weights[i].1 > min_weight)
      .collect();
    let corr = corr_from_cov(cov);

    Some(CorrelationTable {
      symbols: keep.iter().map(|&i| self.weights[i].0.clone()).collect(),
      matrix: Array2::from_shape_fn((keep.len(), keep.len()), |(a, b)| corr[[keep[a], keep[b]]]),
    })
  }

  /// `symbol:weight|symbol:weight|...`, every component in order.
  pub fn to_compact_string(&self) -> String {
    self
      .weights
      .iter()
      .map(|(s, w)| format!("{s}:{w}"))
      .collect::<Vec<_>>()
      .join("|")
  }

  /// Parse the compact form, summing duplicates and renormalizing a sum off by
  /// more than [`WEIGHT_EPS`].
  pub fn from_compact_string(s: &str) -> Result<ParsedPortfolio> {
    let mut weights: Vec<(String, f64)> = Vec::new();
    let mut warnings = Vec::new();

    for entry in s.trim().split('|').filter(|e| !e.trim().is_empty()) {
      let (symbol, weight) = entry
        .split_once(':')
        .ok_or_else(|| Error::InvalidPortfolio(format!("malformed entry '{entry}'")))?;
      let symbol = symbol.trim();
      if symbol.is_empty() {
        return Err(Error::InvalidPortfolio(format!("missing symbol in '{entry}'")));
      }
      let weight: f64 = weight
        .trim()
        .parse()
        .map_err(|_| Error::InvalidPortfolio(format!("bad weight in '{entry}'")))?;
      if !weight.is_finite() {
        return Err(Error::InvalidPortfolio(format!("bad weight in '{entry}'")));
      }

      match weights.iter_mut().find(|(s, _)| s == symbol) {
        Some((_, w)) => {
          warnings.push(format!("Duplicate weights for: {symbol}. Using the sum."));
          *w += weight;
        }
        None => weights.push((symbol.to_string(), weight)),
      }
    }

    if weights.is_empty() {
      return Err(Error::InvalidPortfolio("no components".into()));
    }
    let sum: f64 = weights.iter().map(|(_, w)| w).sum();
    if sum <= 0.0 {
      return Err(Error::InvalidPortfolio(format!("weights sum to {sum}")));
    }
    if (sum - 1.0).abs() > WEIGHT_EPS {
      let factor = 1.0 / sum;
      warnings.push(format!(
        "The sum of weights provided is not 1.0: {sum:.2}.\nNormalizing the weights by a factor of {factor:.2}."
      ));
      for (_, w) in &mut weights {
        *w *= factor;
      }
    }

    Ok(ParsedPortfolio {
      portfolio: Portfolio::new(weights)?,
      warning: (!warnings.is_empty()).then(|| warnings.join("\n")),
    })
  }

  /// Plain-text summary of components, metrics and correlations.
  pub fn report(&self) -> String {
    let mut out = String::new();
    let mut shown_weight = 0.0;

    let mut table = Table::new();
    match self.components() {
      Some(components) => {
        table.set_titles(row![
          "Component",
          "Weight",
          "Return",
          "Volatility",
          "Contribution to Return",
          "Contribution to Variance"
        ]);
        let (mut sum_ret, mut sum_var) = (0.0, 0.0);
        for c in components.iter().filter(|c| c.weight > MIN_DISPLAY_WEIGHT) {
          table.add_row(row![
            c.symbol,
            format!("{:.2}%", c.weight * 100.0),
            format!("{:.2}%", c.annualized_return),
            format!("{:.2}%", c.annualized_volatility),
            format!("{:.2}%", c.return_contribution),
            format!("{:.2}%", c.variance_contribution)
          ]);
          shown_weight += c.weight;
          sum_ret += c.return_contribution;
          sum_var += c.variance_contribution;
        }
        table.add_row(row![
          "Portfolio",
          format!("{:.2}%", shown_weight * 100.0),
          "",
          "",
          format!("{sum_ret:.2}%"),
          format!("{sum_var:.2}%")
        ]);
      }
      None => {
        table.set_titles(row!["Component", "Weight"]);
        for (symbol, weight) in self.weights.iter().filter(|(_, w)| *w > MIN_DISPLAY_WEIGHT) {
          table.add_row(row![symbol, format!("{:.2}%", weight * 100.0)]);
          shown_weight += weight;
        }
      }
    }
    out.push_str(&table.to_string());

    if (shown_weight - 1.0).abs() > 0.01 {
      out.push_str(&format!(
        "Sum of weights is not 1.0: {:.2}% (components below {:.2}% are hidden)\n",
        shown_weight * 100.0,
        MIN_DISPLAY_WEIGHT * 100.0
      ));
    }

    if let Some(corr) = self.correlation_table(MIN_DISPLAY_WEIGHT) {
      let mut table = Table::new();
      let mut titles = vec![String::new()];
      titles.extend(corr.symbols.iter().cloned());
      table.set_titles(text_row(&titles));
      for (i, symbol) in corr.symbols.iter().enumerate() {
        let mut cells = vec![symbol.clone()];
        cells.extend(corr.matrix.row(i).iter().map(|c| format!("{c:.2}")));
        table.add_row(text_row(&cells));
      }
      out.push_str(&table.to_string());
    }

    if let (Some(ret), Some(var)) = (self.annualized_return(), self.annualized_variance()) {
      let mut table = Table::new();
      table.add_row(row!["Return", format!("{ret:.2}%")]);
      table.add_row(row!["Variance", format!("{var:.2}%")]);
      table.add_row(row!["Volatility", format!("{:.2}%", var.max(0.0).sqrt())]);
      if let (Some(rf), Some(rate)) = (self.risk_free.as_ref(), self.annualized_risk_free_rate()) {
        table.add_row(row!["Risk-free Asset", rf.symbol]);
        table.add_row(row!["Risk-free Rate", format!("{rate:.2}%")]);
        if let Some(sharpe) = self.sharpe_ratio() {
          table.add_row(row!["Sharpe Ratio", format!("{sharpe:.2}")]);
        }
      }
      out.push_str(&table.to_string());
    }

    out
  }
}

fn text_row(cells: &[String]) -> Row {
  Row::new(cells.iter().map(|c| Cell::new(c)).collect())
}

impl fmt::Display for Portfolio {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.to_compact_string())
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use ndarray::array;

  use super::*;

  fn sample() -> Portfolio {
    Portfolio::new(vec![("AAA".into(), 0.25), ("BBB".into(), 0.75)])
      .unwrap()
      .with_statistics(array![0.04, 0.08], array![[1.0, 0.3], [0.3, 4.0]])
      .unwrap()
      .with_risk_free(RiskFreeAsset {
        symbol: "AAA".into(),
        expected_return: 0.04,
        volatility: 1.0,
      })
      .with_days_per_year(252.0)
  }

  #[test]
  fn rejects_weights_not_summing_to_one() {
    assert!(Portfolio::new(vec![("A".into(), 0.5), ("B".into(), 0.4)]).is_err());
    assert!(Portfolio::new(vec![]).is_err());
    assert!(Portfolio::new(vec![("A".into(), 0.5), ("A".into(), 0.5)]).is_err());
  }

  #[test]
  fn compact_round_trip_preserves_weights() {
    let weights = vec![
      ("SPY".to_string(), 0.1),
      ("TLT".to_string(), 0.2),
      ("GLD".to_string(), 0.7),
    ];
    let original = Portfolio::new(weights).unwrap();
    let parsed = Portfolio::from_compact_string(&original.to_compact_string()).unwrap();

    assert!(parsed.warning.is_none());
    for ((s1, w1), (s2, w2)) in original.weights().iter().zip(parsed.portfolio.weights()) {
      assert_eq!(s1, s2);
      assert_abs_diff_eq!(w1, w2, epsilon = 1e-12);
    }
  }

  #[test]
  fn parsing_renormalizes_and_reports() {
    let parsed = Portfolio::from_compact_string("A:1|B:1|").unwrap();
    let warning = parsed.warning.unwrap();

    assert!(warning.contains("2.00"));
    assert_abs_diff_eq!(parsed.portfolio.weight("A").unwrap(), 0.5);
    assert_abs_diff_eq!(parsed.portfolio.weight("B").unwrap(), 0.5);
  }

  #[test]
  fn parsing_sums_duplicates() {
    let parsed = Portfolio::from_compact_string("A:0.25|B:0.5|A:0.25").unwrap();

    assert!(parsed.warning.unwrap().contains("Duplicate"));
    assert_abs_diff_eq!(parsed.portfolio.weight("A").unwrap(), 0.5);
  }

  #[test]
  fn parsing_rejects_garbage() {
    assert!(Portfolio::from_compact_string("").is_err());
    assert!(Portfolio::from_compact_string("A0.5").is_err());
    assert!(Portfolio::from_compact_string("A:x").is_err());
    assert!(Portfolio::from_compact_string("A:0|B:0").is_err());
  }

  #[test]
  fn annualized_metrics() {
    let p = sample();
    let ret = p.annualized_return().unwrap();
    let var = p.annualized_variance().unwrap();

    assert_abs_diff_eq!(ret, (0.25 * 0.04 + 0.75 * 0.08) * 252.0, epsilon = 1e-12);
    let expected_var = 0.0625 * 1.0 + 2.0 * 0.25 * 0.75 * 0.3 + 0.5625 * 4.0;
    assert_abs_diff_eq!(var, expected_var * 252.0, epsilon = 1e-9);

    let components = p.components().unwrap();
    let total_var: f64 = components.iter().map(|c| c.variance_contribution).sum();
    assert_abs_diff_eq!(total_var, var, epsilon = 1e-9);

    let sharpe = p.sharpe_ratio().unwrap();
    assert_abs_diff_eq!(sharpe, (ret - 0.04 * 252.0) / var.sqrt(), epsilon = 1e-9);
  }

  #[test]
  fn correlation_table_comes_from_covariance() {
    let table = sample().correlation_table(MIN_DISPLAY_WEIGHT).unwrap();

    assert_eq!(table.symbols, vec!["AAA", "BBB"]);
    assert_abs_diff_eq!(table.matrix[[0, 1]], 0.15, epsilon = 1e-12);
  }

  #[test]
  fn report_hides_dust_and_lists_metrics() {
    let p = Portfolio::new(vec![("BIG".into(), 0.9995), ("DUST".into(), 0.0005)]).unwrap();
    let report = p.report();

    assert!(report.contains("BIG"));
    assert!(!report.contains("DUST"));

    let full = sample().report();
    assert!(full.contains("Sharpe Ratio"));
    assert!(full.contains("Risk-free Asset"));
  }
}
