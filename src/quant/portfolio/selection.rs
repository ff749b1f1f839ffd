//! # Candidate Selection
//!
//! $$
//! \text{notional}_i = V_i \cdot P_i, \qquad
//! \rho(x_{new}, x_j) > \bar\rho \Rightarrow \text{drop } \arg\min\{\bar x_{new}, \bar x_j\}
//! $$
//!
//! Greedy, order-sensitive construction of a de-correlated candidate set from
//! the most liquid instruments. Columns dropped by a later insertion are not
//! re-checked against the rest of the set.

use chrono::NaiveDate;
use ordered_float::OrderedFloat;
use serde::Deserialize;

use super::data::CandidateSet;
use super::data::ReturnSeries;
use crate::cache::AssetMetadata;
use crate::error::Error;
use crate::error::Result;
use crate::provider::ReturnSeriesProvider;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
  /// Minimum share of non-null observations in a fetched series.
  pub min_coverage: f64,
}

impl Default for SelectionConfig {
  fn default() -> Self {
    Self { min_coverage: 0.8 }
  }
}

/// Symbols with complete, positive liquidity facts in `currency`, most liquid first.
pub fn rank_candidates(rows: &[AssetMetadata], currency: &str) -> Vec<String> {
  let mut ranked: Vec<(OrderedFloat<f64>, &str)> = rows
    .iter()
    .filter_map(|r| {
      let volume = r.volume?;
      let price = r.price?;
      let ccy = r.currency.as_deref()?;
      (volume > 0.0 && price > 0.0 && ccy == currency)
        .then(|| (OrderedFloat(volume * price), r.symbol.as_str()))
    })
    .collect();
  ranked.sort_by(|a, b| b.0.cmp(&a.0));
  ranked.into_iter().map(|(_, s)| s.to_string()).collect()
}

/// What happened to one candidate series.
#[derive(Clone, Debug, PartialEq)]
pub enum Admission {
  Accepted,
  LowCoverage { coverage: f64 },
  /// The new column stayed and displaced a correlated, lower-mean column.
  ReplacedExisting { dropped: String, correlation: f64 },
  /// The new column was dropped in favour of a correlated existing one.
  RejectedCorrelated { kept: String, correlation: f64 },
}

/// Add `series` to `set` under the coverage and correlation rules.
///
/// The index is unioned before the coverage check, so a rejected series can
/// still extend it. Only the first correlation violation is acted on.
pub fn admit(set: &mut CandidateSet, series: &ReturnSeries, cutoff: f64, min_coverage: f64) -> Admission {
  set.union_index(&series.dates);

  let coverage = series.coverage();
  if coverage < min_coverage {
    return Admission::LowCoverage { coverage };
  }

  set.insert(series);
  let new = set.len() - 1;
  let new_mean = set.column_mean(new);

  for existing in 0..new {
    let correlation = set.correlation(new, existing);
    if correlation > cutoff {
      let existing_symbol = set.symbols()[existing].clone();
      let existing_mean = set.column_mean(existing);
      return if existing_mean < new_mean {
        set.remove(&existing_symbol);
        Admission::ReplacedExisting {
          dropped: existing_symbol,
          correlation,
        }
      } else {
        set.remove(&series.symbol);
        Admission::RejectedCorrelated {
          kept: existing_symbol,
          correlation,
        }
      };
    }
  }
  Admission::Accepted
}

/// Builds candidate sets from ranked metadata and a return series source.
#[derive(Clone, Debug, Default)]
pub struct CandidateSelector {
  config: SelectionConfig,
}

impl CandidateSelector {
  /// Construct a selector with explicit configuration.
  pub fn new(config: SelectionConfig) -> Self {
    Self { config }
  }

  /// Borrow selector configuration.
  pub fn config(&self) -> &SelectionConfig {
    &self.config
  }

  /// Walk `candidates` in order until `target` columns are held.
  ///
  /// Symbols whose series cannot be downloaded or fail the quality check are
  /// skipped. Any other provider error aborts the selection.
  pub async fn select(
    &self,
    candidates: &[String],
    provider: &dyn ReturnSeriesProvider,
    start: NaiveDate,
    end: NaiveDate,
    target: usize,
    cutoff: f64,
  ) -> Result<CandidateSet> {
    let mut set = CandidateSet::new();

    for symbol in candidates {
      if set.len() >= target {
        break;
      }
      if set.position(symbol).is_some() {
        continue;
      }
      let series = match provider.fetch(symbol, start, end).await {
        Ok(series) => series,
        Err(e @ (Error::Download { .. } | Error::DataQuality { .. })) => {
          tracing::info!(symbol = %symbol, "Error getting return series for {symbol}: {e}");
          continue;
        }
        Err(e) => return Err(e),
      };

      match admit(&mut set, &series, cutoff, self.config.min_coverage) {
        Admission::Accepted => tracing::debug!(symbol = %symbol, "accepted"),
        Admission::LowCoverage { coverage } => {
          tracing::info!(symbol = %symbol, coverage, "{symbol} has too many missing values")
        }
        Admission::ReplacedExisting { dropped, correlation } => tracing::info!(
          symbol = %symbol,
          correlation,
          "Removing {dropped} in favour of {symbol} due to lower return"
        ),
        Admission::RejectedCorrelated { kept, correlation } => tracing::info!(
          symbol = %symbol,
          correlation,
          "Removing {symbol} in favour of {kept} due to lower return"
        ),
      }
    }

    let dropped = set.drop_empty_rows();
    tracing::info!(columns = set.len(), rows = set.n_rows(), dropped, "candidate set built");
    Ok(set)
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use chrono::Duration;
  use chrono::Utc;
  use rand::rngs::StdRng;
  use rand::SeedableRng;
  use rand_distr::Distribution;
  use rand_distr::Normal;
  use tracing_test::traced_test;

  use super::*;
  use crate::provider::InMemoryProvider;

  fn dates(n: usize) -> Vec<NaiveDate> {
    let start = NaiveDate::from_ymd_opt(2022, 1, 3).unwrap();
    (0..n).map(|i| start + Duration::days(i as i64)).collect()
  }

  fn noise(seed: u64, n: usize, drift: f64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(drift, 1.0).unwrap();
    (0..n).map(|_| normal.sample(&mut rng)).collect()
  }

  fn meta(symbol: &str, volume: Option<f64>, price: f64, ccy: &str) -> AssetMetadata {
    AssetMetadata::new(
      symbol.to_string(),
      Some("PCX".to_string()),
      volume,
      Some(price),
      Some(ccy.to_string()),
      Utc::now(),
    )
  }

  #[test]
  fn ranking_filters_and_sorts_by_notional() {
    let rows = vec![
      meta("SMALL", Some(10.0), 10.0, "USD"),
      meta("BIG", Some(1000.0), 50.0, "USD"),
      meta("EUR", Some(1.0e9), 10.0, "EUR"),
      meta("NULL", None, 10.0, "USD"),
      meta("ZERO", Some(0.0), 10.0, "USD"),
      meta("MID", Some(100.0), 20.0, "USD"),
    ];

    assert_eq!(rank_candidates(&rows, "USD"), vec!["BIG", "MID", "SMALL"]);
  }

  #[test]
  fn identical_series_with_zero_cutoff_drop_one() {
    let d = dates(60);
    let values = noise(1, 60, 0.05);
    let mut set = CandidateSet::new();

    let a = ReturnSeries::new("A", d.clone(), values.clone());
    let b = ReturnSeries::new("B", d.clone(), values);
    assert_eq!(admit(&mut set, &a, 0.0, 0.8), Admission::Accepted);
    let outcome = admit(&mut set, &b, 0.0, 0.8);

    assert!(matches!(outcome, Admission::RejectedCorrelated { ref kept, .. } if kept == "A"));
    assert_eq!(set.symbols(), &["A".to_string()]);
  }

  #[test]
  fn correlated_newcomer_with_higher_mean_replaces_existing() {
    let d = dates(60);
    let base = noise(2, 60, 0.0);
    let shifted: Vec<f64> = base.iter().map(|v| v + 0.5).collect();
    let mut set = CandidateSet::new();

    admit(&mut set, &ReturnSeries::new("LOW", d.clone(), base), 0.9, 0.8);
    let outcome = admit(&mut set, &ReturnSeries::new("HIGH", d.clone(), shifted), 0.9, 0.8);

    match outcome {
      Admission::ReplacedExisting { dropped, correlation } => {
        assert_eq!(dropped, "LOW");
        assert_abs_diff_eq!(correlation, 1.0, epsilon = 1e-9);
      }
      other => panic!("unexpected {other:?}"),
    }
    assert_eq!(set.symbols(), &["HIGH".to_string()]);
  }

  #[test]
  fn sparse_series_is_skipped_but_extends_index() {
    let mut set = CandidateSet::new();
    let d = dates(10);
    admit(&mut set, &ReturnSeries::new("A", d[..5].to_vec(), noise(3, 5, 0.0)), 0.99, 0.8);

    let mut sparse = vec![f64::NAN; 10];
    sparse[9] = 1.0;
    let outcome = admit(&mut set, &ReturnSeries::new("S", d.clone(), sparse), 0.99, 0.8);

    assert!(matches!(outcome, Admission::LowCoverage { .. }));
    assert_eq!(set.len(), 1);
    assert_eq!(set.n_rows(), 10);
    assert_eq!(set.drop_empty_rows(), 5);
  }

  #[tokio::test]
  #[traced_test]
  async fn download_error_on_only_candidate_yields_empty_set() {
    let d = dates(30);
    let provider = InMemoryProvider::default().with_download_error("ONLY", "timeout");
    let set = CandidateSelector::default()
      .select(&["ONLY".to_string()], &provider, d[0], d[29], 5, 0.99)
      .await
      .unwrap();

    assert!(set.is_empty());
    assert!(logs_contain("Error getting return series for ONLY"));
  }

  #[tokio::test]
  #[traced_test]
  async fn selection_stops_at_target_and_skips_bad_data() {
    let d = dates(80);
    let mut wild = noise(10, 80, 0.0);
    wild[40] = 75.0;
    let provider = InMemoryProvider::default()
      .with_series(ReturnSeries::new("WILD", d.clone(), wild))
      .with_series(ReturnSeries::new("A", d.clone(), noise(11, 80, 0.02)))
      .with_series(ReturnSeries::new("B", d.clone(), noise(12, 80, 0.03)))
      .with_series(ReturnSeries::new("C", d.clone(), noise(13, 80, 0.04)));
    let candidates: Vec<String> = ["WILD", "A", "B", "C"].iter().map(|s| s.to_string()).collect();

    let set = CandidateSelector::default()
      .select(&candidates, &provider, d[0], d[79], 2, 0.99)
      .await
      .unwrap();

    assert_eq!(set.symbols(), &["A".to_string(), "B".to_string()]);
    assert_eq!(provider.calls("C"), 0);
    assert!(logs_contain("WILD"));
  }

  #[tokio::test]
  async fn accepted_columns_respect_cutoff_at_admission() {
    let d = dates(120);
    let mut provider = InMemoryProvider::default();
    let mut candidates = Vec::new();
    for k in 0..5u64 {
      let base = noise(100 + k, 120, 0.01);
      let shift = if k % 2 == 0 { 0.3 } else { -0.3 };
      let twin: Vec<f64> = base
        .iter()
        .zip(noise(200 + k, 120, 0.0))
        .map(|(b, e)| b + 0.1 * e + shift)
        .collect();
      for (symbol, values) in [(format!("B{k}"), base), (format!("T{k}"), twin)] {
        provider = provider.with_series(ReturnSeries::new(&symbol, d.clone(), values));
        candidates.push(symbol);
      }
    }

    let cutoff = 0.5;
    let set = CandidateSelector::default()
      .select(&candidates, &provider, d[0], d[119], 10, cutoff)
      .await
      .unwrap();

    assert_eq!(set.len(), 5);
    assert!(set.position("T0").is_some());
    assert!(set.position("B1").is_some());
    for i in 0..set.len() {
      for j in 0..i {
        assert!(set.correlation(i, j) <= cutoff);
      }
    }
  }
}
