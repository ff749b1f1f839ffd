//! # Portfolio Data Utilities
//!
//! $$
//! r_t = 100 \cdot \ln\frac{P_t}{P_{t-1}}, \qquad
//! \rho_{ij} = \frac{\sum_{t \in T_{ij}} (x_t-\bar x)(y_t-\bar y)}{\sqrt{\sum (x_t-\bar x)^2 \sum (y_t-\bar y)^2}}
//! $$
//!
//! Return preprocessing and the union-aligned return matrix used by candidate
//! selection. Missing observations are stored as `NaN` and every statistic is
//! computed over the rows where its inputs are present.

use std::collections::BTreeSet;
use std::collections::HashMap;

use chrono::NaiveDate;
use ndarray::Array1;
use ndarray::Array2;

/// Time-indexed daily log-returns (percent) for one symbol. `NaN` marks a gap.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnSeries {
  pub symbol: String,
  pub dates: Vec<NaiveDate>,
  pub values: Vec<f64>,
}

impl ReturnSeries {
  /// Construct a series from aligned dates and values.
  pub fn new(symbol: impl Into<String>, dates: Vec<NaiveDate>, values: Vec<f64>) -> Self {
    debug_assert_eq!(dates.len(), values.len());
    Self {
      symbol: symbol.into(),
      dates,
      values,
    }
  }

  /// Number of rows.
  pub fn len(&self) -> usize {
    self.values.len()
  }

  /// Whether the series has no rows.
  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  /// Rows holding a value.
  pub fn non_null_count(&self) -> usize {
    self.values.iter().filter(|v| !v.is_nan()).count()
  }

  /// Share of non-null observations over the series' own length.
  pub fn coverage(&self) -> f64 {
    if self.values.is_empty() {
      0.0
    } else {
      self.non_null_count() as f64 / self.values.len() as f64
    }
  }

  /// Largest absolute non-null return, `0.0` for an all-null series.
  pub fn max_abs_return(&self) -> f64 {
    self
      .values
      .iter()
      .filter(|v| !v.is_nan())
      .fold(0.0_f64, |acc, v| acc.max(v.abs()))
  }
}

/// Mean over non-null values.
pub fn nan_mean(xs: &[f64]) -> f64 {
  let (sum, n) = xs
    .iter()
    .filter(|x| !x.is_nan())
    .fold((0.0, 0usize), |(s, n), x| (s + x, n + 1));
  if n == 0 {
    f64::NAN
  } else {
    sum / n as f64
  }
}

fn complete_pairs(x: &[f64], y: &[f64]) -> (Vec<f64>, Vec<f64>) {
  x.iter()
    .zip(y.iter())
    .filter(|(a, b)| !a.is_nan() && !b.is_nan())
    .map(|(a, b)| (*a, *b))
    .unzip()
}

/// Pearson correlation over mutually non-null rows.
///
/// Fewer than two complete rows, or a constant input, yields `0.0`.
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
  let (x, y) = complete_pairs(x, y);
  let n = x.len();
  if n < 2 {
    return 0.0;
  }

  let mx = x.iter().sum::<f64>() / n as f64;
  let my = y.iter().sum::<f64>() / n as f64;

  let mut cov = 0.0;
  let mut sx = 0.0;
  let mut sy = 0.0;

  for i in 0..n {
    let dx = x[i] - mx;
    let dy = y[i] - my;
    cov += dx * dy;
    sx += dx * dx;
    sy += dy * dy;
  }

  let denom = (sx * sy).sqrt();
  if denom < 1e-15 {
    0.0
  } else {
    (cov / denom).clamp(-1.0, 1.0)
  }
}

/// Sample covariance (`ddof = 1`) over mutually non-null rows.
pub fn pairwise_covariance(x: &[f64], y: &[f64]) -> f64 {
  let (x, y) = complete_pairs(x, y);
  let n = x.len();
  if n < 2 {
    return f64::NAN;
  }

  let mx = x.iter().sum::<f64>() / n as f64;
  let my = y.iter().sum::<f64>() / n as f64;
  let acc: f64 = x.iter().zip(y.iter()).map(|(a, b)| (a - mx) * (b - my)).sum();
  acc / (n - 1) as f64
}

/// Convert prices to percent log-returns, forward-filling missing prices.
///
/// The output has the same length as the input; the first entry and any entry
/// before the first valid price is `NaN`.
pub fn log_returns_series(prices: &[Option<f64>]) -> Vec<f64> {
  let mut out = Vec::with_capacity(prices.len());
  let mut last: Option<f64> = None;
  for price in prices {
    let current = match price {
      Some(p) if p.is_finite() && *p > 0.0 => Some(*p),
      _ => last,
    };
    let r = match (last, current) {
      (Some(prev), Some(cur)) => (cur / prev).ln() * 100.0,
      _ => f64::NAN,
    };
    out.push(r);
    last = current;
  }
  out
}

/// Correlation matrix implied by a covariance matrix.
pub fn corr_from_cov(cov: &Array2<f64>) -> Array2<f64> {
  let n = cov.nrows();
  let sigmas: Vec<f64> = (0..n).map(|i| cov[[i, i]].max(0.0).sqrt()).collect();
  Array2::from_shape_fn((n, n), |(i, j)| {
    let denom = sigmas[i] * sigmas[j];
    if i == j {
      1.0
    } else if denom > 1e-15 {
      (cov[[i, j]] / denom).clamp(-1.0, 1.0)
    } else {
      0.0
    }
  })
}

/// Return matrix whose columns share one sorted, union-aligned date index.
///
/// Columns are kept in insertion order. Reindexing after a union fills the new
/// rows of existing columns with `NaN`.
#[derive(Clone, Debug, Default)]
pub struct CandidateSet {
  index: Vec<NaiveDate>,
  symbols: Vec<String>,
  columns: Vec<Vec<f64>>,
}

impl CandidateSet {
  /// Construct an empty set.
  pub fn new() -> Self {
    Self::default()
  }

  /// Borrow the aligned date index.
  pub fn index(&self) -> &[NaiveDate] {
    &self.index
  }

  /// Borrow the column symbols in insertion order.
  pub fn symbols(&self) -> &[String] {
    &self.symbols
  }

  /// Number of columns.
  pub fn len(&self) -> usize {
    self.symbols.len()
  }

  /// Whether the set has no columns.
  pub fn is_empty(&self) -> bool {
    self.symbols.is_empty()
  }

  /// Number of index rows.
  pub fn n_rows(&self) -> usize {
    self.index.len()
  }

  /// Column index of `symbol`.
  pub fn position(&self, symbol: &str) -> Option<usize> {
    self.symbols.iter().position(|s| s == symbol)
  }

  /// Borrow the column of `symbol`.
  pub fn column(&self, symbol: &str) -> Option<&[f64]> {
    self.position(symbol).map(|i| self.columns[i].as_slice())
  }

  /// Union `dates` into the index, reindexing existing columns.
  ///
  /// Returns `true` if the index grew.
  pub fn union_index(&mut self, dates: &[NaiveDate]) -> bool {
    let mut merged: BTreeSet<NaiveDate> = self.index.iter().copied().collect();
    merged.extend(dates.iter().copied());
    if merged.len() == self.index.len() {
      return false;
    }

    let combined: Vec<NaiveDate> = merged.into_iter().collect();
    let old_pos: HashMap<NaiveDate, usize> =
      self.index.iter().enumerate().map(|(i, d)| (*d, i)).collect();
    for column in &mut self.columns {
      *column = combined
        .iter()
        .map(|d| old_pos.get(d).map_or(f64::NAN, |&i| column[i]))
        .collect();
    }
    self.index = combined;
    true
  }

  /// Append `series` as a new column aligned to the current index.
  ///
  /// Dates not in the index are ignored, so call [`Self::union_index`] first.
  pub fn insert(&mut self, series: &ReturnSeries) {
    let by_date: HashMap<NaiveDate, f64> = series
      .dates
      .iter()
      .copied()
      .zip(series.values.iter().copied())
      .collect();
    let column = self
      .index
      .iter()
      .map(|d| by_date.get(d).copied().unwrap_or(f64::NAN))
      .collect();
    self.symbols.push(series.symbol.clone());
    self.columns.push(column);
  }

  /// Remove a column by symbol. Returns whether it was present.
  pub fn remove(&mut self, symbol: &str) -> bool {
    match self.position(symbol) {
      Some(i) => {
        self.symbols.remove(i);
        self.columns.remove(i);
        true
      }
      None => false,
    }
  }

  /// Pearson correlation of two columns over their mutually non-null rows.
  pub fn correlation(&self, a: usize, b: usize) -> f64 {
    pearson(&self.columns[a], &self.columns[b])
  }

  /// Mean of column `i`, skipping nulls.
  pub fn column_mean(&self, i: usize) -> f64 {
    nan_mean(&self.columns[i])
  }

  /// Drop rows that are null across every column.
  pub fn drop_empty_rows(&mut self) -> usize {
    let keep: Vec<bool> = (0..self.index.len())
      .map(|r| self.columns.iter().any(|c| !c[r].is_nan()))
      .collect();
    let dropped = keep.iter().filter(|k| !**k).count();
    if dropped == 0 {
      return 0;
    }

    self.index = self
      .index
      .iter()
      .zip(keep.iter())
      .filter(|(_, k)| **k)
      .map(|(d, _)| *d)
      .collect();
    for column in &mut self.columns {
      *column = column
        .iter()
        .zip(keep.iter())
        .filter(|(_, k)| **k)
        .map(|(v, _)| *v)
        .collect();
    }
    dropped
  }

  /// Per-column mean return, skipping nulls.
  pub fn mean_returns(&self) -> Array1<f64> {
    self.columns.iter().map(|c| nan_mean(c)).collect()
  }

  /// Pairwise-complete sample covariance matrix.
  pub fn covariance(&self) -> Array2<f64> {
    let n = self.columns.len();
    let mut cov = Array2::<f64>::zeros((n, n));
    for i in 0..n {
      for j in i..n {
        let c = pairwise_covariance(&self.columns[i], &self.columns[j]);
        cov[[i, j]] = c;
        cov[[j, i]] = c;
      }
    }
    cov
  }

  /// Dense `rows x columns` view with `NaN` gaps.
  pub fn to_array(&self) -> Array2<f64> {
    Array2::from_shape_fn((self.index.len(), self.columns.len()), |(r, c)| {
      self.columns[c][r]
    })
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;

  fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
  }

  #[test]
  fn log_returns_forward_fill_gaps() {
    let prices = vec![Some(100.0), None, Some(110.0), Some(110.0)];
    let r = log_returns_series(&prices);

    assert!(r[0].is_nan());
    assert_abs_diff_eq!(r[1], 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(r[2], (1.1_f64).ln() * 100.0, epsilon = 1e-12);
    assert_abs_diff_eq!(r[3], 0.0, epsilon = 1e-12);
  }

  #[test]
  fn pearson_uses_mutually_present_rows() {
    let x = vec![1.0, 2.0, f64::NAN, 4.0, 5.0];
    let y = vec![2.0, 4.0, 100.0, 8.0, f64::NAN];

    assert_abs_diff_eq!(pearson(&x, &y), 1.0, epsilon = 1e-12);
    assert_eq!(pearson(&[1.0], &[2.0]), 0.0);
  }

  #[test]
  fn union_reindexes_existing_columns() {
    let mut set = CandidateSet::new();
    let a = ReturnSeries::new("A", vec![day(1), day(3)], vec![1.0, 3.0]);
    set.union_index(&a.dates);
    set.insert(&a);

    let b = ReturnSeries::new("B", vec![day(2), day(3)], vec![2.0, 4.0]);
    assert!(set.union_index(&b.dates));
    set.insert(&b);

    assert_eq!(set.index(), &[day(1), day(2), day(3)]);
    let col_a = set.column("A").unwrap();
    assert_eq!(col_a[0], 1.0);
    assert!(col_a[1].is_nan());
    assert_eq!(col_a[2], 3.0);
    assert!(set.column("B").unwrap()[0].is_nan());
  }

  #[test]
  fn drop_empty_rows_removes_only_all_null_rows() {
    let mut set = CandidateSet::new();
    let a = ReturnSeries::new("A", vec![day(1), day(2), day(3)], vec![f64::NAN, 1.0, f64::NAN]);
    let b = ReturnSeries::new("B", vec![day(1), day(2), day(3)], vec![f64::NAN, f64::NAN, 2.0]);
    set.union_index(&a.dates);
    set.insert(&a);
    set.insert(&b);

    assert_eq!(set.drop_empty_rows(), 1);
    assert_eq!(set.index(), &[day(2), day(3)]);
  }

  #[test]
  fn covariance_is_symmetric_and_matches_variance() {
    let mut set = CandidateSet::new();
    let dates = vec![day(1), day(2), day(3), day(4)];
    let a = ReturnSeries::new("A", dates.clone(), vec![1.0, 2.0, 3.0, 4.0]);
    let b = ReturnSeries::new("B", dates.clone(), vec![2.0, 1.0, 4.0, 3.0]);
    set.union_index(&dates);
    set.insert(&a);
    set.insert(&b);

    let cov = set.covariance();
    assert_abs_diff_eq!(cov[[0, 0]], 5.0 / 3.0, epsilon = 1e-12);
    assert_abs_diff_eq!(cov[[0, 1]], cov[[1, 0]], epsilon = 1e-15);

    let corr = corr_from_cov(&cov);
    assert_abs_diff_eq!(corr[[0, 1]], set.correlation(0, 1), epsilon = 1e-12);
  }
}
