//! # Providers
//!
//! $$
//! r_t = 100 \cdot \ln\frac{\tilde P_t}{\tilde P_{t-1}}, \qquad
//! \tilde P_t = \text{last observed price at or before } t
//! $$
//!
//! External collaborators consumed by the pipeline: the return series source,
//! the instrument universe and the per-instrument metadata source. Also the
//! price to return conversion every series source shares, a retrying wrapper
//! and in-memory sources for wiring and tests.

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use serde::Deserialize;

use crate::error::Error;
use crate::error::Result;
use crate::quant::portfolio::data::log_returns_series;
use crate::quant::portfolio::data::ReturnSeries;
use crate::retry::retry_async;

#[cfg(feature = "yahoo")]
pub mod yahoo;

/// Source of daily log-return series (percent).
#[async_trait]
pub trait ReturnSeriesProvider: Send + Sync {
  /// Fails with [`Error::Download`] or [`Error::DataQuality`].
  async fn fetch(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<ReturnSeries>;
}

/// Full list of eligible instrument symbols.
#[async_trait]
pub trait UniverseProvider: Send + Sync {
  async fn symbols(&self) -> Result<Vec<String>>;
}

/// Liquidity, price and currency facts for one instrument.
#[derive(Clone, Debug, PartialEq)]
pub struct InstrumentQuote {
  pub exchange: String,
  /// Average daily traded volume.
  pub volume: f64,
  /// Average price.
  pub price: f64,
  pub currency: String,
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
  async fn fetch_metadata(&self, symbol: &str) -> Result<InstrumentQuote>;
}

/// Retry budget and quality threshold of the return series source.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
  pub attempts: usize,
  pub initial_backoff_millis: u64,
  /// Largest accepted single-day |return|, in percent.
  pub max_abs_return: f64,
}

impl Default for ProviderConfig {
  fn default() -> Self {
    Self {
      attempts: 3,
      initial_backoff_millis: 500,
      max_abs_return: 50.0,
    }
  }
}

/// Reject a series whose largest single-day move exceeds `threshold`.
pub fn check_quality(series: &ReturnSeries, threshold: f64) -> Result<()> {
  let max_abs_return = series.max_abs_return();
  if max_abs_return > threshold {
    return Err(Error::DataQuality {
      symbol: series.symbol.clone(),
      max_abs_return,
      threshold,
    });
  }
  Ok(())
}

/// Forward-filled percent log-returns of a price history, quality checked.
///
/// The first observation has no predecessor and is null.
pub fn returns_from_prices(
  symbol: &str,
  dates: Vec<NaiveDate>,
  prices: &[Option<f64>],
  max_abs_return: f64,
) -> Result<ReturnSeries> {
  if dates.len() != prices.len() {
    return Err(Error::Download {
      symbol: symbol.to_string(),
      reason: format!("{} dates for {} prices", dates.len(), prices.len()),
    });
  }
  let series = ReturnSeries::new(symbol, dates, log_returns_series(prices));
  check_quality(&series, max_abs_return)?;
  Ok(series)
}

/// Wraps a source and retries transient download failures with backoff.
#[derive(Debug)]
pub struct RetryingProvider<P> {
  inner: P,
  config: ProviderConfig,
}

impl<P> RetryingProvider<P> {
  /// Wrap `inner` with the configured retry budget.
  pub fn new(inner: P, config: ProviderConfig) -> Self {
    Self { inner, config }
  }

  /// Borrow the wrapped provider.
  pub fn inner(&self) -> &P {
    &self.inner
  }
}

#[async_trait]
impl<P: ReturnSeriesProvider> ReturnSeriesProvider for RetryingProvider<P> {
  async fn fetch(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<ReturnSeries> {
    let inner = &self.inner;
    retry_async(
      move |_| inner.fetch(symbol, start, end),
      self.config.attempts,
      Duration::from_millis(self.config.initial_backoff_millis),
    )
    .await
  }
}

/// Return series held in memory, with injectable failures.
#[derive(Debug)]
pub struct InMemoryProvider {
  series: HashMap<String, ReturnSeries>,
  failures: HashMap<String, String>,
  transient: DashMap<String, usize>,
  calls: DashMap<String, usize>,
  max_abs_return: f64,
}

impl Default for InMemoryProvider {
  fn default() -> Self {
    Self::new(ProviderConfig::default().max_abs_return)
  }
}

impl InMemoryProvider {
  /// Construct an empty provider with an explicit quality threshold.
  pub fn new(max_abs_return: f64) -> Self {
    Self {
      series: HashMap::new(),
      failures: HashMap::new(),
      transient: DashMap::new(),
      calls: DashMap::new(),
      max_abs_return,
    }
  }

  /// Serve `series` for its symbol.
  pub fn with_series(mut self, series: ReturnSeries) -> Self {
    self.series.insert(series.symbol.clone(), series);
    self
  }

  /// Every fetch of `symbol` fails with [`Error::Download`].
  pub fn with_download_error(mut self, symbol: &str, reason: &str) -> Self {
    self.failures.insert(symbol.to_string(), reason.to_string());
    self
  }

  /// The next `count` fetches of `symbol` fail with [`Error::Download`].
  pub fn with_transient_failures(self, symbol: &str, count: usize) -> Self {
    self.transient.insert(symbol.to_string(), count);
    self
  }

  /// Number of fetches seen for `symbol`.
  pub fn calls(&self, symbol: &str) -> usize {
    self.calls.get(symbol).map_or(0, |c| *c)
  }
}

#[async_trait]
impl ReturnSeriesProvider for InMemoryProvider {
  async fn fetch(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<ReturnSeries> {
    *self.calls.entry(symbol.to_string()).or_insert(0) += 1;

    if let Some(reason) = self.failures.get(symbol) {
      return Err(Error::Download {
        symbol: symbol.to_string(),
        reason: reason.clone(),
      });
    }
    if let Some(mut remaining) = self.transient.get_mut(symbol) {
      if *remaining > 0 {
        *remaining -= 1;
        return Err(Error::Download {
          symbol: symbol.to_string(),
          reason: "transient failure".into(),
        });
      }
    }

    let series = self.series.get(symbol).ok_or_else(|| Error::Download {
      symbol: symbol.to_string(),
      reason: "no data".into(),
    })?;
    let (dates, values) = series
      .dates
      .iter()
      .zip(series.values.iter())
      .filter(|(d, _)| **d >= start && **d <= end)
      .map(|(d, v)| (*d, *v))
      .unzip();
    let window = ReturnSeries::new(symbol, dates, values);
    check_quality(&window, self.max_abs_return)?;
    Ok(window)
  }
}

/// Fixed universe.
#[derive(Clone, Debug, Default)]
pub struct StaticUniverse {
  symbols: Vec<String>,
}

impl StaticUniverse {
  /// Construct a universe from a fixed symbol list.
  pub fn new<I, S>(symbols: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      symbols: symbols.into_iter().map(Into::into).collect(),
    }
  }
}

#[async_trait]
impl UniverseProvider for StaticUniverse {
  async fn symbols(&self) -> Result<Vec<String>> {
    Ok(self.symbols.clone())
  }
}

/// Metadata held in memory; unknown symbols fail like a network error.
#[derive(Debug, Default)]
pub struct StaticMetadata {
  quotes: HashMap<String, InstrumentQuote>,
  calls: AtomicUsize,
}

impl StaticMetadata {
  /// Construct a source with no quotes.
  pub fn new() -> Self {
    Self::default()
  }

  /// Serve `quote` for `symbol`.
  pub fn with_quote(mut self, symbol: &str, quote: InstrumentQuote) -> Self {
    self.quotes.insert(symbol.to_string(), quote);
    self
  }

  /// Total lookups, failed ones included.
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::Relaxed)
  }
}

#[async_trait]
impl MetadataSource for StaticMetadata {
  async fn fetch_metadata(&self, symbol: &str) -> Result<InstrumentQuote> {
    self.calls.fetch_add(1, Ordering::Relaxed);
    self.quotes.get(symbol).cloned().ok_or_else(|| Error::Download {
      symbol: symbol.to_string(),
      reason: "no metadata".into(),
    })
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use chrono::Duration as ChronoDuration;

  use super::*;

  fn dates(n: usize) -> Vec<NaiveDate> {
    let start = NaiveDate::from_ymd_opt(2023, 3, 1).unwrap();
    (0..n).map(|i| start + ChronoDuration::days(i as i64)).collect()
  }

  fn fast_retries() -> ProviderConfig {
    ProviderConfig {
      attempts: 3,
      initial_backoff_millis: 1,
      ..ProviderConfig::default()
    }
  }

  #[test]
  fn prices_become_percent_log_returns() {
    let prices = vec![Some(100.0), Some(101.0), None, Some(99.0)];
    let series = returns_from_prices("SPY", dates(4), &prices, 50.0).unwrap();

    assert!(series.values[0].is_nan());
    assert_abs_diff_eq!(series.values[1], (1.01_f64).ln() * 100.0, epsilon = 1e-12);
    assert_abs_diff_eq!(series.values[2], 0.0, epsilon = 1e-12);
    assert_eq!(series.len(), 4);
  }

  #[test]
  fn extreme_move_is_a_quality_error() {
    let prices = vec![Some(10.0), Some(20.0)];
    let err = returns_from_prices("JUMP", dates(2), &prices, 50.0).unwrap_err();

    assert!(matches!(err, Error::DataQuality { .. }));
    assert!(!err.is_retryable());
  }

  #[tokio::test]
  async fn retrying_provider_recovers_from_transient_failures() {
    let series = ReturnSeries::new("QQQ", dates(3), vec![f64::NAN, 0.5, -0.2]);
    let inner = InMemoryProvider::default()
      .with_series(series)
      .with_transient_failures("QQQ", 2);
    let provider = RetryingProvider::new(inner, fast_retries());
    let d = dates(3);

    let fetched = provider.fetch("QQQ", d[0], d[2]).await.unwrap();
    assert_eq!(fetched.len(), 3);
    assert_eq!(provider.inner().calls("QQQ"), 3);
  }

  #[tokio::test]
  async fn retrying_provider_surfaces_persistent_download_errors() {
    let inner = InMemoryProvider::default().with_download_error("DEAD", "delisted");
    let provider = RetryingProvider::new(inner, fast_retries());
    let d = dates(2);

    let err = provider.fetch("DEAD", d[0], d[1]).await.unwrap_err();
    assert!(matches!(err, Error::Download { .. }));
    assert_eq!(provider.inner().calls("DEAD"), 3);
  }

  #[tokio::test]
  async fn quality_errors_are_not_retried() {
    let series = ReturnSeries::new("WILD", dates(2), vec![f64::NAN, 80.0]);
    let inner = InMemoryProvider::default().with_series(series);
    let provider = RetryingProvider::new(inner, fast_retries());
    let d = dates(2);

    let err = provider.fetch("WILD", d[0], d[1]).await.unwrap_err();
    assert!(matches!(err, Error::DataQuality { .. }));
    assert_eq!(provider.inner().calls("WILD"), 1);
  }

  #[tokio::test]
  async fn in_memory_provider_windows_by_date() {
    let d = dates(5);
    let series = ReturnSeries::new("IWM", d.clone(), vec![f64::NAN, 1.0, 2.0, 3.0, 4.0]);
    let provider = InMemoryProvider::default().with_series(series);

    let window = provider.fetch("IWM", d[1], d[3]).await.unwrap();
    assert_eq!(window.dates, d[1..=3].to_vec());
    assert_eq!(window.values, vec![1.0, 2.0, 3.0]);
  }

  #[tokio::test]
  async fn static_metadata_counts_lookups() {
    let source = StaticMetadata::new().with_quote(
      "VTI",
      InstrumentQuote {
        exchange: "PCX".into(),
        volume: 3.0e6,
        price: 250.0,
        currency: "USD".into(),
      },
    );

    assert!(source.fetch_metadata("VTI").await.is_ok());
    assert!(source.fetch_metadata("NOPE").await.is_err());
    assert_eq!(source.calls(), 2);
  }
}
