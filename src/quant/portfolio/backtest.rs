//! # Backtest
//!
//! $$
//! r^p_t = \sum_i w_i r^i_t, \qquad
//! V_t = \left(V_{t-1} + c_{t-1}\right) e^{r^p_t / 100}
//! $$
//!
//! Replays a fixed allocation over history, once as a single deposit and once
//! as a systematic investment plan (SIP) depositing `c` every
//! `sip_frequency_days`. A deposit starts compounding the day after it is made.

use chrono::Days;
use chrono::Duration;
use chrono::NaiveDate;
use chrono::Utc;
use impl_new_derive::ImplNew;
use prettytable::row;
use prettytable::Table;
use serde::Deserialize;
use serde::Serialize;

use super::data::CandidateSet;
use super::types::Portfolio;
use crate::error::Error;
use crate::error::Result;
use crate::provider::ReturnSeriesProvider;

/// Allocation replayed when the caller names none.
pub const DEFAULT_BACKTEST_PORTFOLIO: &str = "VTI:0.5|VXUS:0.3|BND:0.1|BNDX:0.1";

/// SIP returns are only reported once this share of the total is invested.
pub const MIN_INVESTED_SHARE: f64 = 0.10;

/// Backtest window and deposit plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ImplNew)]
pub struct BacktestRequest {
  pub start: NaiveDate,
  pub end: NaiveDate,
  pub sip_amount: f64,
  pub sip_frequency_days: u32,
}

impl Default for BacktestRequest {
  fn default() -> Self {
    Self::trailing(Utc::now().date_naive())
  }
}

impl BacktestRequest {
  /// Five years up to the day before `today`, 1000 every 30 days.
  pub fn trailing(today: NaiveDate) -> Self {
    Self::new(
      today - Duration::days(365 * 5),
      today - Duration::days(1),
      1000.0,
      30,
    )
  }

  /// Reject empty windows, non-positive amounts and a zero frequency.
  pub fn validate(&self) -> Result<()> {
    if self.end <= self.start {
      return Err(Error::InvalidRequest(format!(
        "backtest end {} is not after start {}",
        self.end, self.start
      )));
    }
    if !self.sip_amount.is_finite() || self.sip_amount <= 0.0 {
      return Err(Error::InvalidRequest(format!(
        "sip_amount must be positive, got {}",
        self.sip_amount
      )));
    }
    if self.sip_frequency_days == 0 {
      return Err(Error::InvalidRequest("sip_frequency_days must be at least 1".into()));
    }
    Ok(())
  }

  /// Window length in 365-day years.
  pub fn years(&self) -> f64 {
    (self.end - self.start).num_days() as f64 / 365.0
  }
}

/// Deposits and value of one investment plan, row-aligned with the dates.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueSeries {
  pub dates: Vec<NaiveDate>,
  pub deposits: Vec<f64>,
  pub invested: Vec<f64>,
  pub value: Vec<f64>,
}

impl ValueSeries {
  /// Compound `deposits` through `returns` (percent log returns).
  pub fn compound(dates: Vec<NaiveDate>, returns: &[f64], deposits: Vec<f64>) -> Self {
    let mut value = Vec::with_capacity(deposits.len());
    let mut invested = Vec::with_capacity(deposits.len());
    let (mut v, mut pending, mut total) = (0.0, 0.0, 0.0);
    for (r, deposit) in returns.iter().zip(deposits.iter()) {
      v = (v + pending) * (r / 100.0).exp();
      pending = *deposit;
      total += deposit;
      value.push(v);
      invested.push(total);
    }

    Self {
      dates,
      deposits,
      invested,
      value,
    }
  }

  /// Number of rows.
  pub fn len(&self) -> usize {
    self.dates.len()
  }

  /// Whether the series has no rows.
  pub fn is_empty(&self) -> bool {
    self.dates.is_empty()
  }

  /// Highest value reached.
  pub fn peak(&self) -> f64 {
    self.value.iter().copied().fold(0.0, f64::max)
  }

  /// Largest relative fall from a running peak.
  pub fn max_drawdown(&self) -> f64 {
    max_drawdown(&self.value)
  }
}

/// Largest `(peak - v) / peak` over the series, ignoring rows before any
/// positive value.
pub fn max_drawdown(values: &[f64]) -> f64 {
  let mut peak = 0.0_f64;
  let mut worst = 0.0_f64;
  for v in values {
    peak = peak.max(*v);
    if peak > 0.0 {
      worst = worst.max((peak - v) / peak);
    }
  }
  worst
}

/// Single-deposit figures.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct OneTimeMetrics {
  pub cumulative_return: f64,
  pub annualized_return: f64,
  pub peak_value: f64,
  pub max_drawdown: f64,
}

/// Systematic plan figures. Returns on investment are `None` when fewer than
/// two rows pass the minimum-invested filter.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SipMetrics {
  pub total_return: Option<f64>,
  pub highest_return: Option<f64>,
  pub lowest_return: Option<f64>,
  pub peak_value: f64,
  pub max_drawdown: f64,
}

/// Full backtest outcome.
#[derive(Clone, Debug)]
pub struct BacktestReport {
  pub request: BacktestRequest,
  pub portfolio: Portfolio,
  /// Weighted daily portfolio return (percent), gaps counted as zero.
  pub returns: Vec<f64>,
  pub one_time: ValueSeries,
  pub sip: ValueSeries,
  /// First day on which more than [`MIN_INVESTED_SHARE`] of the plan total is in.
  pub min_invested_date: NaiveDate,
  pub one_time_metrics: OneTimeMetrics,
  pub sip_metrics: SipMetrics,
}

impl BacktestReport {
  /// Plain-text description of the plan and both sets of metrics.
  pub fn report(&self) -> String {
    let req = &self.request;
    let mut out = String::new();

    let mut table = Table::new();
    table.add_row(row!["Start Date", req.start]);
    table.add_row(row!["End Date", req.end]);
    table.add_row(row!["SIP Amount", format!("${}", req.sip_amount)]);
    table.add_row(row!["SIP Frequency", format!("Every {} days", req.sip_frequency_days)]);
    out.push_str(&table.to_string());

    let mut weights = self.portfolio.weights().to_vec();
    weights.sort_by(|a, b| b.1.total_cmp(&a.1));
    let mut table = Table::new();
    table.set_titles(row!["Component", "Weight", "Invested Amount"]);
    for (symbol, weight) in &weights {
      table.add_row(row![
        symbol,
        format!("{:.2}%", weight * 100.0),
        format!("${:.2}", weight * req.sip_amount)
      ]);
    }
    out.push_str(&table.to_string());

    let one = &self.one_time_metrics;
    let mut table = Table::new();
    table.set_titles(row!["One-Time Investment", ""]);
    table.add_row(row!["Cumulative Return", pct(one.cumulative_return)]);
    table.add_row(row!["Annualized Return", pct(one.annualized_return)]);
    table.add_row(row!["Peak Portfolio Value", format!("${:.2}", one.peak_value)]);
    table.add_row(row!["Max Drawdown from Peak", pct(one.max_drawdown)]);
    out.push_str(&table.to_string());

    let sip = &self.sip_metrics;
    let mut table = Table::new();
    table.set_titles(row!["SIP", ""]);
    table.add_row(row!["Total Return over Investment", opt_pct(sip.total_return)]);
    table.add_row(row!["Peak Portfolio Value", format!("${:.2}", sip.peak_value)]);
    table.add_row(row!["Max Drawdown from Peak", pct(sip.max_drawdown)]);
    table.add_row(row!["Highest Return on Investment", opt_pct(sip.highest_return)]);
    table.add_row(row!["Lowest Return on Investment", opt_pct(sip.lowest_return)]);
    out.push_str(&table.to_string());

    out.push_str(&format!(
      "Returns on investment count from {} once {:.0}% of the total is invested.\n",
      self.min_invested_date,
      MIN_INVESTED_SHARE * 100.0
    ));
    out
  }
}

fn pct(x: f64) -> String {
  format!("{:.2}%", x * 100.0)
}

fn opt_pct(x: Option<f64>) -> String {
  x.map_or_else(|| "n/a".to_string(), pct)
}

/// Weighted daily return of `portfolio` over the union of its components'
/// dates. Any fetch failure aborts.
pub async fn portfolio_returns(
  provider: &dyn ReturnSeriesProvider,
  portfolio: &Portfolio,
  start: NaiveDate,
  end: NaiveDate,
) -> Result<(Vec<NaiveDate>, Vec<f64>)> {
  let mut set = CandidateSet::new();
  for symbol in portfolio.symbols() {
    let series = provider.fetch(symbol, start, end).await?;
    tracing::info!(%symbol, rows = series.len(), "retrieved return series");
    set.union_index(&series.dates);
    set.insert(&series);
  }

  let mut returns = vec![0.0; set.n_rows()];
  for (symbol, weight) in portfolio.weights() {
    if let Some(column) = set.column(symbol) {
      for (acc, r) in returns.iter_mut().zip(column) {
        if !r.is_nan() {
          *acc += r * weight;
        }
      }
    }
  }
  Ok((set.index().to_vec(), returns))
}

/// Row of every scheduled deposit: the first trading day on or after each of
/// `start`, `start + f`, `start + 2f`, ... up to `end`.
pub fn deposit_rows(index: &[NaiveDate], request: &BacktestRequest) -> Vec<usize> {
  let step = Days::new(u64::from(request.sip_frequency_days));
  let mut rows = Vec::new();
  let mut at = request.start;
  while at <= request.end {
    let row = index.partition_point(|d| *d < at);
    if row == index.len() {
      break;
    }
    rows.push(row);
    match at.checked_add_days(step) {
      Some(next) => at = next,
      None => break,
    }
  }
  rows
}

/// Replay `portfolio` under `request`.
pub async fn run_backtest(
  provider: &dyn ReturnSeriesProvider,
  portfolio: &Portfolio,
  request: &BacktestRequest,
) -> Result<BacktestReport> {
  request.validate()?;
  let (dates, returns) = portfolio_returns(provider, portfolio, request.start, request.end).await?;

  let rows = deposit_rows(&dates, request);
  let Some(&first) = rows.first() else {
    return Err(Error::InvalidRequest(format!(
      "no trading days between {} and {}",
      request.start, request.end
    )));
  };
  tracing::info!(deposits = rows.len(), rows = dates.len(), "backtest schedule built");

  let mut once = vec![0.0; dates.len()];
  once[first] = request.sip_amount;
  let mut plan = vec![0.0; dates.len()];
  for row in &rows {
    plan[*row] += request.sip_amount;
  }
  let one_time = ValueSeries::compound(dates.clone(), &returns, once);
  let sip = ValueSeries::compound(dates, &returns, plan);

  let one_time_metrics = one_time_metrics(&one_time, request.years());
  let (min_row, sip_metrics) = sip_metrics(&sip);
  let min_invested_date = sip.dates[min_row];

  Ok(BacktestReport {
    request: request.clone(),
    portfolio: portfolio.clone(),
    returns,
    one_time,
    sip,
    min_invested_date,
    one_time_metrics,
    sip_metrics,
  })
}

fn one_time_metrics(series: &ValueSeries, years: f64) -> OneTimeMetrics {
  let last = series.len() - 1;
  let cumulative_return = series.value[last] / series.invested[last] - 1.0;
  OneTimeMetrics {
    cumulative_return,
    annualized_return: (1.0 + cumulative_return).powf(1.0 / years) - 1.0,
    peak_value: series.peak(),
    max_drawdown: series.max_drawdown(),
  }
}

/// Metrics over the rows past the minimum-invested threshold, plus the first
/// such row.
fn sip_metrics(series: &ValueSeries) -> (usize, SipMetrics) {
  let total = series.invested.last().copied().unwrap_or(0.0);
  let rows: Vec<usize> = (0..series.len())
    .filter(|&i| series.invested[i] > total * MIN_INVESTED_SHARE)
    .collect();

  let roi: Vec<f64> = rows
    .windows(2)
    .map(|w| series.value[w[1]] / series.invested[w[0]] - 1.0)
    .collect();

  let metrics = SipMetrics {
    total_return: roi.last().copied(),
    highest_return: roi.iter().copied().reduce(f64::max),
    lowest_return: roi.iter().copied().reduce(f64::min),
    peak_value: series.peak(),
    max_drawdown: series.max_drawdown(),
  };
  (rows.first().copied().unwrap_or(0), metrics)
}
