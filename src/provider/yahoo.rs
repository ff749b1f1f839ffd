//! Daily adjusted closes from Yahoo Finance.

use anyhow::Context;
use async_trait::async_trait;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::NaiveTime;
use time::OffsetDateTime;
use yahoo_finance_api as yahoo;

use super::returns_from_prices;
use super::ReturnSeriesProvider;
use crate::error::Error;
use crate::error::Result;
use crate::quant::portfolio::data::ReturnSeries;

pub struct YahooProvider {
  connector: yahoo::YahooConnector,
  max_abs_return: f64,
}

impl YahooProvider {
  /// Connect to Yahoo with the given quality threshold.
  pub fn new(max_abs_return: f64) -> Result<Self> {
    let connector = yahoo::YahooConnector::new().context("failed to build Yahoo connector")?;
    Ok(Self {
      connector,
      max_abs_return,
    })
  }
}

fn to_offset(date: NaiveDate) -> anyhow::Result<OffsetDateTime> {
  let ts = date.and_time(NaiveTime::default()).and_utc().timestamp();
  OffsetDateTime::from_unix_timestamp(ts).with_context(|| format!("date {date} out of range"))
}

#[async_trait]
impl ReturnSeriesProvider for YahooProvider {
  async fn fetch(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<ReturnSeries> {
    let download = |e: yahoo::YahooError| Error::Download {
      symbol: symbol.to_string(),
      reason: e.to_string(),
    };

    let response = self
      .connector
      .get_quote_history(symbol, to_offset(start)?, to_offset(end)?)
      .await
      .map_err(download)?;
    let quotes = response.quotes().map_err(download)?;

    let mut dates = Vec::with_capacity(quotes.len());
    let mut prices = Vec::with_capacity(quotes.len());
    for quote in &quotes {
      let Some(ts) = DateTime::from_timestamp(quote.timestamp as i64, 0) else {
        continue;
      };
      let date = ts.date_naive();
      if dates.last() == Some(&date) {
        continue;
      }
      dates.push(date);
      prices.push(Some(quote.adjclose).filter(|p| p.is_finite() && *p > 0.0));
    }
    tracing::debug!(symbol, rows = dates.len(), "downloaded price history");

    returns_from_prices(symbol, dates, &prices, self.max_abs_return)
  }
}
