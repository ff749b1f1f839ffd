//! Cached instrument metadata table and its locked maintenance operations.

use std::collections::HashSet;
use std::future::Future;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use impl_new_derive::ImplNew;
use serde::Deserialize;
use serde::Serialize;
use tokio::fs;
use tokio::time::sleep;

use super::lock::CacheLock;
use super::CacheConfig;
use crate::error::Error;
use crate::error::Result;
use crate::provider::InstrumentQuote;
use crate::provider::MetadataSource;
use crate::provider::UniverseProvider;

const TABLE_FILE: &str = "etf_metadata_cache.json";
const LOCK_FILE: &str = ".lease.lock";

/// One cached instrument. Placeholder rows from failed lookups carry nulls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ImplNew)]
pub struct AssetMetadata {
  pub symbol: String,
  pub exchange: Option<String>,
  pub volume: Option<f64>,
  pub price: Option<f64>,
  pub currency: Option<String>,
  pub entry_time: DateTime<Utc>,
}

impl AssetMetadata {
  /// Complete row from a successful lookup.
  pub fn from_quote(symbol: &str, quote: InstrumentQuote, entry_time: DateTime<Utc>) -> Self {
    Self::new(
      symbol.to_string(),
      Some(quote.exchange),
      Some(quote.volume),
      Some(quote.price),
      Some(quote.currency),
      entry_time,
    )
  }

  /// Row of nulls recording a failed lookup.
  pub fn placeholder(symbol: &str, entry_time: DateTime<Utc>) -> Self {
    Self::new(symbol.to_string(), None, None, None, None, entry_time)
  }

  /// Every field present.
  pub fn is_complete(&self) -> bool {
    self.exchange.is_some() && self.volume.is_some() && self.price.is_some() && self.currency.is_some()
  }
}

/// Outcome of [`MetadataCache::process`]. `None` marks a step skipped after
/// exhausting its lock retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheCycle {
  pub remaining_after_prune: Option<usize>,
  pub attempted: Option<usize>,
  /// Rows visible to readers once the cycle ends.
  pub rows: usize,
}

/// File-backed metadata table.
#[derive(Clone, Debug)]
pub struct MetadataCache {
  config: CacheConfig,
}

impl MetadataCache {
  /// Construct a cache over `config.dir`.
  pub fn new(config: CacheConfig) -> Self {
    Self { config }
  }

  /// Borrow cache configuration.
  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  /// Path of the JSON table.
  pub fn table_path(&self) -> PathBuf {
    self.config.dir.join(TABLE_FILE)
  }

  /// Path of the lease file.
  pub fn lock_path(&self) -> PathBuf {
    self.config.dir.join(LOCK_FILE)
  }

  async fn lock(&self) -> Result<CacheLock> {
    fs::create_dir_all(&self.config.dir).await?;
    CacheLock::acquire(&self.lock_path(), self.config.lock_options()).await
  }

  async fn read_table(&self) -> Result<Vec<AssetMetadata>> {
    let bytes = match fs::read(self.table_path()).await {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(e.into()),
    };
    let rows: Vec<AssetMetadata> = serde_json::from_slice(&bytes)?;

    let mut seen = HashSet::new();
    let before = rows.len();
    let rows: Vec<AssetMetadata> = rows
      .into_iter()
      .filter(|r| seen.insert(r.symbol.clone()))
      .collect();
    if rows.len() != before {
      tracing::warn!(dropped = before - rows.len(), "duplicate symbols in metadata cache");
    }
    Ok(rows)
  }

  /// Write through a temporary file so snapshot readers never see a torn table.
  async fn write_table(&self, rows: &[AssetMetadata]) -> Result<()> {
    let path = self.table_path();
    let tmp = self
      .config
      .dir
      .join(format!("{TABLE_FILE}.{}.tmp", std::process::id()));
    fs::write(&tmp, serde_json::to_vec_pretty(rows)?).await?;
    fs::rename(&tmp, &path).await?;
    Ok(())
  }

  /// Unguarded snapshot. A missing table reads as empty.
  pub async fn as_of(&self) -> Result<Vec<AssetMetadata>> {
    self.read_table().await
  }

  /// Drop rows older than `cutoff`; placeholders expire against a later cutoff.
  ///
  /// Returns the number of rows left.
  pub async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize> {
    let _lock = self.lock().await?;
    let rows = self.read_table().await?;
    let before = rows.len();
    let placeholder_cutoff = cutoff + (self.config.ttl() - self.config.placeholder_ttl());

    let kept: Vec<AssetMetadata> = rows
      .into_iter()
      .filter(|r| {
        if r.is_complete() {
          r.entry_time > cutoff
        } else {
          r.entry_time > placeholder_cutoff
        }
      })
      .collect();

    if kept.len() != before {
      self.write_table(&kept).await?;
    }
    tracing::info!(before, after = kept.len(), "pruned metadata cache");
    Ok(kept.len())
  }

  /// Look up symbols missing from the table, at most `max_new_entries` of them.
  ///
  /// Failed lookups are stored as placeholders. Returns the number attempted.
  pub async fn populate(
    &self,
    max_new_entries: usize,
    universe: &[String],
    source: &dyn MetadataSource,
  ) -> Result<usize> {
    let _lock = self.lock().await?;
    let mut rows = self.read_table().await?;
    let mut known: HashSet<String> = rows.iter().map(|r| r.symbol.clone()).collect();
    let mut attempted = 0;

    for symbol in universe {
      if attempted >= max_new_entries {
        break;
      }
      if !known.insert(symbol.clone()) {
        continue;
      }
      attempted += 1;

      let row = match source.fetch_metadata(symbol).await {
        Ok(quote) => AssetMetadata::from_quote(symbol, quote, Utc::now()),
        Err(e) => {
          tracing::warn!(symbol = %symbol, error = %e, "metadata lookup failed");
          AssetMetadata::placeholder(symbol, Utc::now())
        }
      };
      rows.push(row);
    }

    if attempted > 0 {
      self.write_table(&rows).await?;
      tracing::info!(attempted, rows = rows.len(), "saved metadata cache");
    }
    Ok(attempted)
  }

  /// Prune expired rows, then populate the next chunk of the universe.
  ///
  /// Lock timeouts are retried with linear backoff; a step that still cannot
  /// take the lock is skipped and the existing rows are used as they are.
  pub async fn process(
    &self,
    universe: &dyn UniverseProvider,
    source: &dyn MetadataSource,
  ) -> Result<CacheCycle> {
    let cutoff = Utc::now() - self.config.ttl();
    let remaining_after_prune = self.with_lock_retries("prune", || self.prune(cutoff)).await?;

    let symbols = universe
      .symbols()
      .await
      .map_err(|e| Error::Universe(e.to_string()))?;
    let chunk = self.config.chunk_size;
    let attempted = self
      .with_lock_retries("populate", || self.populate(chunk, &symbols, source))
      .await?;

    let rows = self.as_of().await?.len();
    Ok(CacheCycle {
      remaining_after_prune,
      attempted,
      rows,
    })
  }

  async fn with_lock_retries<T, F, Fut>(&self, step: &str, mut op: F) -> Result<Option<T>>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let retries = self.config.lock_retries.max(1);
    let mut attempt = 1;
    loop {
      match op().await {
        Ok(v) => return Ok(Some(v)),
        Err(e @ Error::CacheLockTimeout { .. }) => {
          if attempt >= retries {
            tracing::warn!(step, attempts = attempt, error = %e, "giving up on cache step");
            return Ok(None);
          }
          let backoff = Duration::from_secs(self.config.lock_backoff_secs * attempt);
          tracing::info!(step, attempt, backoff_secs = backoff.as_secs(), "cache locked, backing off");
          sleep(backoff).await;
          attempt += 1;
        }
        Err(e) => return Err(e),
      }
    }
  }
}
