//! # Settings
//!
//! Aggregated configuration of every component. Loaded from a JSON file or
//! from `FRONTIER_*` environment variables on top of the defaults.

use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::error::Error;
use crate::error::Result;
use crate::logging::LoggingConfig;
use crate::provider::ProviderConfig;
use crate::quant::portfolio::PortfolioEngineConfig;
use crate::quant::portfolio::SelectionConfig;
use crate::task::WorkerPoolConfig;

const ENV_PREFIX: &str = "FRONTIER_";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
  pub cache: CacheConfig,
  pub selection: SelectionConfig,
  pub engine: PortfolioEngineConfig,
  pub provider: ProviderConfig,
  pub workers: WorkerPoolConfig,
  pub logging: LoggingConfig,
}

impl Settings {
  /// Missing sections and fields keep their defaults.
  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    let settings: Self = serde_json::from_str(&raw)?;
    settings.validate()?;
    Ok(settings)
  }

  /// Defaults overridden by the process environment.
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Defaults overridden by whatever `lookup` returns for the `FRONTIER_*` keys.
  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let mut settings = Self::default();
    let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

    if let Some(dir) = get("CACHE_DIR") {
      settings.cache.dir = PathBuf::from(dir);
    }
    if let Some(v) = get("WORKERS") {
      settings.workers.workers = parse("WORKERS", &v)?;
    }
    if let Some(v) = get("QUEUE_CAPACITY") {
      settings.workers.queue_capacity = parse("QUEUE_CAPACITY", &v)?;
    }
    if let Some(v) = get("TASK_RETENTION_SECS") {
      settings.workers.retention_secs = parse("TASK_RETENTION_SECS", &v)?;
    }
    if let Some(v) = get("W_MAX") {
      settings.engine.w_max = parse("W_MAX", &v)?;
    }
    if let Some(v) = get("LOG_LEVEL") {
      settings.logging.level = v;
    }
    if let Some(v) = get("LOG_JSON") {
      settings.logging.json = parse("LOG_JSON", &v)?;
    }

    settings.validate()?;
    Ok(settings)
  }

  /// Reject settings no component can run with.
  pub fn validate(&self) -> Result<()> {
    if !(self.engine.w_max > 0.0 && self.engine.w_max <= 1.0) {
      return Err(Error::Config(format!("w_max {} outside (0, 1]", self.engine.w_max)));
    }
    if self.engine.frontier_steps == 0 {
      return Err(Error::Config("frontier_steps must be positive".into()));
    }
    if !(0.0..=1.0).contains(&self.selection.min_coverage) {
      return Err(Error::Config(format!(
        "min_coverage {} outside [0, 1]",
        self.selection.min_coverage
      )));
    }
    if self.workers.workers == 0 || self.workers.queue_capacity == 0 {
      return Err(Error::Config("worker pool needs at least one worker and one slot".into()));
    }
    Ok(())
  }
}

fn parse<T>(name: &str, raw: &str) -> Result<T>
where
  T: FromStr,
  T::Err: std::fmt::Display,
{
  raw
    .trim()
    .parse()
    .map_err(|e| Error::Config(format!("{ENV_PREFIX}{name}={raw}: {e}")))
}
