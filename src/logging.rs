//! Tracing subscriber setup.

use serde::Deserialize;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Bare level (`info`) or a full directive string (`info,frontier_rs=debug`).
  pub level: String,
  pub json: bool,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      json: false,
    }
  }
}

/// Directive string for `level`; a bare level quietens the HTTP stack.
pub fn filter_spec(level: &str) -> String {
  let level = level.trim();
  if level.contains(',') || level.contains('=') {
    level.to_string()
  } else {
    format!("{level},reqwest=info,hyper=info,hyper_util=info")
  }
}

/// Level filter for `config`; an unparsable directive falls back to `info`.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
  EnvFilter::try_new(filter_spec(&config.level)).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init_logging(config: &LoggingConfig) -> bool {
  let spec = filter_spec(&config.level);
  let registry = tracing_subscriber::registry().with(env_filter(config));

  let installed = if config.json {
    registry
      .with(fmt::layer().json().with_target(false).with_current_span(false))
      .try_init()
      .is_ok()
  } else {
    registry
      .with(fmt::layer().with_target(true).with_thread_ids(true).compact())
      .try_init()
      .is_ok()
  };

  if installed {
    tracing::info!(filter = %spec, json = config.json, "logging initialized");
  }
  installed
}
