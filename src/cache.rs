//! # Metadata Cache
//!
//! $$
//! \text{keep}(row) \iff t_{entry} > \begin{cases}
//! c & \text{complete row} \\
//! c + (\tau - \tau_p) & \text{placeholder}
//! \end{cases}
//! $$
//!
//! Durable per-instrument liquidity facts shared by every running task and
//! every process on the host. Writers serialize on an advisory lease file;
//! readers take snapshots without locking.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub mod lock;
pub mod metadata;

pub use lock::CacheLock;
pub use lock::LockOptions;
pub use metadata::AssetMetadata;
pub use metadata::CacheCycle;
pub use metadata::MetadataCache;

/// Location, expiry and lock discipline of the metadata cache.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub dir: PathBuf,
  /// Lifetime of a complete row.
  pub ttl_days: u64,
  /// Lifetime of a placeholder row left by a failed lookup.
  pub placeholder_ttl_hours: u64,
  /// New rows attempted per processing cycle.
  pub chunk_size: usize,
  pub lock_timeout_secs: u64,
  pub lock_poll_millis: u64,
  /// Lease age after which its holder is presumed dead.
  pub stale_lock_secs: u64,
  /// Attempts per locked step of a processing cycle.
  pub lock_retries: u64,
  /// Backoff unit between attempts; the n-th retry waits n units.
  pub lock_backoff_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      dir: PathBuf::from("__cache__"),
      ttl_days: 7,
      placeholder_ttl_hours: 12,
      chunk_size: 100,
      lock_timeout_secs: 30,
      lock_poll_millis: 200,
      stale_lock_secs: 600,
      lock_retries: 3,
      lock_backoff_secs: 10,
    }
  }
}

impl CacheConfig {
  /// Age after which complete rows are pruned.
  pub fn ttl(&self) -> chrono::Duration {
    chrono::Duration::days(self.ttl_days as i64)
  }

  /// Age after which placeholder rows are pruned.
  pub fn placeholder_ttl(&self) -> chrono::Duration {
    chrono::Duration::hours(self.placeholder_ttl_hours as i64)
  }

  /// Lease wait bounds; the poll interval is at least 1 ms.
  pub fn lock_options(&self) -> LockOptions {
    LockOptions {
      timeout: Duration::from_secs(self.lock_timeout_secs),
      poll: Duration::from_millis(self.lock_poll_millis.max(1)),
      stale_after: Duration::from_secs(self.stale_lock_secs),
    }
  }
}
