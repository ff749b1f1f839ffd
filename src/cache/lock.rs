//! Advisory lease file guarding the cache's read-modify-write cycles.
//!
//! The lease is a file created with `create_new` and holding a token unique to
//! one acquisition; whoever creates it holds the lock until the guard is
//! dropped. A lease older than the stale bound is treated as abandoned by a
//! crashed writer and reclaimed.
//!
//! Reclaiming is serialized by a second lease (`<lease>.reclaim`). Under it the
//! reclaimer re-reads the lease, renames it aside and only deletes it if the
//! renamed file still carries the stale token. Release removes the lease only
//! while it still carries the holder's own token.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use tokio::fs;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tokio::time::Instant;

use crate::error::Error;
use crate::error::Result;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(0);

/// Wait bounds for [`CacheLock::acquire`].
#[derive(Clone, Copy, Debug)]
pub struct LockOptions {
  pub timeout: Duration,
  pub poll: Duration,
  pub stale_after: Duration,
}

/// Held lease. Released on drop.
#[derive(Debug)]
pub struct CacheLock {
  path: PathBuf,
  token: String,
}

impl CacheLock {
  /// Create the lease file, polling while another holder has it.
  ///
  /// Fails with [`Error::CacheLockTimeout`] once `timeout` has elapsed; the
  /// caller is expected to back off and retry, never to bypass the lock.
  pub async fn acquire(path: &Path, opts: LockOptions) -> Result<Self> {
    let started = Instant::now();
    loop {
      if let Some(lock) = Self::try_create(path).await? {
        tracing::debug!(path = %path.display(), token = %lock.token, "cache lock acquired");
        return Ok(lock);
      }
      if reclaim_stale(path, opts.stale_after).await? {
        continue;
      }

      let waited = started.elapsed();
      if waited >= opts.timeout {
        return Err(Error::CacheLockTimeout {
          path: path.to_path_buf(),
          waited,
        });
      }
      sleep(opts.poll.min(opts.timeout - waited)).await;
    }
  }

  /// One `create_new` attempt. `None` while someone else holds `path`.
  async fn try_create(path: &Path) -> Result<Option<Self>> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path).await {
      Ok(file) => file,
      Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
      Err(e) => return Err(e.into()),
    };

    let token = new_token();
    let written = async {
      file.write_all(format!("{token}\n").as_bytes()).await?;
      file.sync_all().await
    }
    .await;
    if let Err(e) = written {
      // an empty lease would block every writer until it turns stale
      if let Err(rm) = fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %rm, "failed to remove unwritten cache lock");
      }
      return Err(e.into());
    }

    Ok(Some(Self {
      path: path.to_path_buf(),
      token,
    }))
  }

  /// Borrow the lease file path.
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Owner token written into the lease file.
  pub fn token(&self) -> &str {
    &self.token
  }
}

impl Drop for CacheLock {
  fn drop(&mut self) {
    match std::fs::read_to_string(&self.path) {
      Ok(content) if content.trim() == self.token => {
        if let Err(e) = std::fs::remove_file(&self.path) {
          if e.kind() != ErrorKind::NotFound {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release cache lock");
          }
        }
      }
      Ok(_) => tracing::warn!(path = %self.path.display(), "cache lock was reclaimed by another writer"),
      Err(e) if e.kind() == ErrorKind::NotFound => {
        tracing::warn!(path = %self.path.display(), "cache lock vanished before release")
      }
      Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "failed to read cache lock"),
    }
  }
}

/// `<pid>-<unix nanos>-<counter>`, unique per acquisition.
fn new_token() -> String {
  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map_or(0, |d| d.as_nanos());
  format!(
    "{}-{nanos}-{}",
    std::process::id(),
    NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
  )
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
  let mut name = OsString::from(path.as_os_str());
  name.push(".");
  name.push(suffix);
  PathBuf::from(name)
}

async fn read_token(path: &Path) -> Option<String> {
  fs::read_to_string(path)
    .await
    .ok()
    .map(|content| content.trim().to_string())
}

/// Token of the lease at `path` if the lease is older than `stale_after`.
///
/// The token is read before the age so that a lease replaced in between is
/// judged by its own, fresh, modification time.
async fn stale_token(path: &Path, stale_after: Duration) -> Option<String> {
  let token = read_token(path).await?;
  let meta = fs::metadata(path).await.ok()?;
  let age = meta
    .modified()
    .ok()
    .and_then(|m| SystemTime::now().duration_since(m).ok())?;
  (age > stale_after).then_some(token)
}

/// Remove the lease at `path` if it is stale. Returns whether it was removed.
async fn reclaim_stale(path: &Path, stale_after: Duration) -> Result<bool> {
  let Some(seen) = stale_token(path, stale_after).await else {
    return Ok(false);
  };

  let guard_path = sibling(path, "reclaim");
  let guard = match CacheLock::try_create(&guard_path).await? {
    Some(guard) => guard,
    None => {
      // a reclaimer that crashed mid-way leaves its guard behind
      if stale_token(&guard_path, stale_after).await.is_some() {
        tracing::warn!(path = %guard_path.display(), "removing abandoned reclaim guard");
        remove_if_present(&guard_path).await?;
      }
      return Ok(false);
    }
  };

  if stale_token(path, stale_after).await.as_deref() != Some(seen.as_str()) {
    drop(guard);
    return Ok(false);
  }

  let grave = sibling(path, &format!("stale.{}", guard.token()));
  match fs::rename(path, &grave).await {
    Ok(()) => {}
    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
    Err(e) => return Err(e.into()),
  }

  let reclaimed = read_token(&grave).await.as_deref() == Some(seen.as_str());
  if reclaimed {
    tracing::warn!(path = %path.display(), owner = %seen, "removed stale cache lock");
  } else {
    // the stale holder released and a new one took over in between; put it back
    match fs::hard_link(&grave, path).await {
      Ok(()) => {}
      Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to restore live cache lock"),
    }
  }
  remove_if_present(&grave).await?;
  drop(guard);
  Ok(reclaimed)
}

async fn remove_if_present(path: &Path) -> Result<()> {
  match fs::remove_file(path).await {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e.into()),
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;
  use std::sync::Arc;

  use super::*;

  fn opts(timeout_ms: u64) -> LockOptions {
    LockOptions {
      timeout: Duration::from_millis(timeout_ms),
      poll: Duration::from_millis(5),
      stale_after: Duration::from_secs(3600),
    }
  }

  fn write_backdated_lease(path: &Path, token: &str, age: Duration) {
    std::fs::write(path, format!("{token}\n")).unwrap();
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - age).unwrap();
  }

  #[tokio::test]
  async fn second_holder_times_out_until_release() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".lease.lock");

    let first = CacheLock::acquire(&path, opts(50)).await.unwrap();
    assert!(path.exists());
    assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), first.token());

    let err = CacheLock::acquire(&path, opts(30)).await.unwrap_err();
    assert!(matches!(err, Error::CacheLockTimeout { .. }));
    assert!(err.is_retryable());

    drop(first);
    assert!(!path.exists());
    let _second = CacheLock::acquire(&path, opts(30)).await.unwrap();
  }

  #[tokio::test]
  async fn waiter_gets_lock_when_holder_releases() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".lease.lock");

    let first = CacheLock::acquire(&path, opts(50)).await.unwrap();
    let waiter = {
      let path = path.clone();
      tokio::spawn(async move { CacheLock::acquire(&path, opts(2_000)).await.map(|_| ()) })
    };
    sleep(Duration::from_millis(20)).await;
    drop(first);

    assert!(waiter.await.unwrap().is_ok());
  }

  #[tokio::test]
  async fn stale_lease_is_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".lease.lock");
    write_backdated_lease(&path, "12345-crashed", Duration::from_secs(7200));

    let lock = CacheLock::acquire(&path, opts(1_000)).await.unwrap();
    assert_eq!(lock.path(), path.as_path());
    assert_ne!(lock.token(), "12345-crashed");
    drop(lock);

    let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert!(leftovers.is_empty());
  }

  #[tokio::test]
  async fn release_leaves_a_successor_lease_alone() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".lease.lock");

    let lock = CacheLock::acquire(&path, opts(50)).await.unwrap();
    std::fs::write(&path, "successor-token\n").unwrap();
    drop(lock);

    assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "successor-token");
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
  async fn concurrent_reclaim_admits_one_holder_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".lease.lock");
    let lock_opts = LockOptions {
      timeout: Duration::from_secs(20),
      poll: Duration::from_millis(1),
      stale_after: Duration::from_secs(60),
    };

    for round in 0..10 {
      write_backdated_lease(&path, &format!("dead-{round}"), Duration::from_secs(3600));
      let holders = Arc::new(AtomicUsize::new(0));
      let peak = Arc::new(AtomicUsize::new(0));

      let waiters: Vec<_> = (0..16)
        .map(|_| {
          let path = path.clone();
          let holders = Arc::clone(&holders);
          let peak = Arc::clone(&peak);
          tokio::spawn(async move {
            let lock = CacheLock::acquire(&path, lock_opts).await.unwrap();
            let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(2)).await;
            holders.fetch_sub(1, Ordering::SeqCst);
            drop(lock);
          })
        })
        .collect();
      for waiter in waiters {
        waiter.await.unwrap();
      }

      assert_eq!(peak.load(Ordering::SeqCst), 1, "round {round}");
      assert!(!path.exists());
    }
    let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert!(leftovers.is_empty());
  }
}
