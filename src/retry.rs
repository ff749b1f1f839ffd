//! # Retry
//!
//! $$
//! d_k = d_0 \cdot 2^{k-1}
//! $$
//!
//! Bounded async retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::error::Error;

/// Retry `op` while it fails with a retryable [`Error`], at most `attempts` times.
///
/// Non-retryable errors are returned immediately. `op` receives the 1-based attempt number.
pub async fn retry_async<F, Fut, T>(
  mut op: F,
  attempts: usize,
  initial_delay: Duration,
) -> Result<T, Error>
where
  F: FnMut(usize) -> Fut,
  Fut: Future<Output = Result<T, Error>>,
{
  let attempts = attempts.max(1);
  let mut delay = initial_delay;
  let mut attempt = 1;
  loop {
    match op(attempt).await {
      Ok(v) => return Ok(v),
      Err(e) if e.is_retryable() && attempt < attempts => {
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
        sleep(delay).await;
        delay = delay.saturating_mul(2);
        attempt += 1;
      }
      Err(e) => return Err(e),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;

  use super::*;

  fn download_error() -> Error {
    Error::Download {
      symbol: "SPY".into(),
      reason: "connection reset".into(),
    }
  }

  #[tokio::test]
  async fn retries_until_success() {
    let counter = AtomicUsize::new(0);
    let res: Result<u32, Error> = retry_async(
      |_| {
        let current = counter.fetch_add(1, Ordering::Relaxed);
        async move {
          if current < 2 {
            Err(download_error())
          } else {
            Ok(7)
          }
        }
      },
      4,
      Duration::from_millis(1),
    )
    .await;

    assert_eq!(res.unwrap(), 7);
    assert_eq!(counter.load(Ordering::Relaxed), 3);
  }

  #[tokio::test]
  async fn gives_up_after_budget() {
    let counter = AtomicUsize::new(0);
    let res: Result<u32, Error> = retry_async(
      |_| {
        counter.fetch_add(1, Ordering::Relaxed);
        async { Err(download_error()) }
      },
      3,
      Duration::from_millis(1),
    )
    .await;

    assert!(matches!(res, Err(Error::Download { .. })));
    assert_eq!(counter.load(Ordering::Relaxed), 3);
  }

  #[tokio::test]
  async fn does_not_retry_data_quality() {
    let counter = AtomicUsize::new(0);
    let res: Result<u32, Error> = retry_async(
      |_| {
        counter.fetch_add(1, Ordering::Relaxed);
        async {
          Err(Error::DataQuality {
            symbol: "BAD".into(),
            max_abs_return: 90.0,
            threshold: 50.0,
          })
        }
      },
      5,
      Duration::from_millis(1),
    )
    .await;

    assert!(matches!(res, Err(Error::DataQuality { .. })));
    assert_eq!(counter.load(Ordering::Relaxed), 1);
  }
}
