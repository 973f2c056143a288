use std::future::Future;
use std::time::Duration;

use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};

use crate::config::Policy;
use crate::error::{StandError, StandResult};

static MAX_DELAY: Duration = Duration::from_secs(1);

/// Delays between attempts: `retry_base`, doubling, jittered. Yields
/// `max_retries - 1` delays so the operation runs at most `max_retries` times.
pub fn backoff(policy: &Policy) -> impl Iterator<Item = Duration> + Send + use<> {
  let factor = (policy.retry_base.as_millis() as u64 / 2).max(1);
  ExponentialBackoff::from_millis(2)
    .factor(factor)
    .max_delay(MAX_DELAY)
    .map(jitter)
    .take(policy.max_retries.saturating_sub(1))
}

/// Re-run `op` while it fails with a retryable error, then surface the last
/// error.
pub async fn on_conflict<T, F, Fut>(policy: &Policy, op: F) -> StandResult<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = StandResult<T>>,
{
  RetryIf::spawn(backoff(policy), op, |e: &StandError| e.is_retryable()).await
}

#[cfg(test)]
mod tests {
  use super::*;

  use std::sync::atomic::{AtomicUsize, Ordering};

  fn quick(max_retries: usize) -> Policy {
    Policy { max_retries, retry_base: Duration::from_millis(1), ..Policy::default() }
  }

  #[test]
  fn backoff_is_bounded_by_attempts() {
    assert_eq!(backoff(&quick(5)).count(), 4);
    assert_eq!(backoff(&quick(1)).count(), 0);
  }

  #[tokio::test]
  async fn conflict_is_retried_then_surfaced() {
    let calls = AtomicUsize::new(0);
    let result: StandResult<()> = on_conflict(&quick(3), || async {
      calls.fetch_add(1, Ordering::SeqCst);
      Err(StandError::Conflict)
    })
    .await;
    assert!(matches!(result, Err(StandError::Conflict)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn terminal_errors_are_not_retried() {
    let calls = AtomicUsize::new(0);
    let result: StandResult<()> = on_conflict(&quick(3), || async {
      calls.fetch_add(1, Ordering::SeqCst);
      Err(StandError::QueueEmpty)
    })
    .await;
    assert!(matches!(result, Err(StandError::QueueEmpty)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
