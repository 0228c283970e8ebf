//! Bounded provider calls with capped exponential backoff

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::SyncConfig;
use crate::storage::{StorageError, StorageResult};

/// Bound one provider call by `timeout`
pub async fn bounded<T, Fut>(timeout: Duration, call: Fut) -> StorageResult<T>
where
    Fut: Future<Output = StorageResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Unavailable(format!(
            "provider call timed out after {:?}",
            timeout
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_sync(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out
    ///
    /// Only `Unavailable` errors (including timeouts) are retried. Returns
    /// the last result with the number of attempts made.
    pub async fn run<T, F, Fut>(&self, timeout: Duration, mut call: F) -> (StorageResult<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match bounded(timeout, call()).await {
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "Provider call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return (other, attempt),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        };
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(4), Duration::from_millis(800));
        assert_eq!(p.delay(5), Duration::from_millis(1000));
        assert_eq!(p.delay(40), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_retries_only_unavailable() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (result, attempts) = policy(5)
            .run(Duration::from_secs(1), move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StorageError::Unavailable("flaky".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(attempts, 3);

        let (result, attempts) = policy(5)
            .run(Duration::from_secs(1), || async {
                Err::<(), _>(StorageError::NotFound("k".into()))
            })
            .await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (result, attempts) = policy(3)
            .run(Duration::from_secs(1), || async {
                Err::<(), _>(StorageError::Unavailable("down".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_timeout_is_unavailable() {
        let result: StorageResult<()> = bounded(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(StorageError::Unavailable(_))));
    }
}
