/// Bounded-retry executor for external calls
///
/// Every quote, position, order and document call goes through here.
/// Exponential delay with a hard cap; non-retryable errors surface on the
/// first attempt. Exhausting the attempts hands the last error back to
/// the calling tick, which logs and aborts that instrument only.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{BrokerError, BrokerResult};

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(30_000),
        }
    }
}

impl BackoffPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << (attempt - 1).min(16));
        exp.min(self.cap)
    }
}

pub async fn with_backoff<T, F, Fut>(name: &str, f: F) -> BrokerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BrokerResult<T>>,
{
    with_backoff_policy(name, BackoffPolicy::default(), f).await
}

pub async fn with_backoff_policy<T, F, Fut>(
    name: &str,
    policy: BackoffPolicy,
    mut f: F,
) -> BrokerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BrokerResult<T>>,
{
    let mut attempt = 1u32;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(err) if !err.is_retryable() || attempt >= policy.retries => return Err(err),
            Err(err) => {
                let delay = policy.delay(attempt);
                warn!(task = name, attempt, %err, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> BackoffPolicy {
        BackoffPolicy {
            retries: 5,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = with_backoff_policy("quote:test", fast(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BrokerError::Network("flaky".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let out: BrokerResult<()> = with_backoff_policy("order:test", fast(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::InvalidOrder("qty=0".to_string())) }
        })
        .await;
        assert!(matches!(out, Err(BrokerError::InvalidOrder(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let out: BrokerResult<()> = with_backoff_policy("quote:test", fast(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::Network("still down".to_string())) }
        })
        .await;
        assert!(matches!(out, Err(BrokerError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(1000));
        assert_eq!(policy.delay(2), Duration::from_millis(2000));
        assert_eq!(policy.delay(6), Duration::from_millis(30_000));
        assert_eq!(policy.delay(20), Duration::from_millis(30_000));
    }
}
