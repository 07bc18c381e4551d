//! Retry and deadline helpers / 重试与超时
//!
//! Backoff is exponential from `base_delay`, capped at `max_delay`, with "equal jitter":
//! the actual sleep is drawn from the upper half of the current ceiling.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::StorageError;

/// Retry policy for idempotent remote calls / 幂等请求的重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Single attempt, never retries / 不重试
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Upper bound of the sleep after failed attempt `attempt` (1-based) / 退避上限
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Jittered sleep after failed attempt `attempt` / 带抖动的退避时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let millis = rand::thread_rng().gen_range(ceiling / 2..=ceiling);
        Duration::from_millis(millis)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out / 执行并按需重试
    ///
    /// Only [`StorageError::is_retryable`] failures are retried. `op` receives the 1-based
    /// attempt number. Sleeping between attempts is interrupted by `cancel`.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what,
                        attempt,
                        self.max_attempts,
                        delay,
                        e
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(StorageError::aborted(format!("{} cancelled", what)));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Race one remote call against a timeout and cancellation / 超时与取消
///
/// Timeout yields `Transient`, cancellation yields `Aborted`; the in-flight call is dropped
/// in both cases.
pub async fn with_deadline<T, Fut>(
    what: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    fut: Fut,
) -> Result<T, StorageError>
where
    Fut: Future<Output = Result<T, StorageError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StorageError::aborted(format!("{} cancelled", what))),
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(StorageError::transient(format!("{} timed out after {:?}", what, timeout))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_backoff_ceiling_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(200), Duration::from_secs(2));
        assert_eq!(policy.backoff_ceiling(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_ceiling(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_ceiling(3), Duration::from_millis(800));
        assert_eq!(policy.backoff_ceiling(5), Duration::from_secs(2));
        assert_eq!(policy.backoff_ceiling(64), Duration::from_secs(2));
    }

    #[test]
    fn test_delay_within_jitter_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 1..6 {
            let ceiling = policy.backoff_ceiling(attempt);
            let delay = policy.delay_for(attempt);
            assert!(delay <= ceiling);
            assert!(delay >= ceiling / 2);
        }
        assert_eq!(RetryPolicy::none().delay_for(1), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_run_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let result = fast_policy(4)
            .run("op", &token, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(StorageError::transient("blip"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let err = fast_policy(4)
            .run("op", &token, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(StorageError::unauthorized("denied")) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let err = fast_policy(3)
            .run("op", &token, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(StorageError::transient("down")) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_cancelled_while_backing_off() {
        let policy = RetryPolicy::new(5, Duration::from_secs(30), Duration::from_secs(30));
        let token = CancellationToken::new();
        token.cancel();
        let err = policy
            .run("op", &token, |_| async { Err::<(), _>(StorageError::transient("down")) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
    }

    #[tokio::test]
    async fn test_with_deadline_timeout_and_cancel() {
        let token = CancellationToken::new();
        let err = with_deadline("slow", Duration::from_millis(10), &token, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), StorageError>(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);

        token.cancel();
        let err = with_deadline("cancelled", Duration::from_secs(5), &token, async {
            Ok::<(), StorageError>(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
    }
}
