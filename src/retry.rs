//! Bounded exponential backoff with jitter and error classification.
//!
//! | Failure                    | Behavior                                        |
//! |----------------------------|-------------------------------------------------|
//! | 4xx (not 401/429)          | returned immediately                            |
//! | 401                        | one credential refresh, then one extra attempt  |
//! | 429                        | waits for the `Retry-After` hint, else backoff  |
//! | 5xx, timeout, connection   | retried up to `max_retries`                     |

use crate::error::{ErrorClass, LifelineError, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound of the uniform jitter added to each delay.
    pub jitter_ms: u64,
    /// Timeout of the first attempt; attempt `n` gets `n + 1` times this.
    pub attempt_timeout_ms: u64,
    pub max_attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ms: 1_000,
            attempt_timeout_ms: 10_000,
            max_attempt_timeout_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^attempt + uniform(0, jitter), max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_add(jitter).min(self.max_delay_ms))
    }

    pub fn attempt_timeout(&self, attempt: u32) -> Duration {
        let ms = self
            .attempt_timeout_ms
            .saturating_mul(attempt as u64 + 1)
            .min(self.max_attempt_timeout_ms.max(self.attempt_timeout_ms));
        Duration::from_millis(ms)
    }

    /// Upper bound on the total time spent sleeping between attempts.
    pub fn max_total_wait(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.saturating_mul(self.max_retries as u64))
    }
}

/// Obtains fresh credentials after a 401.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self) -> Result<()>;
}

/// Per-attempt information handed to the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptContext {
    /// Zero-based attempt index within the retry budget.
    pub attempt: u32,
    pub timeout: Duration,
    /// True for the extra attempt made after a credential refresh.
    pub after_refresh: bool,
}

#[derive(Clone, Default)]
pub struct RetryExecutor {
    refresher: Option<Arc<dyn CredentialRefresher>>,
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self { refresher: None }
    }

    pub fn with_refresher(refresher: Arc<dyn CredentialRefresher>) -> Self {
        Self {
            refresher: Some(refresher),
        }
    }

    /// Run `operation` under `policy`. The final classified error is returned
    /// unchanged once the policy is exhausted.
    pub async fn execute<T, F, Fut>(&self, policy: &RetryPolicy, mut operation: F) -> Result<T>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        let mut refreshed = false;
        let mut after_refresh = false;

        loop {
            let ctx = AttemptContext {
                attempt,
                timeout: policy.attempt_timeout(attempt),
                after_refresh,
            };
            let outcome = match tokio::time::timeout(ctx.timeout, operation(ctx)).await {
                Ok(res) => res,
                Err(_) => Err(LifelineError::Timeout {
                    after_ms: ctx.timeout.as_millis() as u64,
                    message: format!("attempt {} exceeded its deadline", attempt + 1),
                }),
            };
            after_refresh = false;

            let err = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!("[RETRY] succeeded on attempt {}", attempt + 1);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let wait = match err.classify() {
                ErrorClass::NonRetryable => {
                    tracing::debug!("[RETRY] non-retryable failure: {}", err);
                    return Err(err);
                }
                ErrorClass::Auth => {
                    let refresher = match (&self.refresher, refreshed) {
                        (Some(r), false) => r,
                        _ => return Err(err),
                    };
                    refreshed = true;
                    tracing::info!("[RETRY] 401 received, refreshing credentials");
                    if let Err(refresh_err) = refresher.refresh().await {
                        tracing::warn!("[RETRY] credential refresh failed: {}", refresh_err);
                        return Err(err);
                    }
                    after_refresh = true;
                    continue;
                }
                ErrorClass::RateLimited(hint) => {
                    if attempt >= policy.max_retries {
                        return Err(err);
                    }
                    let cap = Duration::from_millis(policy.max_delay_ms);
                    hint.map(|h| h.min(cap))
                        .unwrap_or_else(|| policy.backoff_delay(attempt))
                }
                ErrorClass::Retryable => {
                    if attempt >= policy.max_retries {
                        tracing::warn!(
                            "[RETRY] giving up after {} attempts: {}",
                            attempt + 1,
                            err
                        );
                        return Err(err);
                    }
                    policy.backoff_delay(attempt)
                }
            };

            tracing::debug!(
                "[RETRY] attempt {} failed ({}), waiting {}ms",
                attempt + 1,
                err,
                wait.as_millis()
            );
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 10,
            max_delay_ms: 50,
            jitter_ms: 0,
            ..RetryPolicy::default()
        }
    }

    struct CountingRefresher {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl CredentialRefresher for CountingRefresher {
        async fn refresh(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(LifelineError::Auth("refresh rejected".into()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
            jitter_ms: 1_000,
            ..RetryPolicy::default()
        };
        for attempt in 0..10 {
            assert!(policy.backoff_delay(attempt) <= Duration::from_millis(5_000));
        }
        let first = policy.backoff_delay(0);
        assert!(first >= Duration::from_millis(1_000) && first <= Duration::from_millis(2_000));
    }

    #[test]
    fn test_attempt_timeouts_escalate() {
        let policy = RetryPolicy {
            attempt_timeout_ms: 1_000,
            max_attempt_timeout_ms: 2_500,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.attempt_timeout(0), Duration::from_millis(1_000));
        assert_eq!(policy.attempt_timeout(1), Duration::from_millis(2_000));
        assert_eq!(policy.attempt_timeout(5), Duration::from_millis(2_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_max_retries_plus_one() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new();
        let res: Result<()> = executor
            .execute(&fast_policy(3), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(LifelineError::Network("connection refused".into())) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            res.unwrap_err(),
            LifelineError::Network("connection refused".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_wait_is_bounded() {
        let policy = fast_policy(4);
        let started = tokio::time::Instant::now();
        let _: Result<()> = RetryExecutor::new()
            .execute(&policy, |_| async {
                Err(LifelineError::Server {
                    status: 502,
                    message: "bad gateway".into(),
                })
            })
            .await;
        assert!(started.elapsed() <= policy.max_total_wait());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_fails_immediately() {
        let calls = AtomicU32::new(0);
        let res: Result<()> = RetryExecutor::new()
            .execute(&fast_policy(5), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(LifelineError::Client {
                        status: 422,
                        message: "invalid".into(),
                    })
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(res, Err(LifelineError::Client { status: 422, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let res = RetryExecutor::new()
            .execute(&fast_policy(3), |ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if ctx.attempt < 2 {
                        Err(LifelineError::Timeout {
                            after_ms: 10,
                            message: "slow".into(),
                        })
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(res.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_refreshes_once_outside_budget() {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let executor = RetryExecutor::with_refresher(refresher.clone());
        let calls = AtomicU32::new(0);

        let res = executor
            .execute(&fast_policy(0), |ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if ctx.after_refresh {
                        Ok(42)
                    } else {
                        Err(LifelineError::Auth("token expired".into()))
                    }
                }
            })
            .await;

        assert_eq!(res.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_auth_failure_is_surfaced() {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let executor = RetryExecutor::with_refresher(refresher.clone());
        let res: Result<()> = executor
            .execute(&fast_policy(3), |_| async {
                Err(LifelineError::Auth("still expired".into()))
            })
            .await;
        assert!(matches!(res, Err(LifelineError::Auth(_))));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_returns_original_error() {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicU32::new(0),
            fail: true,
        });
        let res: Result<()> = RetryExecutor::with_refresher(refresher)
            .execute(&fast_policy(3), |_| async {
                Err(LifelineError::Auth("token expired".into()))
            })
            .await;
        assert_eq!(res.unwrap_err(), LifelineError::Auth("token expired".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_honors_retry_after() {
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay_ms: 1,
            max_delay_ms: 10_000,
            jitter_ms: 0,
            ..RetryPolicy::default()
        };
        let started = tokio::time::Instant::now();
        let res = RetryExecutor::new()
            .execute(&policy, |ctx| async move {
                if ctx.attempt == 0 {
                    Err(LifelineError::RateLimited {
                        retry_after: Some(Duration::from_secs(3)),
                        message: "slow down".into(),
                    })
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(res.is_ok());
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out() {
        let policy = RetryPolicy {
            max_retries: 0,
            attempt_timeout_ms: 100,
            ..fast_policy(0)
        };
        let res: Result<()> = RetryExecutor::new()
            .execute(&policy, |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(LifelineError::Timeout { after_ms: 100, .. })));
    }
}
