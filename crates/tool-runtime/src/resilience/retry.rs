//! Retry with backoff for a single tool attempt.
//!
//! Only network, timeout, rate-limited, upstream 5xx and transient failures
//! are retried. Validation and authorization errors fail on the first
//! attempt. When attempts run out the last error is returned unchanged.

use crate::tool::ToolError;
use relay_core::config::{BackoffStrategy, RetryConfig};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retries).
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor for exponential backoff.
    pub multiplier: f64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            max_attempts: c.max_attempts.max(1),
            backoff: c.backoff,
            initial_delay: Duration::from_millis(c.initial_delay_ms),
            max_delay: Duration::from_millis(c.max_delay_ms),
            multiplier: c.multiplier,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// What a retried operation produced and how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ToolError>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the retry that follows the `failed`-th failed attempt (1-based).
    pub fn delay_for_attempt(&self, failed: u32) -> Duration {
        let n = failed.max(1);
        let base = self.initial_delay.as_secs_f64();
        let secs = match self.backoff {
            BackoffStrategy::Exponential => base * self.multiplier.powi(n as i32 - 1),
            BackoffStrategy::Linear => base * n as f64,
            BackoffStrategy::Fixed => base,
        };
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ToolError>>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(e) if e.is_retryable() && attempt < max => {
                    let mut delay = self.delay_for_attempt(attempt);
                    if let Some(hint) = e.retry_after() {
                        delay = delay.max(hint).min(self.max_delay);
                    }
                    warn!(
                        tool = label,
                        attempt,
                        max_attempts = max,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying tool call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(backoff: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
        }
    }

    #[test]
    fn backoff_strategies() {
        let exp = policy(BackoffStrategy::Exponential);
        assert_eq!(exp.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(exp.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(exp.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(exp.delay_for_attempt(10), Duration::from_millis(1_000));

        let lin = policy(BackoffStrategy::Linear);
        assert_eq!(lin.delay_for_attempt(3), Duration::from_millis(300));

        let fixed = policy(BackoffStrategy::Fixed);
        assert_eq!(fixed.delay_for_attempt(1), fixed.delay_for_attempt(5));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let outcome = policy(BackoffStrategy::Exponential)
            .run("crm.sync", move |_| async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(ToolError::Network(format!("reset #{n}")))
                } else {
                    Ok("done")
                }
            })
            .await;
        assert_eq!(outcome.result.unwrap(), "done");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_is_never_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let outcome: RetryOutcome<()> = policy(BackoffStrategy::Exponential)
            .run("crm.sync", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ToolError::InvalidInput("missing id".into()))
            })
            .await;
        assert!(matches!(outcome.result, Err(ToolError::InvalidInput(_))));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let outcome: RetryOutcome<()> = policy(BackoffStrategy::Fixed)
            .run("crm.sync", |attempt| async move {
                Err(ToolError::Upstream {
                    status: 503,
                    message: format!("attempt {attempt}"),
                })
            })
            .await;
        assert_eq!(outcome.attempts, 3);
        match outcome.result {
            Err(ToolError::Upstream { status, message }) => {
                assert_eq!(status, 503);
                assert_eq!(message, "attempt 3");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_extends_delay() {
        let start = tokio::time::Instant::now();
        let outcome = policy(BackoffStrategy::Fixed)
            .run("mail.send", |attempt| async move {
                if attempt == 1 {
                    Err(ToolError::RateLimited {
                        retry_after: Some(Duration::from_millis(700)),
                    })
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(outcome.result.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(700));
    }

    #[test]
    fn from_config_clamps_attempts() {
        let cfg = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert_eq!(RetryPolicy::from(&cfg).max_attempts, 1);
    }
}
