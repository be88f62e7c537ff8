//! Bounded retry with backoff for transport operations.
//!
//! Only errors for which [`ConductorError::is_retryable`] holds are retried.
//! Structural, transition, and integrity errors are returned on first sight.

use std::future::Future;
use std::time::Duration;

use conductor_types::{ConductorError, Result};

/// Delay between retry attempts.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    Fixed(Duration),
    /// base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    None,
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.min(31) as u32);
                base.saturating_mul(factor).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(200),
            max: Duration::from_secs(10),
        }
    }
}

/// Run `f` up to `max_retries + 1` times while it fails with a retryable error.
///
/// The last error is returned once retries are exhausted, so callers can
/// escalate it through the signal mailbox.
pub async fn with_retry<T, F, Fut>(
    f: F,
    max_retries: usize,
    policy: &BackoffPolicy,
    operation: &str,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "Transport error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::warn!(operation, attempts = attempt + 1, "Retries exhausted");
                }
                return Err(e);
            }
        }
    }
}

/// Convenience for the common "retryable or not" question on foreign errors.
pub fn is_transient(err: &ConductorError) -> bool {
    err.is_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn transport() -> ConductorError {
        ConductorError::transport("queue", "connection refused")
    }

    #[tokio::test]
    async fn success_on_first_try() {
        let result = with_retry(|| async { Ok::<_, ConductorError>(7) }, 3, &BackoffPolicy::None, "send").await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn transport_error_is_retried_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let result = with_retry(
            move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transport())
                    } else {
                        Ok("sent")
                    }
                }
            },
            3,
            &BackoffPolicy::None,
            "send",
        )
        .await;
        assert_eq!(result.unwrap(), "sent");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_transport_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let result: Result<()> = with_retry(
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(transport())
                }
            },
            2,
            &BackoffPolicy::Fixed(Duration::from_millis(1)),
            "send",
        )
        .await;
        assert_eq!(result.unwrap_err().kind(), "transport_error");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let result: Result<()> = with_retry(
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ConductorError::Integrity("hash mismatch".into()))
                }
            },
            5,
            &BackoffPolicy::None,
            "send",
        )
        .await;
        assert!(result.unwrap_err().is_integrity());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!is_transient(&ConductorError::Other("x".into())));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_millis(500));
        assert_eq!(BackoffPolicy::None.delay_for_attempt(9), Duration::ZERO);
    }
}
