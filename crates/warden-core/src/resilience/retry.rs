use std::{future::Future, time::Duration};

use rand::Rng;
use tokio::time::sleep;

use crate::{errors::FailureClass, Result};

/// Exponential backoff settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Upper bound of the random jitter, as a fraction of the computed delay.
const MAX_JITTER: f64 = 0.3;

impl RetryPolicy {
    /// `min(base * 2^attempt, max)` without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        let jitter = rand::thread_rng().gen_range(0.0..=MAX_JITTER);
        delay + delay.mul_f64(jitter)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    ///
    /// Rate-limit failures wait exactly the server-provided hint when there is one.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            let err = match op().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            attempt += 1;

            let delay = match err.classify() {
                FailureClass::PermissionDenied | FailureClass::NonRetryable => return Err(err),
                _ if attempt >= max_attempts => {
                    tracing::warn!(op = label, attempts = attempt, error = %err, "giving up after retries");
                    return Err(err);
                }
                FailureClass::RateLimited(Some(hint)) => hint,
                FailureClass::RateLimited(None) | FailureClass::Retryable => {
                    self.backoff_with_jitter(attempt - 1)
                }
            };

            tracing::debug!(op = label, attempt, ?delay, error = %err, "retrying");
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(800));
        assert_eq!(p.backoff(4), Duration::from_millis(1000));
        assert_eq!(p.backoff(40), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_within_thirty_percent() {
        let p = policy();
        for _ in 0..200 {
            let d = p.backoff_with_jitter(1);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(260));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn honours_rate_limit_hint_exactly() {
        let calls = &AtomicU32::new(0);
        let started = Instant::now();

        let out = policy()
            .run("test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::RateLimited {
                        retry_after: Some(Duration::from_millis(1234)),
                        message: "429".into(),
                    })
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // No backoff or jitter on top of the hint (timer resolution is 1ms).
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(1234));
        assert!(waited < Duration::from_millis(1236));
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denied_is_never_retried() {
        let calls = &AtomicU32::new(0);
        let err = policy()
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Permission("no rights".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Permission(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_attempts_and_return_last_error() {
        let calls = &AtomicU32::new(0);
        let err = policy()
            .run("test", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Transient(format!("blip {n}")))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(err, Error::Transient(ref m) if m == "blip 3"));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let calls = &AtomicU32::new(0);
        let started = Instant::now();
        let out = policy()
            .run("test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Transient("reset".into()))
                } else {
                    Ok("ok")
                }
            })
            .await
            .unwrap();

        assert_eq!(out, "ok");
        // 100ms + 200ms, each with up to 30% jitter.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(300));
        assert!(waited <= Duration::from_millis(392));
    }
}
