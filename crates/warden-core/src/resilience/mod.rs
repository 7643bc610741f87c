//! Retry-with-backoff and circuit breaking for calls to flaky dependencies
//! (the remote chat API and the relational store).

mod breaker;
mod chat;
mod retry;

use std::{future::Future, time::Duration};

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use chat::ResilientChat;
pub use retry::RetryPolicy;

use crate::{Error, Result};

/// Retry policy + circuit breaker + per-attempt timeout for one dependency.
///
/// Each attempt passes through the breaker, so an open circuit fails fast instead of
/// burning the retry budget.
#[derive(Debug)]
pub struct Resilience {
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    timeout: Option<Duration>,
}

impl Resilience {
    pub fn new(
        name: impl Into<String>,
        retry: RetryPolicy,
        breaker: BreakerConfig,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            retry,
            breaker: CircuitBreaker::new(name, breaker),
            timeout,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.timeout;
        self.retry
            .run(label, || {
                let fut = op();
                self.breaker.call(move || with_timeout(timeout, label, fut))
            })
            .await
    }
}

async fn with_timeout<T>(
    timeout: Option<Duration>,
    label: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    let Some(limit) = timeout else {
        return fut.await;
    };
    match tokio::time::timeout(limit, fut).await {
        Ok(out) => out,
        Err(_) => Err(Error::Transient(format!("{label} timed out after {limit:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn resilience(timeout: Option<Duration>) -> Resilience {
        Resilience::new(
            "dep",
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
            },
            BreakerConfig {
                failure_threshold: 2,
                cooldown: Duration::from_secs(60),
                success_threshold: 1,
            },
            timeout,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_stops_the_retry_loop() {
        let r = resilience(None);
        let calls = &AtomicU32::new(0);
        let err = r
            .run("op", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Transient("down".into()))
            })
            .await
            .unwrap_err();

        // Two real attempts trip the breaker; the third attempt is rejected.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(err, Error::CircuitOpen(_)));
        assert_eq!(r.breaker().state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_requests_are_neither_retried_nor_counted() {
        let r = resilience(None);
        let calls = &AtomicU32::new(0);
        for _ in 0..4 {
            let err = r
                .run("delete", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::External("Bad Request: message to delete not found".into()))
                })
                .await
                .unwrap_err();
            assert!(matches!(err, Error::External(_)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let err = r
            .run("upsert", || async { Err::<(), _>(Error::Store("constraint failed".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(r.breaker().state(), CircuitState::Closed);

        assert_eq!(r.run("send", || async { Ok(7) }).await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out_and_are_retried() {
        let r = resilience(Some(Duration::from_millis(50)));
        let calls = &AtomicU32::new(0);
        let out = r
            .run("op", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok(42)
            })
            .await
            .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
