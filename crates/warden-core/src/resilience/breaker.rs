use std::{future::Future, sync::Mutex, time::Duration};

use tokio::time::Instant;

use crate::{errors::FailureClass, Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is allowed.
    pub cooldown: Duration,
    /// Consecutive successful probes that close the circuit again.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Consecutive-failure circuit breaker.
///
/// Only failures that say something about the dependency's health (transient errors,
/// throttling) count; a permission denial or a rejected request means the dependency
/// answered.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    cfg: BreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            cfg,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Invoke `op` unless the circuit rejects the call.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut permit = self.acquire()?;
        let out = op().await;
        match &out {
            Err(e) if is_health_failure(e) => permit.record(false),
            _ => permit.record(true),
        }
        out
    }

    fn acquire(&self) -> Result<Permit<'_>> {
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                let cooled = st
                    .opened_at
                    .map(|at| at.elapsed() >= self.cfg.cooldown)
                    .unwrap_or(true);
                if !cooled {
                    return Err(Error::CircuitOpen(self.name.clone()));
                }
                st.state = CircuitState::HalfOpen;
                st.consecutive_successes = 0;
                st.probe_in_flight = true;
                tracing::info!(breaker = %self.name, "circuit half-open, probing");
                Ok(Permit::new(self, true))
            }
            CircuitState::HalfOpen => {
                if st.probe_in_flight {
                    return Err(Error::CircuitOpen(self.name.clone()));
                }
                st.probe_in_flight = true;
                Ok(Permit::new(self, true))
            }
        }
    }

    fn on_success(&self, probe: bool) {
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => st.consecutive_failures = 0,
            CircuitState::HalfOpen if probe => {
                st.probe_in_flight = false;
                st.consecutive_successes += 1;
                if st.consecutive_successes >= self.cfg.success_threshold {
                    st.state = CircuitState::Closed;
                    st.consecutive_failures = 0;
                    st.consecutive_successes = 0;
                    st.opened_at = None;
                    tracing::info!(breaker = %self.name, "circuit closed");
                }
            }
            // A call admitted before the circuit opened finished late; ignore it.
            _ => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => {
                st.consecutive_failures += 1;
                if st.consecutive_failures >= self.cfg.failure_threshold {
                    st.state = CircuitState::Open;
                    st.opened_at = Some(Instant::now());
                    tracing::error!(
                        breaker = %self.name,
                        failures = st.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen if probe => {
                st.state = CircuitState::Open;
                st.opened_at = Some(Instant::now());
                st.probe_in_flight = false;
                st.consecutive_successes = 0;
                tracing::warn!(breaker = %self.name, "probe failed, circuit re-opened");
            }
            _ => {}
        }
    }

    fn release_probe(&self) {
        self.lock().probe_in_flight = false;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        // State is always left consistent, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn is_health_failure(e: &Error) -> bool {
    matches!(
        e.classify(),
        FailureClass::Retryable | FailureClass::RateLimited(_)
    )
}

/// Admission ticket for one call; releases the probe slot if the call is cancelled.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    recorded: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            recorded: false,
        }
    }

    fn record(&mut self, ok: bool) {
        self.recorded = true;
        if ok {
            self.breaker.on_success(self.probe);
        } else {
            self.breaker.on_failure(self.probe);
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.recorded {
            self.breaker.release_probe();
        }
    }
}
