//! Circuit breaker.
//!
//! Closed → open after `failure_threshold` consecutive failures; open
//! rejects instantly for `timeout`; then half-open admits exactly one probe
//! whose outcome decides between closing and re-opening.

use std::sync::Arc;

use parking_lot::Mutex;
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::{system_clock, Clock};
use crate::metrics::{default_metrics, Metrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Error surface of a guarded call.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// Rejected without invoking the callable.
    #[error("circuit breaker is open")]
    Open,
    /// The callable ran and failed; the failure counted against the
    /// breaker.
    #[error("guarded call failed: {0}")]
    Inner(E),
}

struct State {
    state: BreakerState,
    failures: u32,
    opened_at_ms: u64,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    timeout: Duration,
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self::with_clock(failure_threshold, timeout, system_clock())
    }

    pub fn with_clock(failure_threshold: u32, timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            timeout,
            state: Mutex::new(State {
                state: BreakerState::Closed,
                failures: 0,
                opened_at_ms: 0,
                probe_in_flight: false,
            }),
            clock,
            metrics: default_metrics(),
        }
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn state(&self) -> BreakerState {
        self.state.lock().state
    }

    /// Run `f` through the breaker.
    pub async fn call<F, Fut, R, E>(&self, f: F) -> Result<R, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<R, E>>,
    {
        self.admit()?;
        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    fn admit<E>(&self) -> Result<(), BreakerError<E>> {
        let mut state = self.state.lock();
        match state.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let now = self.clock.now_ms();
                if now.saturating_sub(state.opened_at_ms) >= self.timeout.as_millis() as u64 {
                    state.state = BreakerState::HalfOpen;
                    state.probe_in_flight = true;
                    self.metrics.incr("breaker.half_open", 1);
                    Ok(())
                } else {
                    self.metrics.incr("breaker.rejected", 1);
                    Err(BreakerError::Open)
                }
            }
            BreakerState::HalfOpen => {
                if state.probe_in_flight {
                    self.metrics.incr("breaker.rejected", 1);
                    Err(BreakerError::Open)
                } else {
                    state.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        state.probe_in_flight = false;
        if state.state == BreakerState::HalfOpen {
            info!("circuit breaker closed after successful probe");
            self.metrics.incr("breaker.closed", 1);
        }
        state.state = BreakerState::Closed;
        state.failures = 0;
    }

    fn on_failure(&self) {
        let mut state = self.state.lock();
        state.probe_in_flight = false;
        state.failures += 1;

        let tripped = match state.state {
            // A failed probe re-opens immediately.
            BreakerState::HalfOpen => true,
            BreakerState::Closed => state.failures >= self.failure_threshold,
            BreakerState::Open => false,
        };
        if tripped {
            state.state = BreakerState::Open;
            state.opened_at_ms = self.clock.now_ms();
            warn!(failures = state.failures, "circuit breaker opened");
            self.metrics.incr("breaker.opened", 1);
        }
    }
}
