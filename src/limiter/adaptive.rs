//! Adaptive limiter: additive-increase, multiplicative-decrease.
//!
//! Tracks success/error reports from callers and retunes its admission rate
//! once per window: too many errors → multiply the rate down; otherwise add
//! `increase_step`. Admission itself is a token-bucket check at the current
//! rate with `burst = rate`. All state is instance-local; this limiter
//! adapts to what *this* process observes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Limiter, LimiterStats};
use crate::clock::{system_clock, Clock};
use crate::error::Result;
use crate::metrics::{default_metrics, Metrics};

#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub initial_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    pub increase_step: f64,
    /// Multiplier in (0, 1) applied when the error rate crosses the
    /// threshold.
    pub decrease_factor: f64,
    /// Error fraction in [0, 1] above which the rate is cut.
    pub error_threshold: f64,
    pub window: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            initial_rate: 100.0,
            min_rate: 10.0,
            max_rate: 1_000.0,
            increase_step: 1.0,
            decrease_factor: 0.5,
            error_threshold: 0.1,
            window: Duration::from_secs(60),
        }
    }
}

struct AdaptiveState {
    current_rate: f64,
    tokens: f64,
    last_refill: u64,
    successes: u64,
    errors: u64,
    window_start: u64,
}

pub struct AdaptiveLimiter {
    config: AdaptiveConfig,
    window_ms: u64,
    state: Mutex<AdaptiveState>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl AdaptiveLimiter {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: AdaptiveConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        let state = AdaptiveState {
            current_rate: config.initial_rate,
            tokens: config.initial_rate,
            last_refill: now,
            successes: 0,
            errors: 0,
            window_start: now,
        };
        Self {
            window_ms: config.window.as_millis().max(1) as u64,
            config,
            state: Mutex::new(state),
            clock,
            metrics: default_metrics(),
        }
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Tell the limiter the guarded call went through.
    pub fn report_success(&self) {
        let mut state = self.state.lock();
        state.successes += 1;
        self.adjust(&mut state);
    }

    /// Tell the limiter the guarded call failed downstream.
    pub fn report_error(&self) {
        let mut state = self.state.lock();
        state.errors += 1;
        self.adjust(&mut state);
    }

    pub fn current_rate(&self) -> f64 {
        self.state.lock().current_rate
    }

    /// Once per window: compare the error fraction against the threshold
    /// and move the rate. A quiet window counts as healthy and increases
    /// the rate by exactly `increase_step`.
    fn adjust(&self, state: &mut AdaptiveState) {
        let now = self.clock.now_ms();
        if now.saturating_sub(state.window_start) < self.window_ms {
            return;
        }

        let total = state.successes + state.errors;
        let error_rate = state.errors as f64 / (total.max(1)) as f64;

        if error_rate > self.config.error_threshold {
            state.current_rate =
                (state.current_rate * self.config.decrease_factor).max(self.config.min_rate);
        } else {
            state.current_rate =
                (state.current_rate + self.config.increase_step).min(self.config.max_rate);
        }
        self.metrics.gauge("limiter.adaptive.rate", state.current_rate);

        state.successes = 0;
        state.errors = 0;
        state.window_start = now;
    }
}

#[async_trait]
impl Limiter for AdaptiveLimiter {
    async fn acquire(&self, _key: &str, tokens: f64) -> Result<bool> {
        let mut state = self.state.lock();
        self.adjust(&mut state);

        let now = self.clock.now_ms();
        let rate_per_ms = state.current_rate / 1000.0;
        state.tokens = (state.tokens
            + now.saturating_sub(state.last_refill) as f64 * rate_per_ms)
            .min(state.current_rate);
        state.last_refill = now;

        let accepted = state.tokens >= tokens;
        if accepted {
            state.tokens -= tokens;
            self.metrics.incr("limiter.adaptive.accepted", 1);
        } else {
            self.metrics.incr("limiter.adaptive.rejected", 1);
        }
        Ok(accepted)
    }

    async fn release(&self, _key: &str, tokens: f64) -> Result<()> {
        let mut state = self.state.lock();
        state.tokens = (state.tokens + tokens).min(state.current_rate);
        Ok(())
    }

    async fn stats(&self, _key: &str) -> Result<LimiterStats> {
        let state = self.state.lock();
        Ok(LimiterStats {
            available: state.tokens,
            max: state.current_rate,
            rate: state.current_rate,
            last_update_ms: state.last_refill,
        })
    }
}
