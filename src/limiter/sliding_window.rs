//! Sliding-window limiter.
//!
//! Keeps the actual event instants, so the limit is exact over any window
//! position. Locally the window is a sorted vector per key; against Redis
//! it is a sorted set pruned by score inside one script.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use super::{reply_accepted, storage_key, Limiter, LimiterStats};
use crate::clock::{system_clock, Clock};
use crate::error::Result;
use crate::metrics::{default_metrics, Metrics};
use crate::storage::Storage;

const KIND: &str = "sliding_window";

/// Prune, count, admit: one indivisible step at the server. The nonce keeps
/// members unique when several events land in the same millisecond.
const ACQUIRE_SCRIPT: &str = r#"
local key = KEYS[1]
local per = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local tokens = tonumber(ARGV[3])
local nonce = ARGV[4]
local t = redis.call('TIME')
local now = t[1] * 1000 + math.floor(t[2] / 1000)
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - per)
local count = redis.call('ZCARD', key)
if count + tokens <= rate then
    for i = 1, tokens do
        redis.call('ZADD', key, now, nonce .. '-' .. i)
    end
    redis.call('PEXPIRE', key, per * 2)
    return 1
end
return 0
"#;

const COUNT_SCRIPT: &str = r#"
local key = KEYS[1]
local per = tonumber(ARGV[1])
local t = redis.call('TIME')
local now = t[1] * 1000 + math.floor(t[2] / 1000)
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - per)
return redis.call('ZCARD', key)
"#;

pub struct SlidingWindow {
    rate: f64,
    per_ms: u64,
    scope: String,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    scripted: bool,
    nonce: AtomicU64,
    windows: Mutex<AHashMap<String, Vec<u64>>>,
}

impl SlidingWindow {
    /// At most `rate` events per `per` window.
    pub fn new(rate: f64, per: Duration, storage: Arc<dyn Storage>) -> Self {
        let scripted = storage.supports_scripts();
        Self {
            rate,
            per_ms: per.as_millis().max(1) as u64,
            scope: "default".to_string(),
            storage,
            clock: system_clock(),
            metrics: default_metrics(),
            scripted,
            nonce: AtomicU64::new(0),
            windows: Mutex::new(AHashMap::new()),
        }
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    fn record(&self, accepted: bool) {
        let outcome = if accepted { "accepted" } else { "rejected" };
        self.metrics
            .incr(&format!("limiter.{}.{outcome}", self.scope), 1);
    }

    fn acquire_local(&self, full_key: &str, tokens: u64) -> bool {
        let now = self.clock.now_ms();
        let cutoff = now.saturating_sub(self.per_ms);
        let mut windows = self.windows.lock();
        let window = windows.entry(full_key.to_string()).or_default();

        // Drop instants that fell out of the window (the vector is sorted).
        // The cutoff itself is evicted, matching ZREMRANGEBYSCORE's
        // inclusive range on the scripted path.
        let stale = window.partition_point(|&t| t <= cutoff);
        window.drain(..stale);

        if window.len() as u64 + tokens <= self.rate as u64 {
            for _ in 0..tokens {
                window.push(now);
            }
            true
        } else {
            false
        }
    }

    fn count_local(&self, full_key: &str) -> usize {
        let now = self.clock.now_ms();
        let cutoff = now.saturating_sub(self.per_ms);
        let mut windows = self.windows.lock();
        match windows.get_mut(full_key) {
            Some(window) => {
                let stale = window.partition_point(|&t| t <= cutoff);
                window.drain(..stale);
                window.len()
            }
            None => 0,
        }
    }
}

#[async_trait]
impl Limiter for SlidingWindow {
    async fn acquire(&self, key: &str, tokens: f64) -> Result<bool> {
        let full_key = storage_key(&self.scope, KIND, key);
        let tokens = tokens.max(1.0) as u64;

        let accepted = if self.scripted {
            let nonce = format!(
                "{}-{}",
                self.clock.now_ms(),
                self.nonce.fetch_add(1, Ordering::Relaxed)
            );
            let reply = self
                .storage
                .eval_script(
                    ACQUIRE_SCRIPT,
                    &[&full_key],
                    &[
                        json!(self.per_ms),
                        json!(self.rate),
                        json!(tokens),
                        json!(nonce),
                    ],
                )
                .await?;
            reply_accepted(&reply)
        } else {
            self.acquire_local(&full_key, tokens)
        };

        self.record(accepted);
        Ok(accepted)
    }

    /// Window entries age out on their own; there is nothing to credit back.
    async fn release(&self, _key: &str, _tokens: f64) -> Result<()> {
        Ok(())
    }

    async fn stats(&self, key: &str) -> Result<LimiterStats> {
        let full_key = storage_key(&self.scope, KIND, key);
        let count = if self.scripted {
            let reply = self
                .storage
                .eval_script(COUNT_SCRIPT, &[&full_key], &[json!(self.per_ms)])
                .await?;
            reply.as_f64().unwrap_or(0.0)
        } else {
            self.count_local(&full_key) as f64
        };
        Ok(LimiterStats {
            available: (self.rate - count).max(0.0),
            max: self.rate,
            rate: self.rate / (self.per_ms as f64 / 1000.0),
            last_update_ms: self.clock.now_ms(),
        })
    }
}
