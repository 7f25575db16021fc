//! Leaky-bucket limiter.
//!
//! The bucket fills by `tokens` on each accepted request and drains at a
//! constant `rate` per second. A full bucket rejects. Unlike the token
//! bucket this smooths traffic instead of allowing an up-front burst: the
//! bucket starts empty.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{
    decode_bucket, encode_bucket, reply_accepted, storage_key, KeyLocks, Limiter, LimiterStats,
};
use crate::clock::{system_clock, Clock};
use crate::error::Result;
use crate::metrics::{default_metrics, Metrics};
use crate::storage::Storage;

const KIND: &str = "leaky_bucket";

const ACQUIRE_SCRIPT: &str = r#"
local key = KEYS[1]
local leak_per_ms = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local tokens = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local t = redis.call('TIME')
local now = t[1] * 1000 + math.floor(t[2] / 1000)
local level = 0
local last = now
local cur = redis.call('GET', key)
if cur then
    local sep = string.find(cur, '|', 1, true)
    level = tonumber(string.sub(cur, 1, sep - 1))
    last = tonumber(string.sub(cur, sep + 1))
end
level = math.max(0, level - (now - last) * leak_per_ms)
local accepted = 0
if level + tokens <= capacity then
    level = level + tokens
    accepted = 1
end
redis.call('SET', key, level .. '|' .. now, 'PX', ttl)
return accepted
"#;

const RELEASE_SCRIPT: &str = r#"
local key = KEYS[1]
local tokens = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
local cur = redis.call('GET', key)
if not cur then
    return 0
end
local sep = string.find(cur, '|', 1, true)
local level = tonumber(string.sub(cur, 1, sep - 1))
local last = string.sub(cur, sep + 1)
level = math.max(0, level - tokens)
redis.call('SET', key, level .. '|' .. last, 'PX', ttl)
return 1
"#;

pub struct LeakyBucket {
    rate: f64,
    capacity: f64,
    scope: String,
    leak_per_ms: f64,
    idle_ttl: Duration,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    locks: KeyLocks,
    scripted: bool,
}

impl LeakyBucket {
    /// Leak `rate` tokens per second out of a bucket holding `capacity`.
    pub fn new(rate: f64, capacity: f64, storage: Arc<dyn Storage>) -> Self {
        let leak_per_ms = rate / 1000.0;
        // A full bucket fully drains within capacity/rate seconds; keep the
        // key around twice that long.
        let idle_ttl = Duration::from_millis(((capacity / leak_per_ms) * 2.0).max(1_000.0) as u64);
        let scripted = storage.supports_scripts();
        Self {
            rate,
            capacity,
            scope: "default".to_string(),
            leak_per_ms,
            idle_ttl,
            storage,
            clock: system_clock(),
            metrics: default_metrics(),
            locks: KeyLocks::new(),
            scripted,
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

    fn record(&self, accepted: bool, level: Option<f64>) {
        let outcome = if accepted { "accepted" } else { "rejected" };
        self.metrics
            .incr(&format!("limiter.{}.{outcome}", self.scope), 1);
        if let Some(level) = level {
            self.metrics
                .gauge(&format!("limiter.{}.level", self.scope), level);
        }
    }
}

#[async_trait]
impl Limiter for LeakyBucket {
    async fn acquire(&self, key: &str, tokens: f64) -> Result<bool> {
        let full_key = storage_key(&self.scope, KIND, key);

        if self.scripted {
            let reply = self
                .storage
                .eval_script(
                    ACQUIRE_SCRIPT,
                    &[&full_key],
                    &[
                        json!(self.leak_per_ms),
                        json!(self.capacity),
                        json!(tokens),
                        json!(self.idle_ttl.as_millis() as u64),
                    ],
                )
                .await?;
            let accepted = reply_accepted(&reply);
            self.record(accepted, None);
            return Ok(accepted);
        }

        let lock = self.locks.lock_for(&full_key);
        let _guard = lock.lock().await;

        let now = self.clock.now_ms();
        let (level, last) = match self.storage.get(&full_key).await? {
            Some(value) => decode_bucket(&value)?,
            None => (0.0, now),
        };
        let drained =
            (level - now.saturating_sub(last) as f64 * self.leak_per_ms).max(0.0);

        let (updated, accepted) = if drained + tokens <= self.capacity {
            (drained + tokens, true)
        } else {
            (drained, false)
        };
        self.storage
            .set(&full_key, encode_bucket(updated, now), Some(self.idle_ttl))
            .await?;
        self.record(accepted, Some(updated));
        Ok(accepted)
    }

    /// Force part of the level out, ahead of the natural leak.
    async fn release(&self, key: &str, tokens: f64) -> Result<()> {
        let full_key = storage_key(&self.scope, KIND, key);

        if self.scripted {
            self.storage
                .eval_script(
                    RELEASE_SCRIPT,
                    &[&full_key],
                    &[json!(tokens), json!(self.idle_ttl.as_millis() as u64)],
                )
                .await?;
            return Ok(());
        }

        let lock = self.locks.lock_for(&full_key);
        let _guard = lock.lock().await;
        if let Some(value) = self.storage.get(&full_key).await? {
            let (level, last) = decode_bucket(&value)?;
            let updated = (level - tokens).max(0.0);
            self.storage
                .set(&full_key, encode_bucket(updated, last), Some(self.idle_ttl))
                .await?;
        }
        Ok(())
    }

    async fn stats(&self, key: &str) -> Result<LimiterStats> {
        let full_key = storage_key(&self.scope, KIND, key);
        let now = self.clock.now_ms();
        let (level, last) = match self.storage.get(&full_key).await? {
            Some(value) => decode_bucket(&value)?,
            None => (0.0, now),
        };
        let current = (level - now.saturating_sub(last) as f64 * self.leak_per_ms).max(0.0);
        Ok(LimiterStats {
            available: (self.capacity - current).max(0.0),
            max: self.capacity,
            rate: self.rate,
            last_update_ms: last,
        })
    }
}
