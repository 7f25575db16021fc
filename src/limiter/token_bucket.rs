//! Token bucket limiter.
//!
//! The bucket starts full at `burst` and refills continuously at
//! `rate / per` tokens per second. [`TokenBucket`] keeps its state in a
//! [`Storage`] backend so several processes can share one bucket;
//! [`QuickBucket`] is the storage-free in-process variant for hot paths.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use super::{
    decode_bucket, encode_bucket, reply_accepted, storage_key, KeyLocks, Limiter, LimiterStats,
};
use crate::clock::{system_clock, Clock};
use crate::error::Result;
use crate::metrics::{default_metrics, Metrics};
use crate::storage::Storage;

const KIND: &str = "token_bucket";

/// Acquire as one server-side step: load, refill against the server clock,
/// debit or reject, store back with an idle TTL.
const ACQUIRE_SCRIPT: &str = r#"
local key = KEYS[1]
local refill_per_ms = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local tokens = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local t = redis.call('TIME')
local now = t[1] * 1000 + math.floor(t[2] / 1000)
local balance = burst
local last = now
local cur = redis.call('GET', key)
if cur then
    local sep = string.find(cur, '|', 1, true)
    balance = tonumber(string.sub(cur, 1, sep - 1))
    last = tonumber(string.sub(cur, sep + 1))
end
balance = math.min(burst, balance + (now - last) * refill_per_ms)
local accepted = 0
if balance >= tokens then
    balance = balance - tokens
    accepted = 1
end
redis.call('SET', key, balance .. '|' .. now, 'PX', ttl)
return accepted
"#;

/// Release credits tokens without advancing the refill anchor.
const RELEASE_SCRIPT: &str = r#"
local key = KEYS[1]
local burst = tonumber(ARGV[1])
local tokens = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local cur = redis.call('GET', key)
if not cur then
    return 0
end
local sep = string.find(cur, '|', 1, true)
local balance = tonumber(string.sub(cur, 1, sep - 1))
local last = string.sub(cur, sep + 1)
balance = math.min(burst, balance + tokens)
redis.call('SET', key, balance .. '|' .. last, 'PX', ttl)
return 1
"#;

pub struct TokenBucket {
    rate: f64,
    per_ms: f64,
    burst: f64,
    scope: String,
    refill_per_ms: f64,
    idle_ttl: Duration,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    locks: KeyLocks,
    scripted: bool,
}

impl TokenBucket {
    /// `rate` tokens replenish every `per`; burst defaults to `rate`.
    pub fn new(rate: f64, per: Duration, storage: Arc<dyn Storage>) -> Self {
        let per_ms = per.as_millis().max(1) as f64;
        let refill_per_ms = rate / per_ms;
        // Idle buckets expire once they would have refilled twice over;
        // a re-created bucket starts full, which is the intended trade.
        let idle_ttl =
            Duration::from_millis(((rate / refill_per_ms) * 2.0).max(1_000.0) as u64);
        let scripted = storage.supports_scripts();
        Self {
            rate,
            per_ms,
            burst: rate,
            scope: "default".to_string(),
            refill_per_ms,
            idle_ttl,
            storage,
            clock: system_clock(),
            metrics: default_metrics(),
            locks: KeyLocks::new(),
            scripted,
        }
    }

    pub fn burst(mut self, burst: f64) -> Self {
        self.burst = burst;
        let refill_ms = (self.burst / self.refill_per_ms) * 2.0;
        self.idle_ttl = Duration::from_millis(refill_ms.max(1_000.0) as u64);
        self
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

    fn key(&self, key: &str) -> String {
        storage_key(&self.scope, KIND, key)
    }

    fn record(&self, accepted: bool, balance: Option<f64>) {
        let outcome = if accepted { "accepted" } else { "rejected" };
        self.metrics
            .incr(&format!("limiter.{}.{outcome}", self.scope), 1);
        if let Some(balance) = balance {
            self.metrics
                .gauge(&format!("limiter.{}.tokens", self.scope), balance);
        }
    }

    async fn acquire_scripted(&self, full_key: &str, tokens: f64) -> Result<bool> {
        let reply = self
            .storage
            .eval_script(
                ACQUIRE_SCRIPT,
                &[full_key],
                &[
                    json!(self.refill_per_ms),
                    json!(self.burst),
                    json!(tokens),
                    json!(self.idle_ttl.as_millis() as u64),
                ],
            )
            .await?;
        let accepted = reply_accepted(&reply);
        self.record(accepted, None);
        Ok(accepted)
    }

    async fn acquire_local(&self, full_key: &str, tokens: f64) -> Result<bool> {
        let lock = self.locks.lock_for(full_key);
        let _guard = lock.lock().await;

        let now = self.clock.now_ms();
        let (balance, last) = match self.storage.get(full_key).await? {
            Some(value) => decode_bucket(&value)?,
            None => (self.burst, now),
        };
        let refilled = (balance + now.saturating_sub(last) as f64 * self.refill_per_ms)
            .min(self.burst);

        let (updated, accepted) = if refilled >= tokens {
            (refilled - tokens, true)
        } else {
            (refilled, false)
        };
        self.storage
            .set(full_key, encode_bucket(updated, now), Some(self.idle_ttl))
            .await?;
        self.record(accepted, Some(updated));
        Ok(accepted)
    }
}

#[async_trait]
impl Limiter for TokenBucket {
    async fn acquire(&self, key: &str, tokens: f64) -> Result<bool> {
        let full_key = self.key(key);
        if self.scripted {
            self.acquire_scripted(&full_key, tokens).await
        } else {
            self.acquire_local(&full_key, tokens).await
        }
    }

    async fn release(&self, key: &str, tokens: f64) -> Result<()> {
        let full_key = self.key(key);
        if self.scripted {
            self.storage
                .eval_script(
                    RELEASE_SCRIPT,
                    &[&full_key],
                    &[
                        json!(self.burst),
                        json!(tokens),
                        json!(self.idle_ttl.as_millis() as u64),
                    ],
                )
                .await?;
            return Ok(());
        }

        let lock = self.locks.lock_for(&full_key);
        let _guard = lock.lock().await;
        // An absent bucket is already full; nothing to credit.
        if let Some(value) = self.storage.get(&full_key).await? {
            let (balance, last) = decode_bucket(&value)?;
            let updated = (balance + tokens).min(self.burst);
            self.storage
                .set(&full_key, encode_bucket(updated, last), Some(self.idle_ttl))
                .await?;
            self.metrics
                .gauge(&format!("limiter.{}.tokens", self.scope), updated);
        }
        Ok(())
    }

    async fn stats(&self, key: &str) -> Result<LimiterStats> {
        let full_key = self.key(key);
        let now = self.clock.now_ms();
        let (balance, last) = match self.storage.get(&full_key).await? {
            Some(value) => decode_bucket(&value)?,
            None => (self.burst, now),
        };
        let available =
            (balance + now.saturating_sub(last) as f64 * self.refill_per_ms).min(self.burst);
        Ok(LimiterStats {
            available,
            max: self.burst,
            rate: self.rate / (self.per_ms / 1000.0),
            last_update_ms: last,
        })
    }
}

// ============== In-Process Variant ==============

/// Storage-free token bucket for hot in-process paths. All state sits
/// behind one mutex; no global consistency across processes.
pub struct QuickBucket {
    burst: f64,
    refill_per_ms: f64,
    rate_per_sec: f64,
    clock: Arc<dyn Clock>,
    buckets: Mutex<ahash::AHashMap<String, (f64, u64)>>,
}

impl QuickBucket {
    pub fn new(rate: f64, per: Duration) -> Self {
        Self::with_clock(rate, per, system_clock())
    }

    pub fn with_clock(rate: f64, per: Duration, clock: Arc<dyn Clock>) -> Self {
        let per_ms = per.as_millis().max(1) as f64;
        Self {
            burst: rate,
            refill_per_ms: rate / per_ms,
            rate_per_sec: rate / (per_ms / 1000.0),
            clock,
            buckets: Mutex::new(ahash::AHashMap::new()),
        }
    }

    pub fn burst(mut self, burst: f64) -> Self {
        self.burst = burst;
        self
    }

    pub fn try_acquire(&self, key: &str, tokens: f64) -> bool {
        let now = self.clock.now_ms();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert((self.burst, now));
        bucket.0 = (bucket.0 + now.saturating_sub(bucket.1) as f64 * self.refill_per_ms)
            .min(self.burst);
        bucket.1 = now;

        if bucket.0 >= tokens {
            bucket.0 -= tokens;
            true
        } else {
            false
        }
    }

    pub fn release(&self, key: &str, tokens: f64) {
        let mut buckets = self.buckets.lock();
        if let Some(bucket) = buckets.get_mut(key) {
            bucket.0 = (bucket.0 + tokens).min(self.burst);
        }
    }

    pub fn available(&self, key: &str) -> f64 {
        let now = self.clock.now_ms();
        let buckets = self.buckets.lock();
        match buckets.get(key) {
            Some(&(balance, last)) => {
                (balance + now.saturating_sub(last) as f64 * self.refill_per_ms).min(self.burst)
            }
            None => self.burst,
        }
    }

    pub fn rate_per_sec(&self) -> f64 {
        self.rate_per_sec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStorage;

    fn bucket(rate: f64, burst: f64, clock: &Arc<ManualClock>) -> TokenBucket {
        let storage = Arc::new(MemoryStorage::with_clock(
            1024,
            clock.clone() as Arc<dyn Clock>,
        ));
        TokenBucket::new(rate, Duration::from_secs(1), storage)
            .burst(burst)
            .clock(clock.clone() as Arc<dyn Clock>)
    }

    #[tokio::test]
    async fn test_starts_full_and_enforces_rate() {
        let clock = ManualClock::new(10_000);
        let tb = bucket(10.0, 10.0, &clock);

        // 10 rapid acquires all accept, the 11th rejects.
        for _ in 0..10 {
            assert!(tb.acquire("k", 1.0).await.unwrap());
        }
        assert!(!tb.acquire("k", 1.0).await.unwrap());

        // After a full second, exactly one more fits... and only one.
        clock.advance(1_000);
        assert!(tb.acquire("k", 10.0).await.unwrap());
        assert!(!tb.acquire("k", 1.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_partial_refill() {
        let clock = ManualClock::new(10_000);
        let tb = bucket(10.0, 10.0, &clock);

        assert!(tb.acquire("k", 10.0).await.unwrap());
        clock.advance(500);
        // Half a second refills 5 tokens.
        assert!(tb.acquire("k", 5.0).await.unwrap());
        assert!(!tb.acquire("k", 1.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_release_roundtrip() {
        let clock = ManualClock::new(10_000);
        let tb = bucket(10.0, 10.0, &clock);

        let before = tb.stats("k").await.unwrap().available;
        assert!(tb.acquire("k", 3.0).await.unwrap());
        tb.release("k", 3.0).await.unwrap();
        let after = tb.stats("k").await.unwrap().available;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_release_clamps_at_burst() {
        let clock = ManualClock::new(10_000);
        let tb = bucket(10.0, 10.0, &clock);

        assert!(tb.acquire("k", 1.0).await.unwrap());
        tb.release("k", 100.0).await.unwrap();
        assert_eq!(tb.stats("k").await.unwrap().available, 10.0);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let clock = ManualClock::new(10_000);
        let tb = bucket(2.0, 2.0, &clock);

        assert!(tb.acquire("a", 2.0).await.unwrap());
        assert!(!tb.acquire("a", 1.0).await.unwrap());
        assert!(tb.acquire("b", 2.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_stats_reflect_refill_without_mutation() {
        let clock = ManualClock::new(10_000);
        let tb = bucket(10.0, 10.0, &clock);

        assert!(tb.acquire("k", 10.0).await.unwrap());
        clock.advance(300);
        let stats = tb.stats("k").await.unwrap();
        assert!((stats.available - 3.0).abs() < 1e-9);
        assert_eq!(stats.max, 10.0);
        assert_eq!(stats.rate, 10.0);
    }

    #[test]
    fn test_quick_bucket() {
        let clock = ManualClock::new(5_000);
        let qb = QuickBucket::with_clock(
            5.0,
            Duration::from_secs(1),
            clock.clone() as Arc<dyn Clock>,
        );

        for _ in 0..5 {
            assert!(qb.try_acquire("k", 1.0));
        }
        assert!(!qb.try_acquire("k", 1.0));

        clock.advance(200);
        assert!(qb.try_acquire("k", 1.0));
        assert!(!qb.try_acquire("k", 1.0));

        qb.release("k", 2.0);
        assert!(qb.try_acquire("k", 2.0));
    }
}
