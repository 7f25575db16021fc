//! Two-tier storage: fast local cache (L1) over an authoritative remote
//! tier (L2).
//!
//! Reads populate L1 on a miss; writes go through to both tiers. Counters
//! and deletes invalidate L1 before touching L2 so a stale counter is never
//! served locally. Scripts and lock primitives only make sense against the
//! authoritative tier and delegate straight to L2.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{MemoryStorage, Storage};
use crate::error::Result;

/// Cap on how long an L1 copy may outlive the truth in L2.
const L1_MAX_TTL: Duration = Duration::from_secs(60);

pub struct HybridStorage {
    l1: MemoryStorage,
    l2: Arc<dyn Storage>,
}

impl HybridStorage {
    pub fn new(l2: Arc<dyn Storage>) -> Self {
        Self::with_l1_capacity(l2, 10_000)
    }

    pub fn with_l1_capacity(l2: Arc<dyn Storage>, l1_size: usize) -> Self {
        Self {
            l1: MemoryStorage::with_capacity(l1_size),
            l2,
        }
    }

    fn l1_ttl(residual: Option<Duration>) -> Duration {
        residual.map(|r| r.min(L1_MAX_TTL)).unwrap_or(L1_MAX_TTL)
    }
}

#[async_trait]
impl Storage for HybridStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        if let Some(hit) = self.l1.get(key).await? {
            return Ok(Some(hit));
        }
        let value = self.l2.get(key).await?;
        if let Some(ref value) = value {
            let residual = self.l2.remaining_ttl(key).await?;
            self.l1
                .set(key, value.clone(), Some(Self::l1_ttl(residual)))
                .await?;
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.l1
            .set(key, value.clone(), Some(Self::l1_ttl(ttl)))
            .await?;
        self.l2.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.l1.delete(key).await?;
        self.l2.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if self.l1.exists(key).await? {
            return Ok(true);
        }
        self.l2.exists(key).await
    }

    async fn incr(&self, key: &str, delta: f64) -> Result<f64> {
        // Invalidate first: L1 must never answer for a counter.
        self.l1.delete(key).await?;
        self.l2.incr(key, delta).await
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.l2.remaining_ttl(key).await
    }

    fn supports_scripts(&self) -> bool {
        self.l2.supports_scripts()
    }

    async fn eval_script(&self, script: &str, keys: &[&str], args: &[Value]) -> Result<Value> {
        self.l2.eval_script(script, keys, args).await
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.l2.try_lock(key, token, ttl).await
    }

    async fn extend_if_equal(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.l2.extend_if_equal(key, token, ttl).await
    }

    async fn delete_if_equal(&self, key: &str, token: &str) -> Result<bool> {
        self.l2.delete_if_equal(key, token).await
    }
}
