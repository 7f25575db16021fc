//! In-process storage.
//!
//! A single mutex serializes mutations. TTLs are enforced lazily at read
//! time; on reaching `max_size` the least-recently-used entries are evicted
//! in small batches so the scan cost amortizes to a constant per insert.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{value_as_f64, Storage};
use crate::clock::{system_clock, Clock};
use crate::error::Result;

const DEFAULT_MAX_SIZE: usize = 100_000;

/// Entries evicted per LRU pass. Scanning the whole map once per batch keeps
/// the amortized per-insert cost constant.
const EVICT_BATCH: usize = 16;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<u64>,
    last_access: u64,
}

impl Entry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.map(|exp| now > exp).unwrap_or(false)
    }
}

struct Inner {
    data: AHashMap<String, Entry>,
    // Monotonic access counter; avoids equal-millisecond ties in LRU order.
    tick: u64,
}

pub struct MemoryStorage {
    inner: Mutex<Inner>,
    max_size: usize,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_SIZE)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: AHashMap::new(),
                tick: 0,
            }),
            max_size: max_size.max(1),
            clock: system_clock(),
        }
    }

    pub fn with_clock(max_size: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: AHashMap::new(),
                tick: 0,
            }),
            max_size: max_size.max(1),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries eagerly. Optional; reads already ignore them.
    pub fn sweep(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        inner.data.retain(|_, entry| !entry.is_expired(now));
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<u64> {
        ttl.map(|t| self.clock.now_ms() + t.as_millis() as u64)
    }

    fn insert(&self, inner: &mut Inner, key: String, value: Value, expires_at: Option<u64>) {
        if inner.data.len() >= self.max_size && !inner.data.contains_key(&key) {
            self.evict(inner);
        }
        inner.tick += 1;
        let last_access = inner.tick;
        inner.data.insert(
            key,
            Entry {
                value,
                expires_at,
                last_access,
            },
        );
    }

    /// Make room: drop expired entries first, then the EVICT_BATCH
    /// least-recently-used.
    fn evict(&self, inner: &mut Inner) {
        let now = self.clock.now_ms();
        inner.data.retain(|_, entry| !entry.is_expired(now));
        if inner.data.len() < self.max_size {
            return;
        }

        let mut oldest: Vec<(u64, String)> = inner
            .data
            .iter()
            .map(|(k, e)| (e.last_access, k.clone()))
            .collect();
        oldest.sort_unstable_by_key(|(access, _)| *access);
        for (_, key) in oldest.into_iter().take(EVICT_BATCH) {
            inner.data.remove(&key);
        }
    }

    /// Read and touch an entry, treating expired ones as absent.
    fn read(&self, inner: &mut Inner, key: &str) -> Option<Value> {
        let now = self.clock.now_ms();
        match inner.data.get(key) {
            Some(entry) if entry.is_expired(now) => {
                inner.data.remove(key);
                None
            }
            Some(_) => {
                inner.tick += 1;
                let tick = inner.tick;
                let entry = inner.data.get_mut(key)?;
                entry.last_access = tick;
                Some(entry.value.clone())
            }
            None => None,
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut inner = self.inner.lock();
        Ok(self.read(&mut inner, key))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let expires_at = self.expiry(ttl);
        let mut inner = self.inner.lock();
        self.insert(&mut inner, key.to_string(), value, expires_at);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        match inner.data.remove(key) {
            Some(entry) => Ok(!entry.is_expired(now)),
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        Ok(self.read(&mut inner, key).is_some())
    }

    async fn incr(&self, key: &str, delta: f64) -> Result<f64> {
        let mut inner = self.inner.lock();
        let current = match self.read(&mut inner, key) {
            Some(value) => value_as_f64(&value)?,
            None => 0.0,
        };
        let updated = current + delta;
        // Preserve any existing expiry, the way Redis counters do.
        let expires_at = inner.data.get(key).and_then(|e| e.expires_at);
        self.insert(&mut inner, key.to_string(), Value::from(updated), expires_at);
        Ok(updated)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = self.clock.now_ms();
        let inner = self.inner.lock();
        Ok(inner.data.get(key).and_then(|entry| {
            if entry.is_expired(now) {
                return None;
            }
            entry
                .expires_at
                .map(|exp| Duration::from_millis(exp.saturating_sub(now)))
        }))
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let expires_at = self.expiry(Some(ttl));
        let mut inner = self.inner.lock();
        let held = match self.read(&mut inner, key) {
            None => true,
            Some(Value::String(current)) => current == token,
            Some(_) => false,
        };
        if held {
            self.insert(
                &mut inner,
                key.to_string(),
                Value::String(token.to_string()),
                expires_at,
            );
        }
        Ok(held)
    }

    async fn extend_if_equal(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let expires_at = self.expiry(Some(ttl));
        let mut inner = self.inner.lock();
        match self.read(&mut inner, key) {
            Some(Value::String(current)) if current == token => {
                if let Some(entry) = inner.data.get_mut(key) {
                    entry.expires_at = expires_at;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_equal(&self, key: &str, token: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        match self.read(&mut inner, key) {
            Some(Value::String(current)) if current == token => {
                inner.data.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
