//! Rate-limiter family.
//!
//! Five algorithms behind one capability set: `acquire` / `release` /
//! `stats`. Each storage-backed limiter has two execution paths with the
//! same observable behavior: a per-key lock over plain storage reads and
//! writes (memory), and a single server-side script (Redis) so a whole
//! fleet shares one bucket.

mod adaptive;
mod composite;
mod leaky_bucket;
mod sliding_window;
mod token_bucket;

pub use adaptive::{AdaptiveConfig, AdaptiveLimiter};
pub use composite::CompositeLimiter;
pub use leaky_bucket::LeakyBucket;
pub use sliding_window::SlidingWindow;
pub use token_bucket::{QuickBucket, TokenBucket};

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Uniform limiter contract. `acquire` answers the accept/reject decision
/// and only errors on storage failures; it never blocks beyond one storage
/// round trip. Callers that want to wait compose it with backoff (see
/// `wrap::RateLimited`).
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Try to take `tokens` for `key`. `Ok(true)` = accepted.
    async fn acquire(&self, key: &str, tokens: f64) -> Result<bool>;

    /// Credit `tokens` back (not every algorithm supports this; a no-op
    /// where it does not apply).
    async fn release(&self, key: &str, tokens: f64) -> Result<()>;

    /// Current state for `key`.
    async fn stats(&self, key: &str) -> Result<LimiterStats>;
}

/// Point-in-time view of one key's limiter state.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    /// Tokens (or slots) currently available.
    pub available: f64,
    /// Maximum instantaneous credit.
    pub max: f64,
    /// Refill / leak / admission rate in units per second.
    pub rate: f64,
    /// Timestamp of the last state mutation, ms.
    pub last_update_ms: u64,
}

/// `{scope}:{kind}:{key}` storage naming, shared by every limiter.
pub(crate) fn storage_key(scope: &str, kind: &str, key: &str) -> String {
    format!("{scope}:{kind}:{key}")
}

/// Buckets persist as a single `"balance|last_ms"` string so one key holds
/// the whole state.
pub(crate) fn encode_bucket(balance: f64, last_ms: u64) -> Value {
    Value::String(format!("{balance}|{last_ms}"))
}

pub(crate) fn decode_bucket(value: &Value) -> Result<(f64, u64)> {
    let corrupt = || Error::StorageCorrupt(format!("bad bucket encoding: {value}"));
    let raw = value.as_str().ok_or_else(corrupt)?;
    let (balance, last) = raw.split_once('|').ok_or_else(corrupt)?;
    Ok((
        balance.parse().map_err(|_| corrupt())?,
        last.parse().map_err(|_| corrupt())?,
    ))
}

/// Interpret a script reply as the accept/reject flag.
pub(crate) fn reply_accepted(reply: &Value) -> bool {
    match reply {
        Value::Number(n) => n.as_f64().unwrap_or(0.0) >= 1.0,
        Value::Bool(b) => *b,
        _ => false,
    }
}

/// Per-key async mutex table for the local storage path. Locks are created
/// on first touch and live for the limiter's lifetime.
#[derive(Default)]
pub(crate) struct KeyLocks {
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    pub(crate) fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        if let Some(lock) = self.locks.get(key) {
            return Arc::clone(&lock);
        }
        Arc::clone(
            &self
                .locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bucket_codec_roundtrip() {
        let encoded = encode_bucket(12.5, 1_700_000_000_000);
        assert_eq!(decode_bucket(&encoded).unwrap(), (12.5, 1_700_000_000_000));
    }

    #[test]
    fn test_bucket_codec_rejects_garbage() {
        assert!(decode_bucket(&json!("no-separator")).is_err());
        assert!(decode_bucket(&json!(42)).is_err());
        assert!(decode_bucket(&json!("a|b")).is_err());
    }

    #[test]
    fn test_storage_key_layout() {
        assert_eq!(
            storage_key("api", "token_bucket", "user-1"),
            "api:token_bucket:user-1"
        );
    }
}
