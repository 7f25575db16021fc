//! Storage backends for limiter state and coordination.
//!
//! One uniform contract over three variants: in-process memory, Redis, and a
//! two-tier hybrid. Counters are linearizable per storage instance; the
//! scripted path executes read/compute/write sequences indivisibly at the
//! server, which is how limiters stay correct across a fleet.

mod hybrid;
mod memory;
mod redis_;

pub use hybrid::HybridStorage;
pub use memory::MemoryStorage;
pub use redis_::RedisStorage;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};

/// Key/value store with TTL, atomic counters, and conditional lock
/// primitives.
///
/// Missing keys are treated as 0 by [`incr`](Storage::incr) and
/// [`decr`](Storage::decr). A key whose TTL has elapsed behaves as absent for
/// every operation.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    /// Returns true if the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Atomically add `delta` to a numeric value, creating it from 0.
    async fn incr(&self, key: &str, delta: f64) -> Result<f64>;

    async fn decr(&self, key: &str, delta: f64) -> Result<f64> {
        self.incr(key, -delta).await
    }

    /// Remaining TTL, if the key exists and carries one.
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Whether [`eval_script`](Storage::eval_script) is available.
    fn supports_scripts(&self) -> bool {
        false
    }

    /// Run a server-side script as one indivisible step. The script has
    /// access to the server clock.
    async fn eval_script(&self, _script: &str, _keys: &[&str], _args: &[Value]) -> Result<Value> {
        Err(Error::ScriptsUnsupported)
    }

    // === Lock primitives (used by the coordinator) ===

    /// Set `key = token` with `ttl` iff the key is absent or already holds
    /// `token`. Returns whether the lock is held afterwards.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Refresh the TTL iff the key still holds `token`.
    async fn extend_if_equal(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Delete the key iff it still holds `token`.
    async fn delete_if_equal(&self, key: &str, token: &str) -> Result<bool>;
}

/// Extract an f64 from a stored value, for counter arithmetic.
pub(crate) fn value_as_f64(value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| Error::StorageCorrupt(format!("non-finite number: {n}"))),
        Value::Null => Ok(0.0),
        other => Err(Error::StorageCorrupt(format!(
            "expected a number, found {other}"
        ))),
    }
}
