//! Redis-backed storage.
//!
//! A bounded connection pool fronts a Redis-compatible server. The scripted
//! path is the key primitive: limiters ship their read/compute/write cycle
//! as a Lua script so the whole decision executes at the server, against the
//! server clock, as one step.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use once_cell::sync::Lazy;
use serde_json::Value;

use super::Storage;
use crate::error::{Error, Result};

const DEFAULT_POOL_SIZE: usize = 10;

static TRY_LOCK: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
        local current = redis.call('GET', KEYS[1])
        if not current or current == ARGV[1] then
            redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
            return 1
        end
        return 0
        "#,
    )
});

static EXTEND_IF_EQUAL: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            redis.call('PEXPIRE', KEYS[1], ARGV[2])
            return 1
        end
        return 0
        "#,
    )
});

static DELETE_IF_EQUAL: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            redis.call('DEL', KEYS[1])
            return 1
        end
        return 0
        "#,
    )
});

pub struct RedisStorage {
    pool: Pool,
}

impl RedisStorage {
    /// Connect with the default pool size.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_pool_size(url, DEFAULT_POOL_SIZE)
    }

    /// Connect with a bounded pool of `pool_size` connections. Acquirers
    /// block when the pool is exhausted, in arrival order.
    pub fn with_pool_size(url: &str, pool_size: usize) -> Result<Self> {
        let mut cfg = Config::from_url(url);
        cfg.pool = Some(PoolConfig::new(pool_size.max(1)));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))
    }

    /// Fetch several keys in one round trip (MGET).
    pub async fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<Value>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(raw.into_iter().map(|v| v.map(decode)).collect())
    }

    /// Write several keys in one pipelined round trip.
    pub async fn set_many(&self, entries: &[(&str, Value, Option<Duration>)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for (key, value, ttl) in entries {
            match ttl {
                Some(ttl) => pipe
                    .cmd("SET")
                    .arg(key)
                    .arg(encode(value))
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .ignore(),
                None => pipe.cmd("SET").arg(key).arg(encode(value)).ignore(),
            };
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(raw.map(decode))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => {
                redis::cmd("SET")
                    .arg(key)
                    .arg(encode(&value))
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async::<()>(&mut conn)
                    .await?
            }
            None => {
                redis::cmd("SET")
                    .arg(key)
                    .arg(encode(&value))
                    .query_async::<()>(&mut conn)
                    .await?
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let found: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(found > 0)
    }

    async fn incr(&self, key: &str, delta: f64) -> Result<f64> {
        let mut conn = self.conn().await?;
        let updated: f64 = redis::cmd("INCRBYFLOAT")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        Ok(updated)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn().await?;
        let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        // -2 = missing, -1 = no expiry.
        if pttl < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_millis(pttl as u64)))
        }
    }

    fn supports_scripts(&self) -> bool {
        true
    }

    async fn eval_script(&self, script: &str, keys: &[&str], args: &[Value]) -> Result<Value> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(script);
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(encode(arg));
        }
        let reply: redis::Value = invocation.invoke_async(&mut conn).await?;
        Ok(reply_to_json(reply))
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let held: i64 = TRY_LOCK
            .key(key)
            .arg(token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(held == 1)
    }

    async fn extend_if_equal(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let extended: i64 = EXTEND_IF_EQUAL
            .key(key)
            .arg(token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn delete_if_equal(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = DELETE_IF_EQUAL
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }
}

/// Redis stores strings; numbers go over as plain number text so INCRBYFLOAT
/// and Lua `tonumber` keep working, everything else as JSON.
fn encode(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn decode(raw: String) -> Value {
    if let Ok(parsed) = raw.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(parsed) {
            return Value::Number(number);
        }
    }
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

fn reply_to_json(reply: redis::Value) -> Value {
    match reply {
        redis::Value::Nil => Value::Null,
        redis::Value::Int(i) => Value::from(i),
        redis::Value::Double(d) => Value::from(d),
        redis::Value::Boolean(b) => Value::Bool(b),
        redis::Value::BulkString(bytes) => decode(String::from_utf8_lossy(&bytes).into_owned()),
        redis::Value::SimpleString(s) => Value::String(s),
        redis::Value::Okay => Value::Bool(true),
        redis::Value::Array(items) => Value::Array(items.into_iter().map(reply_to_json).collect()),
        _ => Value::Null,
    }
}
