//! Idempotency stores.
//!
//! A tiny keyed register with atomic insert-if-absent and compare-and-swap.
//! The dispatcher keeps publish markers in it and workers keep the job
//! ledger in it. Values are opaque strings (JSON in practice).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{QueueError, QueueResult};

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Store `value` under `key` only if no live value exists. Returns true when stored.
    async fn insert_if_absent(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<bool>;

    /// Replace the value only if it currently equals `expected`. Returns true when swapped.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> QueueResult<bool>;

    async fn get(&self, key: &str) -> QueueResult<Option<String>>;

    async fn remove(&self, key: &str) -> QueueResult<()>;
}

/// Process-local idempotency store.
#[derive(Default)]
pub struct MemoryIdempotencyStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, (String, Instant)>,
        key: &str,
    ) -> Option<&'a mut (String, Instant)> {
        let expired = entries
            .get(key)
            .map(|(_, expires_at)| *expires_at <= Instant::now())
            .unwrap_or(false);
        if expired {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn insert_if_absent(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if Self::live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> QueueResult<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match Self::live(&mut entries, key) {
            Some(entry) if entry.0 == expected => {
                *entry = (new.to_string(), Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Self::live(&mut entries, key).map(|entry| entry.0.clone()))
    }

    async fn remove(&self, key: &str) -> QueueResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

const CAS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
    return 1
end
return 0
"#;

/// Redis-backed idempotency store (SET NX plus a Lua compare-and-swap).
pub struct RedisIdempotencyStore {
    client: redis::Client,
    prefix: String,
    cas: redis::Script,
}

impl RedisIdempotencyStore {
    pub fn new(redis_url: &str, prefix: impl Into<String>) -> QueueResult<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            prefix: prefix.into(),
            cas: redis::Script::new(CAS_SCRIPT),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:idem:{}", self.prefix, key)
    }

    async fn connection(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn insert_if_absent(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<bool> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::store(e.to_string()))?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> QueueResult<bool> {
        let mut conn = self.connection().await?;
        let swapped: i32 = self
            .cas
            .key(self.key(key))
            .arg(expected)
            .arg(new)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::store(e.to_string()))?;
        Ok(swapped == 1)
    }

    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        let mut conn = self.connection().await?;
        redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::store(e.to_string()))
    }

    async fn remove(&self, key: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(self.key(key))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| QueueError::store(e.to_string()))
    }
}
