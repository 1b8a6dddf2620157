// =============================================================================
// Shared State Store — atomic key-value operations for worker coordination
// =============================================================================
//
// Circuit breakers, proxy runtime state and rate-limit counters are shared
// across workers through this trait. Production uses Redis (namespaces
// `cb:<svc>:*`, `proxy:<id>:state`, `rl:<exchange>:*`, all keys carry TTLs);
// tests and single-process runs without REDIS_URL use the in-memory store.
//
// Only single-key atomic operations are exposed. The engine never holds a
// lock across a store call.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> EngineResult<Option<String>>;

    /// Set `key` to `value` with a TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> EngineResult<()>;

    /// Atomically increment an integer counter, refreshing its TTL. Returns
    /// the post-increment value.
    async fn incr_ex(&self, key: &str, ttl_seconds: u64) -> EngineResult<i64>;

    /// Set `key` only if absent. Returns true when this call created the key.
    /// Used for signal dedup tokens.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> EngineResult<bool>;

    async fn del(&self, key: &str) -> EngineResult<()>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store with lazy TTL expiry. Used in tests and when no
/// REDIS_URL is configured (single-worker deployments).
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn live_value(entries: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
        match entries.get(key) {
            Some(e) if !e.is_expired() => Some(e.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let mut entries = self.entries.lock();
        Ok(Self::live_value(&mut entries, key))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> EngineResult<()> {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(())
    }

    async fn incr_ex(&self, key: &str, ttl_seconds: u64) -> EngineResult<i64> {
        let mut entries = self.entries.lock();
        let current = Self::live_value(&mut entries, key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(next)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> EngineResult<bool> {
        let mut entries = self.entries.lock();
        if Self::live_value(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> EngineResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Redis store
// ---------------------------------------------------------------------------

/// Redis-backed store shared by all workers. The connection manager
/// reconnects transparently; individual command failures surface as
/// `EngineError::Store`.
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> EngineResult<Self> {
        let client = redis::Client::open(url).map_err(|e| EngineError::Store(e.to_string()))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        debug!(url, "redis state store connected");
        Ok(Self { conn })
    }
}

fn store_err(e: redis::RedisError) -> EngineError {
    EngineError::Store(e.to_string())
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> EngineResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn incr_ex(&self, key: &str, ttl_seconds: u64) -> EngineResult<i64> {
        let mut conn = self.conn.clone();
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_seconds)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(count)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> EngineResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> EngineResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_incr_and_nx() {
        let store = MemoryStore::new();

        assert_eq!(store.incr_ex("counter", 60).await.unwrap(), 1);
        assert_eq!(store.incr_ex("counter", 60).await.unwrap(), 2);

        assert!(store.set_nx_ex("token", "1", 60).await.unwrap());
        assert!(!store.set_nx_ex("token", "1", 60).await.unwrap());

        store.del("token").await.unwrap();
        assert!(store.set_nx_ex("token", "1", 60).await.unwrap());
    }

    #[tokio::test]
    async fn memory_store_expires_lazily() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", 0).await.unwrap();
        // TTL of zero expires immediately.
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
