//! Key-value store abstraction backing [`crate::config_store::ConfigStore`] and
//! [`crate::breaker::CircuitBreaker`]. Two implementations ship: an in-memory
//! store (default, and useful for tests) and a Redis-backed store that mirrors
//! the connection-per-call idiom used by the gateway's own cache manager.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvStoreError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("redis error: {0}")]
    Redis(String),
}

/// An async key-value store holding opaque JSON values with optional TTL.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, KvStoreError>;

    /// `ttl_seconds == 0` means no expiry.
    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl_seconds: u64,
    ) -> Result<(), KvStoreError>;

    async fn delete(&self, key: &str) -> Result<(), KvStoreError>;
}

struct Entry {
    value: serde_json::Value,
    expires_at: Option<u64>,
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Process-local store. Used as the bootstrap default when no external KV
/// backend is configured, and as the test double for the rest of the crate.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: DashMap<String, Entry>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

#[async_trait::async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, KvStoreError> {
        if let Some(entry) = self.entries.get(key) {
            if let Some(expires_at) = entry.expires_at {
                if now_epoch() >= expires_at {
                    drop(entry);
                    self.entries.remove(key);
                    return Ok(None);
                }
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl_seconds: u64,
    ) -> Result<(), KvStoreError> {
        let expires_at = if ttl_seconds > 0 {
            Some(now_epoch() + ttl_seconds)
        } else {
            None
        };
        self.entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvStoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Redis-backed store. Opens the client once and takes a fresh multiplexed
/// connection per call, the same pattern the gateway's `CacheManager` uses.
pub struct RedisKvStore {
    client: redis::Client,
}

impl RedisKvStore {
    pub fn new(redis_url: &str) -> Result<Self, KvStoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| KvStoreError::Redis(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, KvStoreError> {
        let mut conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| KvStoreError::Redis(e.to_string()))?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| KvStoreError::Redis(e.to_string()))?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl_seconds: u64,
    ) -> Result<(), KvStoreError> {
        let mut conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| KvStoreError::Redis(e.to_string()))?;
        let raw = serde_json::to_string(&value)?;
        if ttl_seconds > 0 {
            redis::cmd("SETEX")
                .arg(key)
                .arg(ttl_seconds)
                .arg(raw)
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| KvStoreError::Redis(e.to_string()))?;
        } else {
            redis::cmd("SET")
                .arg(key)
                .arg(raw)
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| KvStoreError::Redis(e.to_string()))?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvStoreError> {
        let mut conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| KvStoreError::Redis(e.to_string()))?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| KvStoreError::Redis(e.to_string()))?;
        Ok(())
    }
}

pub fn shared_in_memory() -> Arc<dyn KvStore> {
    Arc::new(InMemoryKvStore::new())
}
