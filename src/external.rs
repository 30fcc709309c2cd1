//! Shared external cache tier.
//!
//! The store talks to the external tier through the `ExternalTier` trait
//! so tests can substitute an in-memory fake. The production
//! implementation is Redis behind a deadpool connection pool. All calls
//! are awaited at the call site; there are no fire-and-forget writes.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Pool, Runtime};
use redis::AsyncCommands;
use tracing::debug;

use crate::error::StoreError;
use crate::keys::redis_glob;

/// Operations the store needs from a shared tier.
///
/// Payloads are JSON-serialized `CacheEntry` values; the tier itself
/// treats them as opaque strings and owns only key expiry.
#[async_trait]
pub trait ExternalTier: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn store(&self, key: &str, payload: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Remove one key. Returns the number of keys deleted (0 or 1).
    async fn remove(&self, key: &str) -> Result<u64, StoreError>;

    /// Remove every key matching a `*` wildcard pattern.
    async fn remove_matching(&self, pattern: &str) -> Result<u64, StoreError>;

    /// List keys matching a `*` wildcard pattern (prefix stripped).
    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Drop every key in this tier's namespace.
    async fn clear(&self) -> Result<u64, StoreError>;

    /// Cheap connectivity probe.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Redis-backed external tier.
///
/// Keys are namespaced under a configurable prefix so several
/// applications can share one Redis instance.
pub struct RedisTier {
    pool: Pool,
    prefix: String,
}

impl RedisTier {
    /// Build a connection pool for the given Redis URL. Connections are
    /// established lazily; a wrong URL surfaces on first use.
    pub fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let pool = deadpool_redis::Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|err| StoreError::Pool(err.to_string()))?;
        Ok(Self {
            pool,
            prefix: prefix.into(),
        })
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|err| StoreError::Pool(err.to_string()))
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

#[async_trait]
impl ExternalTier for RedisTier {
    async fn fetch(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = conn.get(self.namespaced(key)).await?;
        Ok(payload)
    }

    async fn store(&self, key: &str, payload: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(self.namespaced(key), payload, seconds)
            .await?;
        debug!(key, ttl_secs = seconds, "external tier write");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let removed: u64 = conn.del(self.namespaced(key)).await?;
        Ok(removed)
    }

    async fn remove_matching(&self, pattern: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let glob = redis_glob(&self.namespaced(pattern));
        let keys: Vec<String> = conn.keys(&glob).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: u64 = conn.del(&keys).await?;
        debug!(pattern, removed, "external tier pattern invalidation");
        Ok(removed)
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let glob = redis_glob(&self.namespaced(pattern));
        let keys: Vec<String> = conn.keys(&glob).await?;
        Ok(keys
            .into_iter()
            .map(|key| {
                key.strip_prefix(&self.prefix)
                    .map(str::to_string)
                    .unwrap_or(key)
            })
            .collect())
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        self.remove_matching("*").await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: bool = conn.exists(self.namespaced("__ping__")).await?;
        Ok(())
    }
}
