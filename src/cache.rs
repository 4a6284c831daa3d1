//! Best-effort invalidation of the API's read cache.
//!
//! The indexer never reads the cache. After a commit it deletes the keys of
//! the rows it changed so the API refetches them. A failed delete is logged
//! and otherwise ignored: it can only make the cache stale, never the
//! projection wrong.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::CacheError;

/// Deletes cache entries by key.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    /// Removes `key` from the cache. Deleting an absent key succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend could not be reached.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Builds the cache keys the API reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeys {
    prefix: String,
}

impl CacheKeys {
    /// Creates a key builder under `prefix` (for example `cache:imart`).
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Key of the cached order list of a token.
    #[must_use]
    pub fn order(&self, token_id: Uuid) -> String {
        format!("{}:aptosOrder:id:{token_id}", self.prefix)
    }

    /// Key of the cached statistics of a collection.
    #[must_use]
    pub fn collection_stats(&self, collection_id: Uuid) -> String {
        format!("{}:collectionstats:id:{collection_id}", self.prefix)
    }
}

/// Deletes every key, logging failures. Never fails.
///
/// Gives up on whatever is left once `budget` has elapsed, so a stalled
/// backend delays the caller by at most `budget`.
pub async fn invalidate_all(cache: &dyn CacheInvalidator, keys: &[String], budget: Duration) {
    let deletes = async {
        for key in keys {
            if let Err(e) = cache.delete(key).await {
                tracing::warn!(key = %key, error = %e, "cache invalidation failed");
            }
        }
    };
    if tokio::time::timeout(budget, deletes).await.is_err() {
        tracing::warn!(
            keys = keys.len(),
            budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
            "cache invalidation timed out"
        );
    }
}

/// Redis-backed invalidator over a multiplexed connection.
#[derive(Clone)]
pub struct RedisCache {
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Connects to the Redis server at `url`. Both the connect and every
    /// command response are bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Redis`] if the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = client
            .get_multiplexed_async_connection_with_timeouts(timeout, timeout)
            .await?;
        tracing::info!("redis cache connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheInvalidator for RedisCache {
    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

/// Invalidator used when no cache is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

#[async_trait]
impl CacheInvalidator for NoopCache {
    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Invalidator that records every delete. Used by tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    deleted: Arc<Mutex<Vec<String>>>,
    failing: bool,
    stalled: bool,
}

impl MemoryCache {
    /// Creates a recording cache whose deletes succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a recording cache whose deletes are recorded and then fail.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Creates a recording cache whose deletes are recorded and then never
    /// complete.
    #[must_use]
    pub fn stalled() -> Self {
        Self {
            stalled: true,
            ..Self::default()
        }
    }

    /// Keys deleted so far, in call order.
    pub async fn deleted(&self) -> Vec<String> {
        self.deleted.lock().await.clone()
    }
}

#[async_trait]
impl CacheInvalidator for MemoryCache {
    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.deleted.lock().await.push(key.to_string());
        if self.stalled {
            std::future::pending::<()>().await;
        }
        if self.failing {
            return Err(CacheError::Backend("injected cache failure".to_string()));
        }
        Ok(())
    }
}
