//! Shared (L2) layer and the seams to the networked key-value store.
//!
//! [`RemoteStore`] covers the four key commands the cache needs and
//! [`InvalidationBus`] the publish/subscribe primitive. Both are implemented
//! by [`RedisStore`] for production and by [`MemoryStore`] for single-node
//! setups and tests.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tracing::{debug, warn};

use crate::{CacheError, error::Result, sentinel::Lookup};

/// Key commands of a Redis-compatible store
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// `SET key data NX PX ttl`; `Ok(false)` when the key already exists
    async fn set_if_absent(&self, key: &str, data: &[u8], ttl: Duration) -> Result<bool>;

    /// `SET key data PX ttl`
    async fn set_force(&self, key: &str, data: &[u8], ttl: Duration) -> Result<()>;

    /// `GET key`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// `DEL key`
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Publish/subscribe primitive carrying invalidation messages
#[async_trait]
pub trait InvalidationBus: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to `channel`. The stream ends when the subscription is lost.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>>;
}

/// Bound `op` by `limit`, if any
pub(crate) async fn with_deadline<T>(
    limit: Option<Duration>,
    op: impl Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, op)
            .await
            .map_err(|_| CacheError::RemoteTimeout(limit))?,
        None => op.await,
    }
}

/// Remote (L2) cache layer
#[derive(Clone)]
pub struct RemoteLayer {
    store: Arc<dyn RemoteStore>,
    timeout: Option<Duration>,
}

impl RemoteLayer {
    pub fn new(store: Arc<dyn RemoteStore>, timeout: Option<Duration>) -> Self {
        Self { store, timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn with_deadline<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        with_deadline(self.timeout, op).await
    }

    /// Conditional fill. Another writer holding the key is not an error.
    pub async fn set_if_absent(&self, key: &str, data: &[u8], ttl: Duration) -> Result<bool> {
        let was_set = self
            .with_deadline(self.store.set_if_absent(key, data, ttl))
            .await?;
        debug!("L2 set NX for key: {} (set: {})", key, was_set);
        Ok(was_set)
    }

    /// Unconditional overwrite, used to fill after a confirmed load
    pub async fn set_force(&self, key: &str, data: &[u8], ttl: Duration) -> Result<()> {
        self.with_deadline(self.store.set_force(key, data, ttl))
            .await?;
        debug!("L2 set for key: {}", key);
        Ok(())
    }

    /// Read `key`; a missing or zero-length value is a miss, not an error
    pub async fn get(&self, key: &str) -> Result<Lookup> {
        let raw = self.with_deadline(self.store.get(key)).await?;
        Ok(raw.map_or(Lookup::Miss, |v| Lookup::from_raw(Bytes::from(v))))
    }

    /// Best-effort delete: failures are logged and swallowed
    pub async fn delete(&self, key: &str) {
        match self.with_deadline(self.store.delete(key)).await {
            Ok(()) => debug!("L2 invalidated for key: {}", key),
            Err(e) => warn!("Redis DEL failed for key {}: {}. Continuing.", key, e),
        }
    }
}
