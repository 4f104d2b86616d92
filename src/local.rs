//! In-process layer backed by a Moka cache.
//!
//! Every entry carries its own time-to-live; eviction and expiry are left to
//! Moka. The layer is a best-effort shadow of the remote layer and is never
//! treated as authoritative.

use std::time::{Duration, Instant};

use bytes::Bytes;
use moka::{Expiry, future::Cache};
use tracing::debug;

use crate::sentinel::Lookup;

#[derive(Debug, Clone)]
struct LocalEntry {
    data: Bytes,
    ttl: Duration,
}

/// Expires each entry after the TTL it was written with, restarting the
/// clock on overwrite.
struct PerEntryTtl;

impl Expiry<String, LocalEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &LocalEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &LocalEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Local (L1) cache layer
#[derive(Clone)]
pub struct LocalLayer {
    cache: Cache<String, LocalEntry>,
}

impl LocalLayer {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }

    /// Store `data` under `key`, replacing anything already there
    pub async fn set(&self, key: &str, data: Bytes, ttl: Duration) {
        self.cache
            .insert(key.to_owned(), LocalEntry { data, ttl })
            .await;
        debug!("L1 set for key: {} (ttl {:?})", key, ttl);
    }

    /// Read `key`. A negative entry is reported as [`Lookup::Negative`], so it
    /// is never mistaken for data while staying visible to the cascade.
    pub async fn get(&self, key: &str) -> Lookup {
        match self.cache.get(key).await {
            Some(entry) => Lookup::from_raw(entry.data),
            None => Lookup::Miss,
        }
    }

    /// Drop `key`; a missing key is not an error
    pub async fn delete(&self, key: &str) {
        self.cache.invalidate(key).await;
        debug!("L1 invalidated for key: {}", key);
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}
