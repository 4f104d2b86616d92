//! Cascading read-through cache.
//!
//! Reads walk the configured layers, local first, and fall back to a
//! caller-supplied fetcher on a full miss. Concurrent misses on one key share
//! a single fetch, and a fetch that finds nothing is cached as a negative
//! entry so the source is not asked again until the entry expires.
//!
//! ```text
//! get_or_fetch → L1 (Moka) → L2 (Redis) → deduplicated fetch → write-back
//! update       → PUBLISH <namespace>:updating:<app_id> → every process purges
//! ```

use std::{fmt::Display, future::Future, sync::Arc};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, error, warn};

use crate::{
    CacheConfig, CacheError, LayerMask,
    config::Layers,
    error::{BoxError, Result, SharedError},
    invalidation::{Alteration, InvalidationChannel},
    json,
    key::format_key,
    local::LocalLayer,
    query::Query,
    remote::{self, InvalidationBus, RedisStore, RemoteLayer, RemoteStore},
    sentinel::{self, Lookup},
    singleflight::LoadDeduplicator,
};

/// What a fetcher hands back: the data, `None` when the source confirmed
/// there is nothing, or the reason it could not tell.
pub type FetchResult = Result<Option<Bytes>, BoxError>;

pub(crate) fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey);
    }
    Ok(())
}

struct CacheInner {
    config: CacheConfig,
    local: LocalLayer,
    remote: RemoteLayer,
    bus: Arc<dyn InvalidationBus>,
    loads: LoadDeduplicator<Bytes>,
    invalidation: InvalidationChannel,
}

/// Two-tier cache in front of a data source.
///
/// Cloning is cheap and clones share all state. The invalidation subscription
/// stops when the last clone is dropped.
#[derive(Clone)]
pub struct CascadingCache {
    inner: Arc<CacheInner>,
}

impl CascadingCache {
    /// Build a cache over an explicit remote store and invalidation bus.
    ///
    /// Validates `config`, subscribes to the application's invalidation
    /// topic and starts the task applying it. Must be called inside a Tokio
    /// runtime.
    pub async fn new(
        remote_store: Arc<dyn RemoteStore>,
        bus: Arc<dyn InvalidationBus>,
        config: CacheConfig,
    ) -> Result<Self> {
        config.validate()?;

        let local = LocalLayer::new(config.local_max_capacity);
        let remote = RemoteLayer::new(remote_store, config.remote_timeout);
        let invalidation = InvalidationChannel::start(
            &*bus,
            config.updating_channel(),
            local.clone(),
            remote.clone(),
        )
        .await?;

        Ok(Self {
            inner: Arc::new(CacheInner {
                config,
                local,
                remote,
                bus,
                loads: LoadDeduplicator::new(),
                invalidation,
            }),
        })
    }

    /// Build a cache whose remote layer and invalidation bus are the Redis
    /// server at `redis_url`
    pub async fn connect(redis_url: &str, config: CacheConfig) -> Result<Self> {
        let store = Arc::new(RedisStore::open(redis_url)?);
        Self::new(store.clone(), store, config).await
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Direct access to the in-process layer
    pub fn local(&self) -> &LocalLayer {
        &self.inner.local
    }

    /// Direct access to the shared layer
    pub fn remote(&self) -> &RemoteLayer {
        &self.inner.remote
    }

    /// Topic this cache listens on for invalidations
    pub fn invalidation_topic(&self) -> &str {
        self.inner.invalidation.topic()
    }

    /// Whether invalidations are still being received. Once the subscription
    /// is lost it is not re-established.
    pub fn is_subscribed(&self) -> bool {
        !self.inner.invalidation.is_closed()
    }

    /// Whether `raw` is the negative-value sentinel
    pub fn is_negative(raw: &[u8]) -> bool {
        sentinel::is_negative(raw)
    }

    /// Read `key` through the configured layers without fetching.
    ///
    /// A negative entry comes back as the sentinel bytes; see
    /// [`CascadingCache::is_negative`].
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.get_from(key, self.inner.config.layer).await
    }

    /// Read `key` through `layer` without fetching
    pub async fn get_from(&self, key: &str, layer: LayerMask) -> Result<Option<Bytes>> {
        check_key(key)?;
        Ok(self.get_cascade(key, layer, true).await?.into_payload())
    }

    /// Read `key` from the configured layers, fetching and caching it on a
    /// full miss.
    ///
    /// Concurrent calls for the same key run `fetcher` once between them. A
    /// fetcher returning `Ok(None)` is cached as a negative entry and the
    /// sentinel bytes are returned. A fetcher error is returned to every
    /// waiting caller and nothing is cached.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetcher: F) -> Result<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult>,
    {
        check_key(key)?;

        if let Some(payload) = self
            .get_cascade(key, self.inner.config.layer, true)
            .await?
            .into_payload()
        {
            return Ok(payload);
        }

        self.load(key, fetcher).await
    }

    /// [`CascadingCache::get_or_fetch`] for JSON-encoded values.
    ///
    /// `Ok(None)` means the source has no value for `key`.
    pub async fn get_or_fetch_json<T, F, Fut>(&self, key: &str, fetcher: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, BoxError>>,
    {
        let raw = self
            .get_or_fetch(key, || async move {
                match fetcher().await {
                    Ok(Some(value)) => json::encode(&value).map(Some).map_err(BoxError::from),
                    Ok(None) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await?;
        json::decode(&raw)
    }

    /// Start a fluent query reading `tag` formatted with `args` from cache
    pub fn lookup(&self, tag: &str, args: &[&dyn Display]) -> Query<'_> {
        Query::new(self).lookup(tag, args)
    }

    /// Start a fluent query loading through `fetcher`
    pub fn or_fetch<'a, F, Fut>(&'a self, fetcher: F) -> Query<'a>
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = FetchResult> + Send + 'a,
    {
        Query::new(self).or_fetch(fetcher)
    }

    /// Write to the configured layers
    pub async fn store(&self, key: &str, data: impl Into<Bytes>) -> Result<()> {
        self.write(key, data.into(), self.inner.config.layer).await
    }

    /// Write to the local layer only
    pub async fn store_local(&self, key: &str, data: impl Into<Bytes>) -> Result<()> {
        self.write(key, data.into(), LayerMask::LOCAL).await
    }

    /// Write to the remote layer only
    pub async fn store_remote(&self, key: &str, data: impl Into<Bytes>) -> Result<()> {
        self.write(key, data.into(), LayerMask::REMOTE).await
    }

    /// Write to both layers regardless of configuration
    pub async fn store_both(&self, key: &str, data: impl Into<Bytes>) -> Result<()> {
        self.write(key, data.into(), LayerMask::BOTH).await
    }

    /// Announce that the value behind `tag` formatted with `args` changed.
    ///
    /// Nothing is deleted here. Every subscribed process, this one included,
    /// purges the key when the message reaches it, so a read right after this
    /// returns may still see the old value.
    pub fn update(
        &self,
        tag: &str,
        args: &[&dyn Display],
    ) -> impl Future<Output = Result<()>> + Send {
        self.update_key(format_key(tag, args))
    }

    /// [`CascadingCache::update`] for an already formatted key
    pub async fn update_key(&self, key: String) -> Result<()> {
        check_key(&key)?;
        let payload = Alteration::delete(key).encode();
        remote::with_deadline(
            self.inner.config.remote_timeout,
            self.inner.bus.publish(self.invalidation_topic(), &payload),
        )
        .await?;
        debug!("Published update to {}: {}", self.invalidation_topic(), payload);
        Ok(())
    }

    async fn get_cascade(&self, key: &str, layer: LayerMask, fresh: bool) -> Result<Lookup> {
        let inner = &self.inner;

        match layer.resolve()? {
            Layers::Local => Ok(inner.local.get(key).await),
            Layers::Remote => self.read_remote(key).await,
            Layers::Both => {
                let local = inner.local.get(key).await;
                if local.is_answer() {
                    debug!("Cache hit L1 for key: {}", key);
                    return Ok(local);
                }
                debug!("Cache miss L1 for key: {}", key);

                let remote = self.read_remote(key).await?;
                if fresh && let Some(payload) = remote.clone().into_payload() {
                    inner
                        .local
                        .set(key, payload, inner.config.default_ttl)
                        .await;
                }
                Ok(remote)
            }
        }
    }

    async fn read_remote(&self, key: &str) -> Result<Lookup> {
        match self.inner.remote.get(key).await {
            Ok(lookup) => {
                debug!("Cache read L2 for key: {} (answered: {})", key, lookup.is_answer());
                Ok(lookup)
            }
            Err(e) if self.inner.config.fail_on_remote_error => Err(e),
            Err(e) => {
                warn!("L2 read failed for key {}, treating as miss: {}", key, e);
                Ok(Lookup::Miss)
            }
        }
    }

    /// Run the deduplicated fetch for `key` and write the outcome back.
    ///
    /// Only the caller that actually runs `fetcher` writes back; callers
    /// collapsed onto it get the outcome once the write-back is done.
    pub(crate) async fn load<F, Fut>(&self, key: &str, fetcher: F) -> Result<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult>,
    {
        // the write-back target must be valid before the source is asked
        self.inner.config.layer.resolve()?;

        self.inner
            .loads
            .run(key, || async move {
                let data = match fetcher().await {
                    Ok(Some(data)) => data,
                    Ok(None) => {
                        debug!("Source has no value for key: {}, caching negative entry", key);
                        sentinel::negative()
                    }
                    Err(e) => {
                        error!("Fetch failed for key {}: {}", key, e);
                        return Err(SharedError::from(e));
                    }
                };
                self.fill(key, data.clone()).await;
                Ok(data)
            })
            .await
            .map_err(CacheError::Fetch)
    }

    /// Best-effort write-back after a load
    async fn fill(&self, key: &str, data: Bytes) {
        if let Err(e) = self
            .write(key, data, self.inner.config.layer)
            .await
        {
            warn!("Write-back after fetch failed for key {}: {}. Continuing.", key, e);
        }
    }

    async fn write(&self, key: &str, data: Bytes, layer: LayerMask) -> Result<()> {
        check_key(key)?;
        let layers = layer.resolve()?;
        let inner = &self.inner;
        let ttl = inner.config.default_ttl;

        match layers {
            Layers::Local => {
                inner.local.set(key, data, ttl).await;
            }
            Layers::Remote => {
                inner.remote.set_force(key, &data, ttl).await?;
            }
            Layers::Both => {
                // remote first: a failed remote write must not leave a local copy behind
                inner.remote.set_force(key, &data, ttl).await?;
                inner.local.set(key, data, ttl).await;
            }
        }
        Ok(())
    }
}
