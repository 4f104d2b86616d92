//! Fluent queries over a [`CascadingCache`].
//!
//! ```ignore
//! let profile = cache
//!     .lookup("user:%d", &[&42])
//!     .or_fetch(|| async { load_profile(42).await })
//!     .run()
//!     .await?;
//! ```
//!
//! The fetcher belongs to the query, so concurrent queries on one cache
//! never see each other's fetchers.

use std::{fmt::Display, future::Future};

use bytes::Bytes;
use futures::{FutureExt, future::BoxFuture};

use crate::{
    CascadingCache,
    cache::{FetchResult, check_key},
    error::Result,
    key::format_key,
};

const FROM_CACHE: u8 = 1;
const FROM_SOURCE: u8 = 2;

type BoxFetcher<'a> = Box<dyn FnOnce() -> BoxFuture<'a, FetchResult> + Send + 'a>;

pub struct Query<'a> {
    cache: &'a CascadingCache,
    sources: u8,
    key: String,
    fetcher: Option<BoxFetcher<'a>>,
}

impl<'a> Query<'a> {
    pub(crate) fn new(cache: &'a CascadingCache) -> Self {
        Self {
            cache,
            sources: 0,
            key: String::new(),
            fetcher: None,
        }
    }

    /// Read the key from the cache layers
    pub fn lookup(mut self, tag: &str, args: &[&dyn Display]) -> Self {
        self.sources |= FROM_CACHE;
        self.key = format_key(tag, args);
        self
    }

    /// Set the key without reading it from cache
    pub fn key(mut self, tag: &str, args: &[&dyn Display]) -> Self {
        self.key = format_key(tag, args);
        self
    }

    /// Load through `fetcher` when the cache has nothing
    pub fn or_fetch<F, Fut>(mut self, fetcher: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = FetchResult> + Send + 'a,
    {
        self.sources |= FROM_SOURCE;
        self.fetcher = Some(Box::new(move || fetcher().boxed()));
        self
    }

    /// Execute the query.
    ///
    /// `Ok(None)` means the cache had nothing and there was no fetcher to
    /// ask. A negative entry is returned as the sentinel bytes.
    pub async fn run(self) -> Result<Option<Bytes>> {
        let Query {
            cache,
            sources,
            key,
            fetcher,
        } = self;
        check_key(&key)?;

        if sources & FROM_CACHE != 0
            && let Some(payload) = cache.get(&key).await?
        {
            return Ok(Some(payload));
        }

        match fetcher {
            Some(fetcher) if sources & FROM_SOURCE != 0 => cache.load(&key, fetcher).await.map(Some),
            _ => Ok(None),
        }
    }
}
