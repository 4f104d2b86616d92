//! tiercache - Two-tier read-through cache
//!
//! This library puts a two-layer cache in front of any data source:
//! - L1: In-memory Moka cache (per process)
//! - L2: Redis (shared across processes)
//! - Source: a caller-supplied fetcher, run on a miss in both layers
//!
//! The cache supports:
//! - Layer selection per cache (local, remote or both)
//! - Collapsing concurrent misses on one key into a single fetch
//! - Negative caching of keys the source confirmed absent
//! - Redis pub/sub invalidation across every process of an application
//! - Fluent queries with printf-style key templates

mod cache;
mod config;
mod error;
mod invalidation;
pub mod json;
mod key;
mod local;
mod query;
pub mod remote;
mod sentinel;
mod singleflight;

pub use cache::{CascadingCache, FetchResult};
pub use config::{CacheConfig, LayerMask};
pub use error::{BoxError, CacheError, Result, SharedError};
pub use invalidation::{Alteration, OP_DELETE, Operation};
pub use key::format_key;
pub use local::LocalLayer;
pub use query::Query;
pub use remote::{InvalidationBus, MemoryStore, RedisStore, RemoteLayer, RemoteStore};
pub use sentinel::{Lookup, NEGATIVE_VALUE, is_negative};
pub use singleflight::{LoadDeduplicator, Outcome};

// Re-export async_trait for implementors of the store traits
pub use async_trait::async_trait;
