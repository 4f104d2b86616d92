//! Cache error types

use std::{sync::Arc, time::Duration};

use redis::RedisError;

/// A loader error shared by every caller collapsed onto the same load
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Boxed error returned by caller-supplied fetchers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("unsupported layer mask: {0}")]
    InvalidLayerMask(u8),

    #[error("cache key is empty")]
    InvalidKey,

    #[error("fetch error: {0}")]
    Fetch(SharedError),

    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("remote store did not answer within {0:?}")]
    RemoteTimeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CacheError {
    /// Whether the error came from talking to the remote store
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            CacheError::Redis(_) | CacheError::Pool(_) | CacheError::RemoteTimeout(_)
        )
    }
}
