//! Cache configuration

use std::{fmt, time::Duration};

use crate::{CacheError, error::Result};

/// Selects which layers take part in a read cascade or a write fan-out.
///
/// The mask is a raw bitset so it can come from untyped configuration. Only
/// [`LayerMask::LOCAL`], [`LayerMask::REMOTE`] and [`LayerMask::BOTH`] are
/// supported; anything else is rejected when an operation uses it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerMask(u8);

impl LayerMask {
    pub const LOCAL: LayerMask = LayerMask(1);
    pub const REMOTE: LayerMask = LayerMask(2);
    pub const BOTH: LayerMask = LayerMask(1 | 2);

    /// Wrap raw bits without checking them
    pub const fn from_bits(bits: u8) -> Self {
        LayerMask(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub(crate) fn resolve(self) -> Result<Layers> {
        match self {
            LayerMask::LOCAL => Ok(Layers::Local),
            LayerMask::REMOTE => Ok(Layers::Remote),
            LayerMask::BOTH => Ok(Layers::Both),
            LayerMask(bits) => Err(CacheError::InvalidLayerMask(bits)),
        }
    }
}

impl fmt::Debug for LayerMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resolve() {
            Ok(layers) => write!(f, "LayerMask::{layers:?}"),
            Err(_) => write!(f, "LayerMask({})", self.0),
        }
    }
}

/// A layer mask that has been checked against the supported combinations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Layers {
    Local,
    Remote,
    Both,
}

/// Configuration for the cascading cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Layers used by reads and writes that don't name one explicitly
    pub layer: LayerMask,
    /// Time-to-live for every entry in both layers, negative entries included
    pub default_ttl: Duration,
    /// Maximum number of entries in the local layer
    pub local_max_capacity: u64,
    /// First segment of the invalidation topic
    pub namespace: String,
    /// Application identifier; processes sharing it invalidate each other
    pub app_id: String,
    /// Deadline applied to each remote-store operation
    pub remote_timeout: Option<Duration>,
    /// Surface remote read failures instead of treating them as misses
    pub fail_on_remote_error: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            layer: LayerMask::LOCAL,
            default_ttl: Duration::from_secs(10),
            local_max_capacity: 10_000,
            namespace: "cnel".to_owned(),
            app_id: "default".to_owned(),
            remote_timeout: None,
            fail_on_remote_error: true,
        }
    }
}

impl CacheConfig {
    pub fn with_layer(mut self, layer: LayerMask) -> Self {
        self.layer = layer;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_local_max_capacity(mut self, capacity: u64) -> Self {
        self.local_max_capacity = capacity;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = Some(timeout);
        self
    }

    pub fn with_fail_on_remote_error(mut self, fail: bool) -> Self {
        self.fail_on_remote_error = fail;
        self
    }

    /// Name of the pub/sub topic carrying invalidations for this application
    pub fn updating_channel(&self) -> String {
        format!("{}:updating:{}", self.namespace, self.app_id)
    }

    /// Check everything that can be checked before the cache exists.
    ///
    /// The layer mask is deliberately left alone: an unsupported mask is
    /// reported by the operation that uses it.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(CacheError::Config("namespace must not be empty".to_owned()));
        }
        if self.app_id.is_empty() {
            return Err(CacheError::Config("app_id must not be empty".to_owned()));
        }
        if self.default_ttl.is_zero() {
            return Err(CacheError::Config("default_ttl must be positive".to_owned()));
        }
        if self.remote_timeout.is_some_and(|t| t.is_zero()) {
            return Err(CacheError::Config(
                "remote_timeout must be positive when set".to_owned(),
            ));
        }
        Ok(())
    }
}
