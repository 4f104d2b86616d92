//! Cross-process invalidation over pub/sub.
//!
//! Every cache subscribes to `<namespace>:updating:<app_id>` when it is built
//! and keeps one background task draining that topic. A delete alteration
//! purges the key from the remote and the local layer. Publishers purge the
//! same way: they receive their own message, so purging lives in one place.
//!
//! ```text
//! Process A: cache.update("user:%d", &[&42])
//!   ↓
//! PUBLISH cnel:updating:orders "user:42|DEL"
//!   ↓
//! Process A: DEL user:42, drop local copy
//! Process B: DEL user:42, drop local copy
//! ```
//!
//! When the subscription ends the task logs it and stops. It does not
//! reconnect.

use futures::{StreamExt, stream::BoxStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    local::LocalLayer,
    remote::{InvalidationBus, RemoteLayer},
};

/// Operation token for a purge
pub const OP_DELETE: &str = "DEL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Delete,
    /// Not acted upon; kept so unknown tokens can be logged
    Other(String),
}

impl Operation {
    fn as_str(&self) -> &str {
        match self {
            Operation::Delete => OP_DELETE,
            Operation::Other(op) => op,
        }
    }
}

/// A change notification for one key. Wire format: `<key>|<operation>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alteration {
    pub key: String,
    pub op: Operation,
}

impl Alteration {
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: Operation::Delete,
        }
    }

    pub fn encode(&self) -> String {
        format!("{}|{}", self.key, self.op.as_str())
    }

    /// Split on the last `|`, so keys may contain the separator themselves
    pub fn decode(payload: &str) -> Option<Self> {
        let (key, op) = payload.rsplit_once('|')?;
        if key.is_empty() {
            return None;
        }
        let op = match op {
            OP_DELETE => Operation::Delete,
            other => Operation::Other(other.to_owned()),
        };
        Some(Self {
            key: key.to_owned(),
            op,
        })
    }
}

/// Background subscription that applies alterations to this process's layers
pub(crate) struct InvalidationChannel {
    topic: String,
    handle: JoinHandle<()>,
}

impl InvalidationChannel {
    /// Subscribe before returning, so anything published afterwards is seen
    pub(crate) async fn start(
        bus: &dyn InvalidationBus,
        topic: String,
        local: LocalLayer,
        remote: RemoteLayer,
    ) -> Result<Self> {
        let stream = bus.subscribe(&topic).await?;
        info!("Invalidation subscription started on {}", topic);

        let handle = tokio::spawn(watch(stream, topic.clone(), local, remote));
        Ok(Self { topic, handle })
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    /// The subscription has ended and invalidations are no longer applied
    pub(crate) fn is_closed(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for InvalidationChannel {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn watch(
    mut stream: BoxStream<'static, String>,
    topic: String,
    local: LocalLayer,
    remote: RemoteLayer,
) {
    while let Some(payload) = stream.next().await {
        match Alteration::decode(&payload) {
            Some(Alteration {
                key,
                op: Operation::Delete,
            }) => {
                debug!("Invalidation received for key: {}", key);
                remote.delete(&key).await;
                local.delete(&key).await;
            }
            Some(Alteration { key, op }) => {
                debug!("Ignoring {} alteration for key: {}", op.as_str(), key);
            }
            None => {
                warn!("Unable to decode alteration on {}: {}", topic, payload);
            }
        }
    }

    info!("Invalidation subscription on {} closed", topic);
}
