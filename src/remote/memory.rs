//! In-process stand-in for the remote store.
//!
//! Several caches sharing one `MemoryStore` behave like several processes
//! sharing one Redis: they see the same entries and the same pub/sub
//! messages.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use tokio::{
    sync::{RwLock, broadcast},
    time::Instant,
};
use tracing::warn;

use super::{InvalidationBus, RemoteStore};
use crate::error::Result;

const EVENT_BUFFER: usize = 1024;

struct StoredValue {
    data: Vec<u8>,
    expires_at: Instant,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

type Event = (String, String);

pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoredValue>>,
    events: Mutex<broadcast::Sender<Event>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            entries: RwLock::new(HashMap::new()),
            events: Mutex::new(tx),
        }
    }

    /// End every open subscription, as a dropped pub/sub connection would.
    /// Subscriptions made afterwards work normally.
    pub fn close_subscriptions(&self) {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = tx;
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|v| v.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Expired entries are dropped on every write, so keys that are never read
/// again do not pile up.
fn sweep_expired(entries: &mut HashMap<String, StoredValue>, now: Instant) {
    entries.retain(|_, v| v.is_live(now));
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, data: &[u8], ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        sweep_expired(&mut entries, now);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_owned(),
            StoredValue {
                data: data.to_vec(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn set_force(&self, key: &str, data: &[u8], ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        sweep_expired(&mut entries, now);
        entries.insert(
            key.to_owned(),
            StoredValue {
                data: data.to_vec(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(v) if v.is_live(now) => return Ok(Some(v.data.clone())),
                None => return Ok(None),
                Some(_) => {}
            }
        }
        // expired: drop it on the way out
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|v| !v.is_live(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[async_trait]
impl InvalidationBus for MemoryStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let tx = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        // no subscribers is not an error, as with PUBLISH
        let _ = tx.send((channel.to_owned(), payload.to_owned()));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let rx = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe();
        let channel = channel.to_owned();

        let stream = futures::stream::unfold((rx, channel), |(mut rx, channel)| async move {
            loop {
                match rx.recv().await {
                    Ok((ch, payload)) if ch == channel => return Some((payload, (rx, channel))),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Subscriber on {} lagged, {} messages dropped", channel, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream.boxed())
    }
}
