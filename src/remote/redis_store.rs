//! Redis-backed remote store.
//!
//! Key commands go through a deadpool connection pool: each operation checks
//! out one connection and returns it when the operation ends, on error paths
//! too. Subscriptions use a dedicated pub/sub connection from the client.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use futures::{StreamExt, stream::BoxStream};
use redis::AsyncCommands;
use tracing::{debug, warn};

use super::{InvalidationBus, RemoteStore};
use crate::{CacheError, error::Result};

/// `PX` takes whole milliseconds and rejects zero
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    client: redis::Client,
}

impl RedisStore {
    /// Open a pool and a pub/sub client for `redis_url`
    pub fn open(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::Config(format!("failed to create Redis pool: {e}")))?;
        Ok(Self { pool, client })
    }

    /// Use an existing pool; `client` must point at the same server
    pub fn from_parts(pool: Pool, client: redis::Client) -> Self {
        Self { pool, client }
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn set_if_absent(&self, key: &str, data: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(data)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.as_deref() == Some("OK"))
    }

    async fn set_force(&self, key: &str, data: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(data)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.pool.get().await?;
        let raw: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(raw)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl InvalidationBus for RedisStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        conn.publish::<_, _, ()>(channel, payload).await?;
        debug!("Published to channel {}: {}", channel, payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        debug!("Subscribed to channel {}", channel);

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(
                        "Failed to decode pub/sub payload on {}: {}",
                        msg.get_channel_name(),
                        e
                    );
                    None
                }
            }
        });

        Ok(stream.boxed())
    }
}
