//! Redis adapter for the engine's session store seam.
//!
//! Records are opaque blobs under `riptide:session:{id}` with the
//! configured TTL; a sorted set indexed by last-active time is kept next to
//! them so operators can inspect or trim the population with plain redis
//! tooling.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use riptide_core::store::{SessionStore, StoreError, StoreMeta};
use tracing::debug;

const INDEX_KEY: &str = "riptide:sessions:by_last_active";

#[derive(Clone)]
pub struct RedisSessionStore {
    redis: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisSessionStore {
    pub async fn connect(url: &str, ttl_seconds: u64) -> Result<Self> {
        let client = Client::open(url).context("invalid redis URL")?;
        let redis = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        Ok(Self { redis, ttl_seconds })
    }

    fn record_key(id: &str) -> String {
        format!("riptide:session:{id}")
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn save(&self, id: &str, record: Bytes, meta: &StoreMeta) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::pipe()
            .cmd("SETEX")
            .arg(Self::record_key(id))
            .arg(self.ttl_seconds)
            .arg(record.as_ref())
            .ignore()
            .cmd("ZADD")
            .arg(INDEX_KEY)
            .arg(meta.last_active)
            .arg(id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)?;
        debug!(target: "riptide::gate", session_id = %id, bytes = record.len(), "record saved");
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Bytes>, StoreError> {
        let mut conn = self.redis.clone();
        let raw: Option<Vec<u8>> = conn.get(Self::record_key(id)).await.map_err(backend)?;
        Ok(raw.map(Bytes::from))
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::pipe()
            .cmd("DEL")
            .arg(Self::record_key(id))
            .ignore()
            .cmd("ZREM")
            .arg(INDEX_KEY)
            .arg(id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend)
    }
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn record_keys_are_namespaced() {
        assert_eq!(RedisSessionStore::record_key("s-42"), "riptide:session:s-42");
    }
}
