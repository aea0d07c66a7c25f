//! Typed JSON cache over the Redis pool

use super::error::{CacheError, CacheResult};
use super::RedisPool;
use async_trait::async_trait;
use bb8::PooledConnection;
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::debug;

/// Key/value cache for one value type.
#[async_trait]
pub trait Cache<T>: Send + Sync
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn get(&self, key: &str) -> CacheResult<Option<T>>;
    async fn set(&self, key: &str, value: &T, ttl: Option<Duration>) -> CacheResult<()>;
    async fn delete(&self, key: &str) -> CacheResult<()>;
}

/// Redis-backed cache storing values as JSON strings.
#[derive(Clone)]
pub struct RedisCache {
    pool: RedisPool,
    default_ttl: Duration,
}

impl RedisCache {
    pub fn new(pool: RedisPool, default_ttl: Duration) -> Self {
        Self { pool, default_ttl }
    }

    pub async fn get_connection(
        &self,
    ) -> CacheResult<PooledConnection<'_, RedisConnectionManager>> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl<T> Cache<T> for RedisCache
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> CacheResult<Option<T>> {
        let mut conn = self.get_connection().await?;
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(json) => {
                debug!(key = %key, "cache hit");
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => {
                debug!(key = %key, "cache miss");
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &T, ttl: Option<Duration>) -> CacheResult<()> {
        let json = serde_json::to_string(value)?;
        let ttl = ttl.unwrap_or(self.default_ttl).as_secs().max(1);
        let mut conn = self.get_connection().await?;
        let _: () = conn
            .set_ex(key, json, ttl)
            .await
            .map_err(|e| CacheError::OperationError(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.get_connection().await?;
        let _: i64 = conn.del(key).await?;
        Ok(())
    }
}
