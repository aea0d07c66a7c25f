use super::{DistributedLock, LockError, LockLease};
use crate::cache::RedisPool;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Delete the key only if it still holds our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// `SET key token NX PX ttl` lock over the shared Redis pool.
#[derive(Clone)]
pub struct RedisLock {
    pool: RedisPool,
}

impl RedisLock {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, LockError> {
        let token = Uuid::new_v4().to_string();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let mut conn = self.pool.get().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut *conn)
            .await?;

        if reply.is_none() {
            debug!(key, "Lock held elsewhere");
            return Ok(None);
        }
        Ok(Some(LockLease {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, lease: &LockLease) -> Result<bool, LockError> {
        let mut conn = self.pool.get().await?;
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut *conn)
            .await?;
        Ok(deleted == 1)
    }
}
