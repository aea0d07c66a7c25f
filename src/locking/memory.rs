use super::{DistributedLock, LockError, LockLease};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

/// Single-process lock with the same TTL and token rules as [`super::RedisLock`].
#[derive(Default)]
pub struct MemoryLock {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, LockError> {
        let now = Instant::now();
        let mut held = self.held.lock().await;
        if let Some((_, expires_at)) = held.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4().to_string();
        held.insert(key.to_string(), (token.clone(), now + ttl));
        Ok(Some(LockLease {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, lease: &LockLease) -> Result<bool, LockError> {
        let mut held = self.held.lock().await;
        let ours = matches!(
            held.get(&lease.key),
            Some((token, expires_at)) if *token == lease.token && *expires_at > Instant::now()
        );
        if ours {
            held.remove(&lease.key);
        }
        Ok(ours)
    }
}
