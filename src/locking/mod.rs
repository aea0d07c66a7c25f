//! Cross-replica job locks
//!
//! A lock is a key with a TTL and a per-holder token. Release only deletes
//! the key while the token still matches, so a holder that overran its TTL
//! cannot free a lock someone else now holds. A crashed holder's lock lapses
//! on its own.

pub mod memory;
pub mod redis_lock;

pub use memory::MemoryLock;
pub use redis_lock::RedisLock;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend unavailable: {0}")]
    Unavailable(String),

    #[error("lock command failed: {0}")]
    Command(String),
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Command(err.to_string())
    }
}

impl From<bb8::RunError<redis::RedisError>> for LockError {
    fn from(err: bb8::RunError<redis::RedisError>) -> Self {
        LockError::Unavailable(err.to_string())
    }
}

/// Proof of holding a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub token: String,
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// `Ok(None)` when someone else holds the lock.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, LockError>;

    /// Returns false if the lease had already lapsed or been taken over.
    async fn release(&self, lease: &LockLease) -> Result<bool, LockError>;
}
