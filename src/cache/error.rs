//! Errors from the Redis projection and pool

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Redis unreachable or the pool timed out handing out a connection.
    #[error("Cache connection error: {0}")]
    ConnectionError(String),

    /// A cached session no longer decodes, e.g. after a model change.
    #[error("Cache serialization error: {0}")]
    SerializationError(String),

    #[error("Cache operation error: {0}")]
    OperationError(String),
}

impl CacheError {
    /// Stale or undecodable entries are dropped and re-read from Postgres.
    pub fn is_stale_entry(&self) -> bool {
        matches!(self, CacheError::SerializationError(_))
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            CacheError::ConnectionError(err.to_string())
        } else {
            CacheError::OperationError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

impl From<bb8::RunError<redis::RedisError>> for CacheError {
    fn from(err: bb8::RunError<redis::RedisError>) -> Self {
        match err {
            bb8::RunError::User(inner) => inner.into(),
            bb8::RunError::TimedOut => {
                CacheError::ConnectionError("timed out waiting for a pooled connection".to_string())
            }
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
