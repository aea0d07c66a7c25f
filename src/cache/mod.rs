//! Redis layer shared by the session projection and the job locks
//!
//! Redis is never the source of truth here. Session reads fall back to
//! Postgres when Redis is unavailable, and the job locks only keep
//! replicas from doing the same sweep work twice.

pub mod cache;
pub mod error;
pub mod keys;

pub use cache::{Cache, RedisCache};
pub use error::{CacheError, CacheResult};

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use std::time::Duration;
use tracing::{error, info, warn};

/// Redis connection pool type alias
pub type RedisPool = Pool<RedisConnectionManager>;

/// Redis pool configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Redis connection URL
    pub redis_url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum idle connections
    pub min_idle: u32,
    /// Connection timeout
    pub connection_timeout: Duration,
    /// Maximum lifetime of a connection
    pub max_lifetime: Duration,
    /// Idle timeout before closing connection
    pub idle_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            max_connections: 10,
            min_idle: 2,
            connection_timeout: Duration::from_secs(5),
            max_lifetime: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Initialize the Redis connection pool.
///
/// A failed initial PING is logged but not fatal.
pub async fn init_cache_pool(config: CacheConfig) -> Result<RedisPool, CacheError> {
    info!(
        max_connections = config.max_connections,
        "Initializing Redis pool"
    );

    let manager = RedisConnectionManager::new(config.redis_url.clone()).map_err(|e| {
        error!(error = %e, "Failed to create Redis connection manager");
        CacheError::ConnectionError(e.to_string())
    })?;

    let pool = Pool::builder()
        .max_size(config.max_connections)
        .min_idle(config.min_idle)
        .connection_timeout(config.connection_timeout)
        .max_lifetime(config.max_lifetime)
        .idle_timeout(config.idle_timeout)
        .test_on_check_out(false)
        .build(manager)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to build Redis connection pool");
            CacheError::ConnectionError(e.to_string())
        })?;

    if let Err(e) = test_connection(&pool).await {
        warn!(error = %e, "Initial Redis connection test failed, continuing");
    }

    info!("Redis pool initialized");
    Ok(pool)
}

async fn test_connection(pool: &RedisPool) -> Result<(), CacheError> {
    let mut conn = pool.get().await?;

    let _: String = redis::cmd("PING")
        .query_async(&mut *conn)
        .await
        .map_err(|e| {
            error!(error = %e, "Redis PING failed");
            CacheError::ConnectionError(e.to_string())
        })?;

    Ok(())
}
