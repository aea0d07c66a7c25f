//! Health check module
//! Provides health status for the application and its dependencies

use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info};

use crate::cache::RedisCache;

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
    Skipped,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn skipped(details: &str) -> Self {
        Self {
            status: ComponentState::Skipped,
            response_time_ms: None,
            details: Some(details.to_string()),
        }
    }
}

/// Health checker for the application.
///
/// Either backend may be absent when the service runs with in-process stores.
#[derive(Clone, Default)]
pub struct HealthChecker {
    db_pool: Option<sqlx::PgPool>,
    cache: Option<RedisCache>,
}

impl HealthChecker {
    pub fn new(db_pool: Option<sqlx::PgPool>, cache: Option<RedisCache>) -> Self {
        Self { db_pool, cache }
    }

    /// Check every configured component.
    ///
    /// The database is required; Redis only degrades the service since
    /// session reads fall back to Postgres.
    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();
        let mut database_up = true;
        let mut cache_up = true;

        match &self.db_pool {
            Some(pool) => {
                let component = probe("database", check_database_health(pool)).await;
                database_up = component.status == ComponentState::Up;
                health_status
                    .checks
                    .insert("database".to_string(), component);
            }
            None => {
                health_status.checks.insert(
                    "database".to_string(),
                    ComponentHealth::skipped("in-process store"),
                );
            }
        }

        match &self.cache {
            Some(cache) => {
                let component = probe("cache", check_cache_health(cache)).await;
                cache_up = component.status == ComponentState::Up;
                health_status.checks.insert("cache".to_string(), component);
            }
            None => {
                health_status
                    .checks
                    .insert("cache".to_string(), ComponentHealth::skipped("not configured"));
            }
        }

        health_status.status = match (database_up, cache_up) {
            (true, true) => HealthState::Healthy,
            (true, false) => HealthState::Degraded,
            (false, _) => HealthState::Unhealthy,
        };

        health_status
    }
}

async fn probe<F>(name: &str, check: F) -> ComponentHealth
where
    F: std::future::Future<Output = Result<u128, Box<dyn std::error::Error + Send + Sync>>>,
{
    match timeout(Duration::from_secs(5), check).await {
        Ok(Ok(response_time)) => {
            info!(component = name, response_time_ms = response_time as u64, "Health check OK");
            ComponentHealth::up(Some(response_time))
        }
        Ok(Err(e)) => {
            error!(component = name, error = %e, "Health check failed");
            ComponentHealth::down(Some(e.to_string()))
        }
        Err(_) => {
            error!(component = name, "Health check timed out");
            ComponentHealth::down(Some("Timeout".to_string()))
        }
    }
}

pub async fn check_database_health(
    pool: &sqlx::PgPool,
) -> Result<u128, Box<dyn std::error::Error + Send + Sync>> {
    let start = Instant::now();

    match sqlx::query("SELECT 1").fetch_one(pool).await {
        Ok(_) => Ok(start.elapsed().as_millis()),
        Err(e) => Err(Box::new(e)),
    }
}

pub async fn check_cache_health(
    cache: &RedisCache,
) -> Result<u128, Box<dyn std::error::Error + Send + Sync>> {
    let start = Instant::now();

    let mut conn = cache.get_connection().await?;
    let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
    Ok(start.elapsed().as_millis())
}
