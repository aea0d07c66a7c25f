use crate::api::AppState;
use crate::health::{HealthState, HealthStatus};
use axum::{extract::State, http::StatusCode, Json};
use tracing::{debug, error};

/// GET /health
pub async fn health(
    State(state): State<AppState>,
) -> Result<Json<HealthStatus>, (StatusCode, String)> {
    let health_status = state.health.check_health().await;

    if health_status.status == HealthState::Unhealthy {
        error!("Health check failed - service unhealthy");
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable".to_string(),
        ))
    } else {
        debug!(status = ?health_status.status, "Health check passed");
        Ok(Json(health_status))
    }
}

/// GET /health/ready - every backing store must answer.
pub async fn readiness(
    state: State<AppState>,
) -> Result<Json<HealthStatus>, (StatusCode, String)> {
    health(state).await
}

/// GET /health/live
pub async fn liveness() -> &'static str {
    "OK"
}
