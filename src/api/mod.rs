//! HTTP surface: payer session endpoints, webhook ingress and probes.

pub mod extractors;
pub mod health;
pub mod sessions;
pub mod webhooks;

use crate::health::HealthChecker;
use crate::middleware::logging::{request_logging_middleware, UuidRequestId};
use crate::services::webhook_ingress::WebhookIngress;
use crate::sessions::service::SessionService;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionService>,
    pub webhooks: Arc<WebhookIngress>,
    pub health: HealthChecker,
    /// Shared secret expected in `x-internal-token`.
    pub internal_token: Arc<str>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sessions", post(sessions::create_session))
        .route("/sessions/{session_id}/status", get(sessions::session_status))
        .route("/sessions/{session_id}/cancel", post(sessions::cancel_session))
        .route("/sessions/{session_id}/receipt", get(sessions::session_receipt))
        .route("/webhook", post(webhooks::public_webhook))
        .route("/internal/webhook", post(webhooks::internal_webhook))
        .route("/health", get(health::health))
        .route("/health/ready", get(health::readiness))
        .route("/health/live", get(health::liveness))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
        .with_state(state)
}
