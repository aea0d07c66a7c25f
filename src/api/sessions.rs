use crate::api::extractors::{AuthenticatedUser, RequestId};
use crate::api::AppState;
use crate::error::AppError;
use crate::sessions::model::CartSnapshot;
use crate::sessions::service::{ReceiptView, SessionCreated, SessionStatusView};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

/// POST /sessions
pub async fn create_session(
    State(state): State<AppState>,
    request_id: RequestId,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(cart): Json<CartSnapshot>,
) -> Result<(StatusCode, Json<SessionCreated>), AppError> {
    let created = state
        .sessions
        .create_session(&user_id, cart)
        .await
        .map_err(|e| request_id.tag(e))?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /sessions/{session_id}/status
pub async fn session_status(
    State(state): State<AppState>,
    request_id: RequestId,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionStatusView>, AppError> {
    state
        .sessions
        .session_status(&user_id, session_id)
        .await
        .map(Json)
        .map_err(|e| request_id.tag(e))
}

/// POST /sessions/{session_id}/cancel
pub async fn cancel_session(
    State(state): State<AppState>,
    request_id: RequestId,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionStatusView>, AppError> {
    state
        .sessions
        .cancel_session(&user_id, session_id)
        .await
        .map(Json)
        .map_err(|e| request_id.tag(e))
}

/// GET /sessions/{session_id}/receipt
pub async fn session_receipt(
    State(state): State<AppState>,
    request_id: RequestId,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ReceiptView>, AppError> {
    state
        .sessions
        .receipt(&user_id, session_id)
        .await
        .map(Json)
        .map_err(|e| request_id.tag(e))
}
