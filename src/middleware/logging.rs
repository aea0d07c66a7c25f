//! Request id generation and per-request logging

use axum::{
    extract::Request,
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tower_http::request_id::{MakeRequestId, RequestId};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

/// Generates a v4 UUID for requests that arrive without `x-request-id`.
#[derive(Clone, Copy, Default)]
pub struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _request: &http::Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Logs method, path, status and latency for every request inside a span
/// carrying the request id.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    // Path only: query strings carry callback tokens
    let path = request.uri().path().to_string();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let span = tracing::info_span!("http_request", request_id = %request_id, method = %method, path = %path);
    let start = Instant::now();

    let response = next.run(request).instrument(span.clone()).await;

    let elapsed_ms = start.elapsed().as_millis() as u64;
    let status = response.status();
    let _enter = span.enter();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        warn!(status = status.as_u16(), elapsed_ms, "Request completed with error");
    } else {
        info!(status = status.as_u16(), elapsed_ms, "Request completed");
    }

    response
}
