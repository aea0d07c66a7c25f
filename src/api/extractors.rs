//! Request extractors shared by the HTTP handlers

use crate::error::{AppError, AppErrorKind, DomainError};
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use std::convert::Infallible;

/// Header the upstream auth layer sets to the caller's account id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Caller identity as established upstream. Missing identity is a 401.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = crate::middleware::error::get_request_id_from_headers(&parts.headers);
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| AuthenticatedUser(value.to_string()))
            .ok_or_else(|| {
                let err = AppError::new(AppErrorKind::Domain(DomainError::Unauthenticated));
                match request_id {
                    Some(id) => err.with_request_id(id),
                    None => err,
                }
            })
    }
}

/// Request id set by the request-id layer, if any.
#[derive(Debug, Clone, Default)]
pub struct RequestId(pub Option<String>);

impl RequestId {
    /// Attach this request id to an error on its way out.
    pub fn tag(&self, err: AppError) -> AppError {
        match &self.0 {
            Some(id) => err.with_request_id(id.clone()),
            None => err,
        }
    }
}

impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(RequestId(crate::middleware::error::get_request_id_from_headers(
            &parts.headers,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<AuthenticatedUser, AppError> {
        let (mut parts, _) = request.into_parts();
        AuthenticatedUser::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_user_header_is_required() {
        let err = extract(Request::builder().body(()).unwrap()).await.unwrap_err();
        assert_eq!(err.status_code(), 401);

        let blank = Request::builder()
            .header(USER_ID_HEADER, "  ")
            .body(())
            .unwrap();
        assert!(extract(blank).await.is_err());
    }

    #[tokio::test]
    async fn test_user_header_is_trimmed() {
        let request = Request::builder()
            .header(USER_ID_HEADER, " user-42 ")
            .body(())
            .unwrap();
        assert_eq!(
            extract(request).await.unwrap(),
            AuthenticatedUser("user-42".to_string())
        );
    }
}
