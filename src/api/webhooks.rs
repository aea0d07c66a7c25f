use crate::api::extractors::RequestId;
use crate::api::AppState;
use crate::error::{AppError, AppErrorKind, DomainError};
use crate::payments::utils::secure_eq;
use crate::services::verification::ProcessingResult;
use crate::services::webhook_ingress::{WebhookAuth, WebhookRequest};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use uuid::Uuid;

pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackQuery {
    pub session_id: Option<String>,
    pub token: Option<String>,
}

/// The only body fields ever read. Everything else, including any status
/// claim, is kept for the audit log and otherwise ignored.
#[derive(Debug, Default)]
struct WebhookBody {
    invoice_id: Option<String>,
    session_id: Option<String>,
}

const INVOICE_ID_FIELDS: [&str; 3] = ["invoice_id", "invoiceId", "object_id"];
const SESSION_ID_FIELDS: [&str; 2] = ["session_id", "sessionId"];

impl WebhookBody {
    /// First non-empty string among `names`, in order.
    fn field(payload: &JsonValue, names: &[&str]) -> Option<String> {
        names.iter().find_map(|name| {
            payload
                .get(*name)
                .and_then(JsonValue::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        })
    }

    fn from_payload(payload: &JsonValue) -> Self {
        Self {
            invoice_id: Self::field(payload, &INVOICE_ID_FIELDS),
            session_id: Self::field(payload, &SESSION_ID_FIELDS),
        }
    }
}

fn parse_body(body: &Bytes) -> (JsonValue, WebhookBody) {
    if body.is_empty() {
        return (JsonValue::Null, WebhookBody::default());
    }
    match serde_json::from_slice::<JsonValue>(body) {
        Ok(payload) => {
            let fields = WebhookBody::from_payload(&payload);
            if fields.invoice_id.is_none() {
                debug!("Webhook body carries no invoice id");
            }
            (payload, fields)
        }
        Err(e) => {
            warn!(error = %e, "Webhook body is not JSON");
            (JsonValue::Null, WebhookBody::default())
        }
    }
}

fn parse_session_id(raw: Option<&str>) -> Option<Uuid> {
    raw.and_then(|value| Uuid::parse_str(value.trim()).ok())
}

/// POST /webhook?sessionId=&token=
///
/// Always 200; the outcome is in the body.
pub async fn public_webhook(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Json<ProcessingResult> {
    let (payload, fields) = parse_body(&body);

    let request = WebhookRequest {
        session_id: parse_session_id(query.session_id.as_deref()),
        invoice_id: fields.invoice_id,
        auth: WebhookAuth::Public {
            token: query.token.unwrap_or_default(),
        },
        payload,
    };
    Json(state.webhooks.handle(request).await)
}

/// POST /internal/webhook
pub async fn internal_webhook(
    State(state): State<AppState>,
    request_id: RequestId,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ProcessingResult>, AppError> {
    let presented = headers
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if presented.is_empty() || !secure_eq(presented.as_bytes(), state.internal_token.as_bytes()) {
        warn!("Internal webhook rejected");
        return Err(request_id.tag(AppError::new(AppErrorKind::Domain(
            DomainError::Unauthenticated,
        ))));
    }

    let (payload, fields) = parse_body(&body);
    let request = WebhookRequest {
        session_id: parse_session_id(fields.session_id.as_deref()),
        invoice_id: fields.invoice_id,
        auth: WebhookAuth::Internal,
        payload,
    };
    Ok(Json(state.webhooks.handle(request).await))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_aliases() {
        let body = Bytes::from_static(br#"{"object_id":"INV-7","sessionId":"x","payment_status":"PAID"}"#);
        let (payload, fields) = parse_body(&body);
        assert_eq!(fields.invoice_id.as_deref(), Some("INV-7"));
        assert_eq!(fields.session_id.as_deref(), Some("x"));
        assert_eq!(payload["payment_status"], "PAID");
    }

    #[test]
    fn test_body_with_several_invoice_fields_keeps_the_canonical_one() {
        let body = Bytes::from_static(
            br#"{"invoice_id":"INV-1","object_id":"INV-1","session_id":" abc "}"#,
        );
        let (_, fields) = parse_body(&body);
        assert_eq!(fields.invoice_id.as_deref(), Some("INV-1"));
        assert_eq!(fields.session_id.as_deref(), Some("abc"));

        let body = Bytes::from_static(br#"{"invoice_id":"","object_id":"INV-2"}"#);
        let (_, fields) = parse_body(&body);
        assert_eq!(fields.invoice_id.as_deref(), Some("INV-2"));
    }

    #[test]
    fn test_garbage_body_is_tolerated() {
        let (payload, fields) = parse_body(&Bytes::from_static(b"not json"));
        assert!(payload.is_null());
        assert!(fields.invoice_id.is_none());
    }

    #[test]
    fn test_session_id_parsing() {
        let id = Uuid::new_v4();
        assert_eq!(parse_session_id(Some(&id.to_string())), Some(id));
        assert_eq!(parse_session_id(Some("nope")), None);
        assert_eq!(parse_session_id(None), None);
    }
}
