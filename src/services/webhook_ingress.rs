//! Webhook entry point for both the gateway callback and trusted internal
//! callers. Every call is answered with a [`ProcessingResult`]; nothing in
//! the request body is trusted beyond which session and invoice to look at.

use crate::database::ledger_repository::IdempotencyLedger;
use crate::database::webhook_audit_repository::{
    WebhookAuditLog, WebhookAuditRecord, WebhookSource,
};
use crate::logging::mask_identifier;
use crate::payments::utils::secure_eq;
use crate::services::verification::{PaymentVerifier, ProcessingReason, ProcessingResult};
use crate::sessions::model::PaymentSession;
use crate::sessions::store::SessionStore;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAuth {
    /// Caller already proved the shared internal secret.
    Internal,
    /// Gateway callback carrying the session's callback token.
    Public { token: String },
}

impl WebhookAuth {
    fn source(&self) -> WebhookSource {
        match self {
            WebhookAuth::Internal => WebhookSource::Internal,
            WebhookAuth::Public { .. } => WebhookSource::Public,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub session_id: Option<Uuid>,
    pub invoice_id: Option<String>,
    pub auth: WebhookAuth,
    pub payload: JsonValue,
}

pub struct WebhookIngress {
    verifier: Arc<PaymentVerifier>,
    sessions: Arc<dyn SessionStore>,
    ledger: Arc<dyn IdempotencyLedger>,
    audit: Arc<dyn WebhookAuditLog>,
}

impl WebhookIngress {
    pub fn new(
        verifier: Arc<PaymentVerifier>,
        sessions: Arc<dyn SessionStore>,
        ledger: Arc<dyn IdempotencyLedger>,
        audit: Arc<dyn WebhookAuditLog>,
    ) -> Self {
        Self {
            verifier,
            sessions,
            ledger,
            audit,
        }
    }

    pub async fn handle(&self, request: WebhookRequest) -> ProcessingResult {
        let result = self.process(&request).await;

        info!(
            source = request.auth.source().as_str(),
            session_id = ?result.session_id,
            invoice_id = %request.invoice_id.as_deref().map(mask_identifier).unwrap_or_default(),
            reason = %result.reason,
            "Webhook handled"
        );
        self.record_audit(&request, &result).await;
        result
    }

    async fn process(&self, request: &WebhookRequest) -> ProcessingResult {
        let internal_error = |session_id| {
            ProcessingResult::new(ProcessingReason::InternalError, session_id)
        };

        // Token check comes before anything else on the public path
        let mut session: Option<PaymentSession> = None;
        if let WebhookAuth::Public { token } = &request.auth {
            let Some(session_id) = request.session_id else {
                return ProcessingResult::new(ProcessingReason::Denied, None);
            };
            match self.sessions.get(session_id).await {
                Ok(Some(found))
                    if secure_eq(found.callback_token.as_bytes(), token.as_bytes()) =>
                {
                    session = Some(found);
                }
                Ok(_) => {
                    warn!(session_id = %session_id, "Webhook callback token rejected");
                    return ProcessingResult::new(ProcessingReason::Denied, Some(session_id));
                }
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "Failed to load session for webhook");
                    return internal_error(Some(session_id));
                }
            }
        }

        // Ledger first: a completed payment is a duplicate even when the
        // caller did not say which session it belongs to
        if let Some(invoice_id) = request.invoice_id.as_deref() {
            if let Some(result) = self.completed_payment(invoice_id, request.session_id).await {
                return result;
            }
        }

        let Some(session_id) = request.session_id else {
            return ProcessingResult::new(ProcessingReason::SessionMissing, None);
        };

        if session.is_none() && request.invoice_id.is_none() {
            session = match self.sessions.get(session_id).await {
                Ok(Some(found)) => Some(found),
                Ok(None) => {
                    return ProcessingResult::new(ProcessingReason::SessionMissing, Some(session_id));
                }
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "Failed to load session for webhook");
                    return internal_error(Some(session_id));
                }
            };
        }

        let invoice_id = match request.invoice_id.clone() {
            Some(invoice_id) => invoice_id,
            None => {
                let Some(invoice_id) = session.as_ref().and_then(|s| s.invoice_id.clone()) else {
                    return ProcessingResult::new(ProcessingReason::NoInvoice, Some(session_id));
                };
                if let Some(result) = self.completed_payment(&invoice_id, Some(session_id)).await {
                    return result;
                }
                invoice_id
            }
        };

        let session = match session {
            Some(session) => session,
            None => match self.sessions.get(session_id).await {
                Ok(Some(session)) => session,
                Ok(None) => {
                    return ProcessingResult::new(
                        ProcessingReason::SessionMissing,
                        Some(session_id),
                    );
                }
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "Failed to load session for webhook");
                    return internal_error(Some(session_id));
                }
            },
        };

        if session.invoice_id.as_deref() != Some(invoice_id.as_str()) {
            warn!(session_id = %session_id, "Webhook invoice does not match session");
            return ProcessingResult::new(ProcessingReason::InvoiceMismatch, Some(session_id));
        }

        match self.verifier.verify_and_materialize(&session).await {
            Ok(result) => result,
            Err(e) => {
                let reason = e.reason();
                if reason == ProcessingReason::GatewayUnavailable {
                    warn!(session_id = %session_id, error = %e, "Gateway unavailable during webhook");
                } else {
                    error!(session_id = %session_id, error = %e, "Webhook processing failed");
                }
                ProcessingResult::new(reason, Some(session_id))
            }
        }
    }

    /// DUPLICATE carrying the recorded order ids when the ledger already holds
    /// a completed entry for `invoice_id`.
    async fn completed_payment(
        &self,
        invoice_id: &str,
        session_id: Option<Uuid>,
    ) -> Option<ProcessingResult> {
        match self.ledger.find(invoice_id).await {
            Ok(Some(entry)) if entry.is_complete() => Some(
                ProcessingResult::new(
                    ProcessingReason::Duplicate,
                    Some(session_id.unwrap_or(entry.session_id)),
                )
                .with_orders(entry.order_ids),
            ),
            Ok(_) => None,
            Err(e) => {
                error!(session_id = ?session_id, error = %e, "Ledger lookup failed");
                Some(ProcessingResult::new(ProcessingReason::InternalError, session_id))
            }
        }
    }

    async fn record_audit(&self, request: &WebhookRequest, result: &ProcessingResult) {
        let record = WebhookAuditRecord {
            id: Uuid::new_v4(),
            source: request.auth.source(),
            session_id: result.session_id.or(request.session_id),
            invoice_id: request.invoice_id.clone(),
            reason: result.reason.as_str().to_string(),
            payload: request.payload.clone(),
            received_at: Utc::now(),
        };
        if let Err(e) = self.audit.record(&record).await {
            warn!(error = %e, "Failed to write webhook audit record");
        }
    }
}
