//! Payer-facing session operations: start, poll, cancel, receipt.

use crate::config::SettlementConfig;
use crate::database::ledger_repository::IdempotencyLedger;
use crate::error::{
    AppError, AppErrorKind, AppResult, DomainError, ExternalError, InfrastructureError,
    ValidationError,
};
use crate::logging::mask_user_id;
use crate::payments::gateway::PaymentGateway;
use crate::payments::types::{InvoiceDisplay, InvoiceRequest};
use crate::services::receipt::redact_receipt;
use crate::services::verification::PaymentVerifier;
use crate::sessions::model::{
    settlement_amount, CartSnapshot, PaymentSession, ReceiptStatus, SessionStatus,
};
use crate::sessions::store::SessionStore;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct SessionCreated {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub invoice_id: String,
    pub expected_amount: i64,
    pub currency: String,
    pub invoice: InvoiceDisplay,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatusView {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub invoice_id: Option<String>,
    pub order_ids: Vec<String>,
    pub paid_amount: Option<Decimal>,
    pub expected_amount: i64,
    pub currency: String,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReceiptView {
    pub session_id: Uuid,
    pub status: ReceiptStatus,
    pub receipt_id: Option<String>,
    pub data: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
    pub settlement: SettlementConfig,
    /// Public base URL the gateway calls back on.
    pub callback_base_url: String,
    /// Minimum gap between gateway checks triggered by status polls.
    pub check_cooldown: Duration,
}

pub struct SessionService {
    sessions: Arc<dyn SessionStore>,
    ledger: Arc<dyn IdempotencyLedger>,
    gateway: Arc<dyn PaymentGateway>,
    verifier: Arc<PaymentVerifier>,
    config: SessionServiceConfig,
}

impl SessionService {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        ledger: Arc<dyn IdempotencyLedger>,
        gateway: Arc<dyn PaymentGateway>,
        verifier: Arc<PaymentVerifier>,
        config: SessionServiceConfig,
    ) -> Self {
        Self {
            sessions,
            ledger,
            gateway,
            verifier,
            config,
        }
    }

    /// Snapshot the cart, open a gateway invoice and hand back what the
    /// payer needs to pay it.
    pub async fn create_session(
        &self,
        user_id: &str,
        cart: CartSnapshot,
    ) -> AppResult<SessionCreated> {
        cart.validate().map_err(|reason| {
            AppError::new(AppErrorKind::Validation(ValidationError::InvalidCart { reason }))
        })?;

        let expected_amount = settlement_amount(cart.total, self.config.settlement.rate)
            .ok_or_else(|| {
                AppError::new(AppErrorKind::Validation(ValidationError::InvalidAmount {
                    amount: cart.total.to_string(),
                    reason: "converts to a non-positive settlement amount".to_string(),
                }))
            })?;

        let now = Utc::now();
        let session = PaymentSession::new(
            user_id,
            cart,
            expected_amount,
            self.gateway.name().as_str(),
            now,
        );
        let session_id = session.session_id;
        self.sessions.insert(&session).await?;

        let callback_url = self.callback_url(&session)?;
        let request = InvoiceRequest {
            session_id,
            amount: expected_amount,
            description: format!("Order payment {}", session_id),
            callback_url,
        };

        let invoice = match self.gateway.create_invoice(request).await {
            Ok(invoice) => invoice,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Invoice creation failed");
                if let Err(mark) = self
                    .sessions
                    .transition(session_id, SessionStatus::Failed, Utc::now())
                    .await
                {
                    error!(session_id = %session_id, error = %mark, "Failed to mark session failed");
                }
                return Err(AppError::new(AppErrorKind::External(
                    ExternalError::PaymentGateway {
                        provider: self.gateway.name().to_string(),
                        message: e.to_string(),
                        is_retryable: true,
                    },
                ))
                .with_context(format!("create_invoice for session {}", session_id)));
            }
        };

        if !self
            .sessions
            .assign_invoice(session_id, &invoice.invoice_id, Utc::now())
            .await?
        {
            return Err(AppError::internal("invoice already assigned to session"));
        }

        info!(
            session_id = %session_id,
            user_id = %mask_user_id(user_id),
            expected_amount,
            "Payment session started"
        );

        Ok(SessionCreated {
            session_id,
            status: SessionStatus::Pending,
            invoice_id: invoice.invoice_id,
            expected_amount,
            currency: self.config.settlement.currency.clone(),
            invoice: invoice.display,
        })
    }

    /// Current status. A live session with an invoice is re-checked against
    /// the gateway when its cooldown allows.
    pub async fn session_status(&self, user_id: &str, session_id: Uuid) -> AppResult<SessionStatusView> {
        let mut session = self.owned_session(user_id, session_id).await?;

        if !session.status.is_terminal() && session.invoice_id.is_some() {
            let now = Utc::now();
            let cutoff = now
                - chrono::Duration::from_std(self.config.check_cooldown)
                    .unwrap_or_else(|_| chrono::Duration::seconds(20));

            if self.sessions.claim_check(session_id, cutoff, now).await? {
                match self.verifier.verify_and_materialize(&session).await {
                    Ok(result) => {
                        debug!(session_id = %session_id, reason = %result.reason, "Status poll check")
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "Status poll check failed")
                    }
                }
                session = self
                    .sessions
                    .get(session_id)
                    .await?
                    .ok_or_else(|| AppError::session_not_found(session_id))?;
            }
        }

        self.status_view(session).await
    }

    /// Owner-initiated cancel. Only PENDING and PAID sessions can be cancelled.
    pub async fn cancel_session(&self, user_id: &str, session_id: Uuid) -> AppResult<SessionStatusView> {
        let session = self.owned_session(user_id, session_id).await?;

        match self
            .sessions
            .transition(session_id, SessionStatus::Cancelled, Utc::now())
            .await?
        {
            Some(cancelled) => {
                info!(session_id = %session_id, "Payment session cancelled");
                self.status_view(cancelled).await
            }
            None => {
                let current = self
                    .sessions
                    .get(session_id)
                    .await?
                    .map(|s| s.status)
                    .unwrap_or(session.status);
                Err(AppError::new(AppErrorKind::Domain(
                    DomainError::InvalidTransition {
                        session_id: session_id.to_string(),
                        from: current.to_string(),
                        to: SessionStatus::Cancelled.to_string(),
                    },
                )))
            }
        }
    }

    /// Receipt outcome with payer PII masked.
    pub async fn receipt(&self, user_id: &str, session_id: Uuid) -> AppResult<ReceiptView> {
        let session = self.owned_session(user_id, session_id).await?;
        let receipt = session.receipt.ok_or_else(|| {
            AppError::new(AppErrorKind::Domain(DomainError::ReceiptNotAvailable {
                session_id: session_id.to_string(),
            }))
        })?;

        Ok(ReceiptView {
            session_id,
            status: receipt.status,
            receipt_id: receipt.receipt_id,
            data: receipt.data.as_ref().map(redact_receipt),
        })
    }

    /// Sessions owned by someone else look exactly like missing ones.
    async fn owned_session(&self, user_id: &str, session_id: Uuid) -> AppResult<PaymentSession> {
        match self.sessions.get(session_id).await? {
            Some(session) if session.is_owned_by(user_id) => Ok(session),
            _ => Err(AppError::session_not_found(session_id)),
        }
    }

    async fn status_view(&self, session: PaymentSession) -> AppResult<SessionStatusView> {
        let order_ids = match session.invoice_id.as_deref() {
            Some(invoice_id) => self
                .ledger
                .find(invoice_id)
                .await?
                .filter(|entry| entry.is_complete())
                .map(|entry| entry.order_ids)
                .unwrap_or_default(),
            None => Vec::new(),
        };

        Ok(SessionStatusView {
            session_id: session.session_id,
            status: session.status,
            invoice_id: session.invoice_id,
            order_ids,
            paid_amount: session.paid_amount,
            expected_amount: session.expected_amount,
            currency: self.config.settlement.currency.clone(),
            cancelled_at: session.cancelled_at,
            updated_at: session.updated_at,
        })
    }

    fn callback_url(&self, session: &PaymentSession) -> AppResult<String> {
        build_callback_url(
            &self.config.callback_base_url,
            session.session_id,
            &session.callback_token,
        )
    }
}

/// `{base}/webhook?sessionId=..&token=..`
pub fn build_callback_url(base: &str, session_id: Uuid, token: &str) -> AppResult<String> {
    let endpoint = format!("{}/webhook", base.trim_end_matches('/'));
    let session_id = session_id.to_string();
    Url::parse_with_params(&endpoint, &[("sessionId", session_id.as_str()), ("token", token)])
        .map(String::from)
        .map_err(|e| {
            AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Configuration {
                message: format!("invalid callback base url: {}", e),
            }))
        })
}
