//! Shared verify-and-materialize routine
//!
//! Both confirmation paths (webhook ingress and the reconciliation sweep)
//! funnel into [`PaymentVerifier::verify_and_materialize`]. The gateway's
//! payment check is the only input that can mark a session paid; the webhook
//! body is never trusted for that.

use crate::database::error::DatabaseError;
use crate::database::ledger_repository::{IdempotencyLedger, LedgerEntry, LedgerInsert};
use crate::payments::error::PaymentError;
use crate::payments::gateway::PaymentGateway;
use crate::payments::types::PaymentCheck;
use crate::services::order_materializer::OrderMaterializer;
use crate::services::receipt::ReceiptIssuer;
use crate::sessions::model::{PaymentSession, SessionStatus};
use crate::sessions::store::SessionStore;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a caller that lost the ledger race waits for the winner to
/// record its order ids before answering IN_PROGRESS.
const IN_FLIGHT_WAIT: Duration = Duration::from_secs(3);
const IN_FLIGHT_POLL: Duration = Duration::from_millis(25);

/// Outcome code reported to webhook callers and recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingReason {
    Processed,
    Duplicate,
    SessionMissing,
    NotPaid,
    AmountMismatch,
    InvoiceMismatch,
    Denied,
    GatewayUnavailable,
    SessionClosed,
    NoInvoice,
    /// Another caller holds a live materialization claim for the invoice.
    InProgress,
    InternalError,
}

impl ProcessingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingReason::Processed => "PROCESSED",
            ProcessingReason::Duplicate => "DUPLICATE",
            ProcessingReason::SessionMissing => "SESSION_MISSING",
            ProcessingReason::NotPaid => "NOT_PAID",
            ProcessingReason::AmountMismatch => "AMOUNT_MISMATCH",
            ProcessingReason::InvoiceMismatch => "INVOICE_MISMATCH",
            ProcessingReason::Denied => "DENIED",
            ProcessingReason::GatewayUnavailable => "GATEWAY_UNAVAILABLE",
            ProcessingReason::SessionClosed => "SESSION_CLOSED",
            ProcessingReason::NoInvoice => "NO_INVOICE",
            ProcessingReason::InProgress => "IN_PROGRESS",
            ProcessingReason::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ProcessingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingResult {
    pub reason: ProcessingReason,
    pub session_id: Option<Uuid>,
    pub order_ids: Vec<String>,
}

impl ProcessingResult {
    pub fn new(reason: ProcessingReason, session_id: Option<Uuid>) -> Self {
        Self {
            reason,
            session_id,
            order_ids: Vec::new(),
        }
    }

    pub fn with_orders(mut self, order_ids: Vec<String>) -> Self {
        self.order_ids = order_ids;
        self
    }
}

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("gateway error: {0}")]
    Gateway(#[from] PaymentError),

    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("order materialization failed: {0}")]
    Materialization(DatabaseError),
}

impl VerificationError {
    /// Outcome code for callers that must answer with a reason, not an error.
    pub fn reason(&self) -> ProcessingReason {
        match self {
            VerificationError::Gateway(_) => ProcessingReason::GatewayUnavailable,
            VerificationError::Storage(_) | VerificationError::Materialization(_) => {
                ProcessingReason::InternalError
            }
        }
    }
}

/// A payment the gateway confirmed for a specific invoice.
///
/// Only [`PaymentVerifier`] builds these, so order materialization can never be
/// driven by an unverified payload.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedPayment {
    invoice_id: String,
    payment_id: Option<String>,
    paid_amount: Decimal,
    verified_at: DateTime<Utc>,
}

impl VerifiedPayment {
    pub fn invoice_id(&self) -> &str {
        &self.invoice_id
    }

    pub fn payment_id(&self) -> Option<&str> {
        self.payment_id.as_deref()
    }

    pub fn paid_amount(&self) -> Decimal {
        self.paid_amount
    }

    pub fn verified_at(&self) -> DateTime<Utc> {
        self.verified_at
    }

    #[cfg(test)]
    pub(crate) fn for_tests(invoice_id: &str, paid_amount: Decimal) -> Self {
        Self {
            invoice_id: invoice_id.to_string(),
            payment_id: Some(format!("pay-{}", invoice_id)),
            paid_amount,
            verified_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PaymentEvaluation {
    Paid {
        payment_id: Option<String>,
        paid_amount: Decimal,
    },
    NotPaid,
    AmountMismatch {
        paid_amount: Decimal,
    },
}

/// Paid iff the gateway shows a PAID row and the paid amount is within one
/// minor unit of what the session expects.
pub fn evaluate(check: &PaymentCheck, expected_amount: i64) -> PaymentEvaluation {
    if !check.has_paid_row() {
        return PaymentEvaluation::NotPaid;
    }

    let delta = (check.paid_amount - Decimal::from(expected_amount)).abs();
    if delta < Decimal::ONE {
        PaymentEvaluation::Paid {
            payment_id: check.paid_payment_id().map(str::to_string),
            paid_amount: check.paid_amount,
        }
    } else {
        PaymentEvaluation::AmountMismatch {
            paid_amount: check.paid_amount,
        }
    }
}

enum Ownership {
    Owned(LedgerEntry),
    Settled(ProcessingResult),
}

pub struct PaymentVerifier {
    sessions: Arc<dyn SessionStore>,
    ledger: Arc<dyn IdempotencyLedger>,
    gateway: Arc<dyn PaymentGateway>,
    materializer: Arc<dyn OrderMaterializer>,
    receipts: Option<Arc<ReceiptIssuer>>,
    claim_lease: chrono::Duration,
}

impl PaymentVerifier {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        ledger: Arc<dyn IdempotencyLedger>,
        gateway: Arc<dyn PaymentGateway>,
        materializer: Arc<dyn OrderMaterializer>,
        claim_lease: std::time::Duration,
    ) -> Self {
        Self {
            sessions,
            ledger,
            gateway,
            materializer,
            receipts: None,
            claim_lease: chrono::Duration::from_std(claim_lease)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
        }
    }

    /// Issue receipts after a session reaches PROCESSED.
    pub fn with_receipts(mut self, receipts: Arc<ReceiptIssuer>) -> Self {
        self.receipts = Some(receipts);
        self
    }

    pub async fn verify_and_materialize(
        &self,
        session: &PaymentSession,
    ) -> Result<ProcessingResult, VerificationError> {
        let session_id = session.session_id;
        let Some(invoice_id) = session.invoice_id.as_deref() else {
            return Ok(ProcessingResult::new(
                ProcessingReason::NoInvoice,
                Some(session_id),
            ));
        };

        match session.status {
            SessionStatus::Failed => {
                return Ok(ProcessingResult::new(
                    ProcessingReason::SessionClosed,
                    Some(session_id),
                ));
            }
            SessionStatus::Processed => {
                // Ledger row may already be gone to retention; never rematerialize
                let order_ids = self
                    .ledger
                    .find(invoice_id)
                    .await?
                    .map(|entry| entry.order_ids)
                    .unwrap_or_default();
                return Ok(
                    ProcessingResult::new(ProcessingReason::Duplicate, Some(session_id))
                        .with_orders(order_ids),
                );
            }
            _ => {}
        }

        let check = self.gateway.check_payment(invoice_id).await?;
        let payment = match evaluate(&check, session.expected_amount) {
            PaymentEvaluation::NotPaid => {
                debug!(session_id = %session_id, "Invoice not paid yet");
                return Ok(ProcessingResult::new(
                    ProcessingReason::NotPaid,
                    Some(session_id),
                ));
            }
            PaymentEvaluation::AmountMismatch { paid_amount } => {
                warn!(
                    session_id = %session_id,
                    expected_amount = session.expected_amount,
                    paid_amount = %paid_amount,
                    "Paid amount does not match session"
                );
                return Ok(ProcessingResult::new(
                    ProcessingReason::AmountMismatch,
                    Some(session_id),
                ));
            }
            PaymentEvaluation::Paid {
                payment_id,
                paid_amount,
            } => VerifiedPayment {
                invoice_id: invoice_id.to_string(),
                payment_id,
                paid_amount,
                verified_at: Utc::now(),
            },
        };

        self.settle(session, &payment).await
    }

    async fn settle(
        &self,
        session: &PaymentSession,
        payment: &VerifiedPayment,
    ) -> Result<ProcessingResult, VerificationError> {
        let session_id = session.session_id;
        let now = payment.verified_at;

        self.sessions
            .record_payment(session_id, payment.payment_id(), payment.paid_amount, now)
            .await?;
        if self
            .sessions
            .transition(session_id, SessionStatus::Paid, now)
            .await?
            .is_some()
        {
            info!(session_id = %session_id, "Session marked paid");
        }

        let claim_token = Uuid::new_v4();
        let claim = match self
            .ledger
            .try_create(&payment.invoice_id, session_id, claim_token, now)
            .await?
        {
            LedgerInsert::Created(entry) => entry,
            LedgerInsert::AlreadyExists => {
                match self.resolve_existing(session, payment, claim_token, now).await? {
                    Ownership::Owned(entry) => entry,
                    Ownership::Settled(result) => return Ok(result),
                }
            }
        };

        self.materialize_owned(session, payment, claim.claim_token)
            .await
    }

    async fn resolve_existing(
        &self,
        session: &PaymentSession,
        payment: &VerifiedPayment,
        claim_token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Ownership, VerificationError> {
        let session_id = session.session_id;
        let duplicate = ProcessingResult::new(ProcessingReason::Duplicate, Some(session_id));
        let stale_before = now - self.claim_lease;
        let deadline = tokio::time::Instant::now() + IN_FLIGHT_WAIT;

        loop {
            // Retention only removes completed entries
            let Some(entry) = self.ledger.find(&payment.invoice_id).await? else {
                return Ok(Ownership::Settled(duplicate));
            };

            if entry.is_complete() {
                // A crash between ledger completion and the status write leaves PAID behind
                if self
                    .sessions
                    .transition(session_id, SessionStatus::Processed, now)
                    .await?
                    .is_some()
                {
                    info!(session_id = %session_id, "Repaired session status from ledger");
                }
                return Ok(Ownership::Settled(duplicate.with_orders(entry.order_ids)));
            }

            if entry.claim_expired(stale_before) {
                if let Some(entry) = self
                    .ledger
                    .reclaim_stale(&payment.invoice_id, claim_token, stale_before, now)
                    .await?
                {
                    info!(session_id = %session_id, "Took over stale materialization claim");
                    return Ok(Ownership::Owned(entry));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                debug!(session_id = %session_id, "Materialization still in flight elsewhere");
                return Ok(Ownership::Settled(ProcessingResult::new(
                    ProcessingReason::InProgress,
                    Some(session_id),
                )));
            }
            tokio::time::sleep(IN_FLIGHT_POLL).await;
        }
    }

    async fn materialize_owned(
        &self,
        session: &PaymentSession,
        payment: &VerifiedPayment,
        claim_token: Uuid,
    ) -> Result<ProcessingResult, VerificationError> {
        let session_id = session.session_id;

        let order_ids = match self.materializer.materialize(session, payment).await {
            Ok(order_ids) => order_ids,
            Err(e) => {
                if let Err(release) = self
                    .ledger
                    .release_claim(&payment.invoice_id, claim_token)
                    .await
                {
                    warn!(session_id = %session_id, error = %release, "Failed to release ledger claim");
                }
                return Err(VerificationError::Materialization(e));
            }
        };

        let now = Utc::now();
        let completed = self
            .ledger
            .complete(&payment.invoice_id, claim_token, &order_ids, now)
            .await?;
        if !completed {
            warn!(session_id = %session_id, "Ledger claim taken over before completion");
            return Ok(
                ProcessingResult::new(ProcessingReason::Duplicate, Some(session_id))
                    .with_orders(order_ids),
            );
        }

        match self
            .sessions
            .transition(session_id, SessionStatus::Processed, now)
            .await?
        {
            Some(processed) => {
                info!(
                    session_id = %session_id,
                    order_count = order_ids.len(),
                    "Payment verified and orders materialized"
                );
                if let Some(receipts) = &self.receipts {
                    receipts.spawn_issue(processed);
                }
            }
            None => {
                info!(
                    session_id = %session_id,
                    status = %session.status,
                    "Orders materialized for a closed session"
                );
            }
        }

        Ok(
            ProcessingResult::new(ProcessingReason::Processed, Some(session_id))
                .with_orders(order_ids),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::{PaymentRow, PaymentRowStatus};

    fn check(status: PaymentRowStatus, paid: &str) -> PaymentCheck {
        let amount: Decimal = paid.parse().unwrap();
        PaymentCheck {
            paid_amount: amount,
            rows: vec![PaymentRow {
                payment_id: Some("pay-1".to_string()),
                status,
                amount,
            }],
        }
    }

    #[test]
    fn test_exact_amount_is_paid() {
        let result = evaluate(&check(PaymentRowStatus::Paid, "15000"), 15000);
        assert_eq!(
            result,
            PaymentEvaluation::Paid {
                payment_id: Some("pay-1".to_string()),
                paid_amount: Decimal::from(15000),
            }
        );
    }

    #[test]
    fn test_sub_unit_difference_is_tolerated() {
        let result = evaluate(&check(PaymentRowStatus::Paid, "14999.5"), 15000);
        assert!(matches!(result, PaymentEvaluation::Paid { .. }));
    }

    #[test]
    fn test_one_unit_difference_is_a_mismatch() {
        for paid in ["14999", "15001", "1"] {
            let result = evaluate(&check(PaymentRowStatus::Paid, paid), 15000);
            assert!(
                matches!(result, PaymentEvaluation::AmountMismatch { .. }),
                "paid {} should not verify",
                paid
            );
        }
    }

    #[test]
    fn test_no_paid_row_is_not_paid() {
        let result = evaluate(&check(PaymentRowStatus::New, "15000"), 15000);
        assert_eq!(result, PaymentEvaluation::NotPaid);
        assert_eq!(evaluate(&PaymentCheck::unpaid(), 15000), PaymentEvaluation::NotPaid);
    }

    #[test]
    fn test_error_reasons() {
        let gateway = VerificationError::Gateway(PaymentError::Timeout {
            operation: "check_payment".to_string(),
            timeout_secs: 10,
        });
        assert_eq!(gateway.reason(), ProcessingReason::GatewayUnavailable);
        assert_eq!(ProcessingReason::AmountMismatch.to_string(), "AMOUNT_MISMATCH");
    }
}
