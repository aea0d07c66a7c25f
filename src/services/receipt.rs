//! Best-effort tax receipt issuance after a session reaches PROCESSED.

use crate::payments::gateway::PaymentGateway;
use crate::payments::types::ReceiptRequest;
use crate::sessions::model::{PaymentSession, ReceiptRecord, ReceiptStatus};
use crate::sessions::store::SessionStore;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Receipt fields that carry payer PII.
const REDACTED_FIELDS: &[&str] = &["ebarimt_receiver", "customer_tin", "phone", "email", "lottery"];

const REDACTED: &str = "[REDACTED]";

pub struct ReceiptIssuer {
    gateway: Arc<dyn PaymentGateway>,
    sessions: Arc<dyn SessionStore>,
    receiver_type: String,
}

impl ReceiptIssuer {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        sessions: Arc<dyn SessionStore>,
        receiver_type: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            sessions,
            receiver_type: receiver_type.into(),
        }
    }

    /// Issue in the background; the caller never waits on the gateway.
    pub fn spawn_issue(self: &Arc<Self>, session: PaymentSession) -> JoinHandle<ReceiptRecord> {
        let issuer = Arc::clone(self);
        tokio::spawn(async move { issuer.issue(&session).await })
    }

    /// Request the receipt and store the outcome on the session.
    pub async fn issue(&self, session: &PaymentSession) -> ReceiptRecord {
        let session_id = session.session_id;

        let record = match session.payment_id.as_deref() {
            None => ReceiptRecord {
                status: ReceiptStatus::Skipped,
                receipt_id: None,
                error: Some("no payment id recorded".to_string()),
                data: None,
            },
            Some(payment_id) => {
                let request = ReceiptRequest {
                    payment_id: payment_id.to_string(),
                    receiver_type: self.receiver_type.clone(),
                    metadata: serde_json::json!({
                        "session_id": session_id.to_string(),
                        "invoice_id": session.invoice_id,
                        "amount": session.expected_amount,
                    }),
                };
                match self.gateway.create_receipt(request).await {
                    Ok(issued) => {
                        info!(session_id = %session_id, receipt_id = %issued.receipt_id, "Receipt issued");
                        ReceiptRecord {
                            status: ReceiptStatus::Issued,
                            receipt_id: Some(issued.receipt_id),
                            error: None,
                            data: Some(issued.data),
                        }
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "Receipt issuance failed");
                        ReceiptRecord {
                            status: ReceiptStatus::Failed,
                            receipt_id: None,
                            error: Some(e.to_string()),
                            data: None,
                        }
                    }
                }
            }
        };

        if let Err(e) = self
            .sessions
            .update_receipt(session_id, &record, Utc::now())
            .await
        {
            warn!(session_id = %session_id, error = %e, "Failed to store receipt outcome");
        }
        record
    }
}

/// Copy of `data` with PII fields masked at any depth.
pub fn redact_receipt(data: &JsonValue) -> JsonValue {
    match data {
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(key, value)| {
                    let value = if REDACTED_FIELDS.contains(&key.as_str()) && !value.is_null() {
                        JsonValue::String(REDACTED.to_string())
                    } else {
                        redact_receipt(value)
                    };
                    (key.clone(), value)
                })
                .collect(),
        ),
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(redact_receipt).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_nested_pii() {
        let data = serde_json::json!({
            "id": "R-1",
            "amount": 15000,
            "lottery": "AB 12345678",
            "ebarimt_receiver": "88001122",
            "details": [{"phone": "99112233", "name": "Tea"}],
            "customer": {"email": "a@b.mn", "customer_tin": null}
        });

        let redacted = redact_receipt(&data);
        assert_eq!(redacted["id"], "R-1");
        assert_eq!(redacted["amount"], 15000);
        assert_eq!(redacted["lottery"], REDACTED);
        assert_eq!(redacted["ebarimt_receiver"], REDACTED);
        assert_eq!(redacted["details"][0]["phone"], REDACTED);
        assert_eq!(redacted["details"][0]["name"], "Tea");
        assert_eq!(redacted["customer"]["email"], REDACTED);
        assert!(redacted["customer"]["customer_tin"].is_null());
    }
}
