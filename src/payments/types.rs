use crate::payments::error::PaymentError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderName {
    QrGateway,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::QrGateway => "qr_gateway",
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "qr_gateway" | "qpay" => Ok(ProviderName::QrGateway),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported provider: {}", value),
                field: Some("provider".to_string()),
            }),
        }
    }
}

/// Bearer credential returned by the gateway's token exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessCredential {
    pub access_token: String,
    pub expires_in: Duration,
}

#[derive(Debug, Clone)]
pub struct InvoiceRequest {
    pub session_id: Uuid,
    /// Settlement minor units.
    pub amount: i64,
    pub description: String,
    pub callback_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeepLink {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub logo: Option<String>,
    pub link: String,
}

/// What the payer's browser needs to show the invoice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvoiceDisplay {
    pub qr_text: String,
    pub qr_image: Option<String>,
    pub short_url: Option<String>,
    pub deep_links: Vec<DeepLink>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedInvoice {
    pub invoice_id: String,
    pub display: InvoiceDisplay,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentRowStatus {
    New,
    Paid,
    Failed,
    Refunded,
}

impl FromStr for PaymentRowStatus {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_uppercase().as_str() {
            "NEW" => Ok(PaymentRowStatus::New),
            "PAID" => Ok(PaymentRowStatus::Paid),
            "FAILED" => Ok(PaymentRowStatus::Failed),
            "REFUNDED" => Ok(PaymentRowStatus::Refunded),
            other => Err(PaymentError::malformed(
                "check_payment",
                format!("unknown payment status '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRow {
    pub payment_id: Option<String>,
    pub status: PaymentRowStatus,
    /// Settlement minor units.
    pub amount: Decimal,
}

/// Validated answer to "is this invoice paid".
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentCheck {
    /// Settlement minor units.
    pub paid_amount: Decimal,
    pub rows: Vec<PaymentRow>,
}

impl PaymentCheck {
    pub fn unpaid() -> Self {
        Self {
            paid_amount: Decimal::ZERO,
            rows: Vec::new(),
        }
    }

    pub fn has_paid_row(&self) -> bool {
        self.rows
            .iter()
            .any(|row| row.status == PaymentRowStatus::Paid)
    }

    /// Payment id of the first paid row.
    pub fn paid_payment_id(&self) -> Option<&str> {
        self.rows
            .iter()
            .filter(|row| row.status == PaymentRowStatus::Paid)
            .find_map(|row| row.payment_id.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct ReceiptRequest {
    pub payment_id: String,
    pub receiver_type: String,
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptIssued {
    pub receipt_id: String,
    pub data: JsonValue,
}
