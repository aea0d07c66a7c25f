use crate::config::GatewayConfig;
use crate::logging::log_external_call;
use crate::payments::credentials::{CredentialCache, CredentialSource};
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::gateway::PaymentGateway;
use crate::payments::types::{
    AccessCredential, CreatedInvoice, DeepLink, InvoiceDisplay, InvoiceRequest, PaymentCheck,
    PaymentRow, PaymentRowStatus, ProviderName, ReceiptIssued, ReceiptRequest,
};
use crate::payments::utils::{Auth, PaymentHttpClient};
use async_trait::async_trait;
use reqwest::Method;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const PROVIDER: &str = "qr_gateway";

#[derive(Debug, Clone)]
pub struct QrGatewayConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub invoice_code: String,
    pub timeout_secs: u64,
    pub token_safety_margin_secs: u64,
}

impl Default for QrGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://merchant.qpay.mn".to_string(),
            username: String::new(),
            password: String::new(),
            invoice_code: String::new(),
            timeout_secs: 15,
            token_safety_margin_secs: 60,
        }
    }
}

impl From<&GatewayConfig> for QrGatewayConfig {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            invoice_code: config.invoice_code.clone(),
            timeout_secs: config.timeout_secs,
            token_safety_margin_secs: config.token_safety_margin_secs,
        }
    }
}

impl QrGatewayConfig {
    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

// ---------------------------------------------------------------------------
// Wire types. Everything optional here, required fields enforced below.
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawTokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawInvoiceResponse {
    invoice_id: Option<String>,
    qr_text: Option<String>,
    qr_image: Option<String>,
    #[serde(rename = "qPay_shortUrl")]
    short_url: Option<String>,
    #[serde(default)]
    urls: Vec<DeepLink>,
}

#[derive(Debug, Deserialize)]
struct RawCheckResponse {
    count: Option<i64>,
    paid_amount: Option<Decimal>,
    rows: Option<Vec<RawPaymentRow>>,
}

#[derive(Debug, Deserialize)]
struct RawPaymentRow {
    payment_id: Option<JsonValue>,
    payment_status: Option<String>,
    payment_amount: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct RawReceiptResponse {
    id: Option<JsonValue>,
}

fn id_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl RawTokenResponse {
    fn validate(self) -> PaymentResult<AccessCredential> {
        let access_token = non_empty(self.access_token)
            .ok_or_else(|| PaymentError::malformed("auth_token", "missing access_token"))?;
        let expires_in = self
            .expires_in
            .ok_or_else(|| PaymentError::malformed("auth_token", "missing expires_in"))?;
        Ok(AccessCredential {
            access_token,
            expires_in: Duration::from_secs(expires_in),
        })
    }
}

impl RawInvoiceResponse {
    fn validate(self) -> PaymentResult<CreatedInvoice> {
        let invoice_id = non_empty(self.invoice_id)
            .ok_or_else(|| PaymentError::malformed("create_invoice", "missing invoice_id"))?;
        let qr_text = non_empty(self.qr_text)
            .ok_or_else(|| PaymentError::malformed("create_invoice", "missing qr_text"))?;
        Ok(CreatedInvoice {
            invoice_id,
            display: InvoiceDisplay {
                qr_text,
                qr_image: non_empty(self.qr_image),
                short_url: non_empty(self.short_url),
                deep_links: self.urls,
            },
        })
    }
}

impl RawCheckResponse {
    fn validate(self) -> PaymentResult<PaymentCheck> {
        let raw_rows = self
            .rows
            .ok_or_else(|| PaymentError::malformed("check_payment", "missing rows"))?;

        if let Some(count) = self.count {
            if count < 0 {
                return Err(PaymentError::malformed("check_payment", "negative count"));
            }
        }

        let mut rows = Vec::with_capacity(raw_rows.len());
        for raw in raw_rows {
            let status: PaymentRowStatus = raw
                .payment_status
                .ok_or_else(|| PaymentError::malformed("check_payment", "row missing payment_status"))?
                .parse()?;
            let amount = raw.payment_amount.ok_or_else(|| {
                PaymentError::malformed("check_payment", "row missing payment_amount")
            })?;
            rows.push(PaymentRow {
                payment_id: raw.payment_id.as_ref().and_then(id_text),
                status,
                amount,
            });
        }

        let paid_amount = match self.paid_amount {
            Some(amount) => amount,
            None if rows.is_empty() => Decimal::ZERO,
            None => {
                return Err(PaymentError::malformed(
                    "check_payment",
                    "missing paid_amount",
                ))
            }
        };
        if paid_amount < Decimal::ZERO {
            return Err(PaymentError::malformed("check_payment", "negative paid_amount"));
        }

        Ok(PaymentCheck { paid_amount, rows })
    }
}

// ---------------------------------------------------------------------------
// Credential exchange
// ---------------------------------------------------------------------------

/// Basic-auth token exchange against `/v2/auth/token`.
pub struct QrTokenEndpoint {
    config: QrGatewayConfig,
    http: PaymentHttpClient,
}

impl QrTokenEndpoint {
    pub fn new(config: QrGatewayConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(Duration::from_secs(config.timeout_secs))?;
        Ok(Self { config, http })
    }
}

#[async_trait]
impl CredentialSource for QrTokenEndpoint {
    async fn fetch_credential(&self) -> PaymentResult<AccessCredential> {
        let raw: RawTokenResponse = log_external_call(
            PROVIDER,
            "auth_token",
            self.http.request_json(
                "auth_token",
                Method::POST,
                &self.config.endpoint("/v2/auth/token"),
                Auth::Basic {
                    username: &self.config.username,
                    password: &self.config.password,
                },
                None,
            ),
        )
        .await?;
        raw.validate()
    }
}

// ---------------------------------------------------------------------------
// Gateway client
// ---------------------------------------------------------------------------

pub struct QrGatewayClient {
    config: QrGatewayConfig,
    http: PaymentHttpClient,
    credentials: Arc<CredentialCache>,
}

impl QrGatewayClient {
    pub fn new(config: QrGatewayConfig) -> PaymentResult<Self> {
        if config.username.trim().is_empty() || config.password.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "gateway username and password are required".to_string(),
                field: Some("GATEWAY_USERNAME".to_string()),
            });
        }

        let token_endpoint = Arc::new(QrTokenEndpoint::new(config.clone())?);
        let credentials = Arc::new(CredentialCache::new(
            token_endpoint,
            Duration::from_secs(config.token_safety_margin_secs),
        ));
        Self::with_credentials(config, credentials)
    }

    /// Build a client around an existing credential cache.
    pub fn with_credentials(
        config: QrGatewayConfig,
        credentials: Arc<CredentialCache>,
    ) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(Duration::from_secs(config.timeout_secs))?;
        Ok(Self {
            config,
            http,
            credentials,
        })
    }

    pub fn from_config(config: &GatewayConfig) -> PaymentResult<Self> {
        Self::new(QrGatewayConfig::from(config))
    }

    async fn authorized_post<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        body: &JsonValue,
    ) -> PaymentResult<T> {
        let token = self.credentials.get_token(PROVIDER).await?;
        let result = log_external_call(
            PROVIDER,
            operation,
            self.http.request_json(
                operation,
                Method::POST,
                &self.config.endpoint(path),
                Auth::Bearer(&token),
                Some(body),
            ),
        )
        .await;

        if let Err(PaymentError::Unauthorized { .. }) = &result {
            // Next call exchanges a fresh token
            self.credentials.invalidate(PROVIDER);
        }
        result
    }
}

#[async_trait]
impl PaymentGateway for QrGatewayClient {
    async fn create_invoice(&self, request: InvoiceRequest) -> PaymentResult<CreatedInvoice> {
        if request.amount <= 0 {
            return Err(PaymentError::ValidationError {
                message: "invoice amount must be positive".to_string(),
                field: Some("amount".to_string()),
            });
        }

        let payload = serde_json::json!({
            "invoice_code": self.config.invoice_code,
            "sender_invoice_no": request.session_id.to_string(),
            "invoice_receiver_code": "terminal",
            "invoice_description": request.description,
            "amount": request.amount,
            "callback_url": request.callback_url,
        });

        let raw: RawInvoiceResponse = self
            .authorized_post("create_invoice", "/v2/invoice", &payload)
            .await?;
        let invoice = raw.validate()?;
        info!(
            session_id = %request.session_id,
            invoice_id = %invoice.invoice_id,
            "Gateway invoice created"
        );
        Ok(invoice)
    }

    async fn check_payment(&self, invoice_id: &str) -> PaymentResult<PaymentCheck> {
        let payload = serde_json::json!({
            "object_type": "INVOICE",
            "object_id": invoice_id,
            "offset": { "page_number": 1, "page_limit": 100 },
        });

        let raw: RawCheckResponse = self
            .authorized_post("check_payment", "/v2/payment/check", &payload)
            .await?;
        raw.validate()
    }

    async fn create_receipt(&self, request: ReceiptRequest) -> PaymentResult<ReceiptIssued> {
        let mut payload = serde_json::json!({
            "payment_id": request.payment_id,
            "ebarimt_receiver_type": request.receiver_type,
        });
        if let (Some(target), JsonValue::Object(extra)) = (payload.as_object_mut(), request.metadata)
        {
            for (key, value) in extra {
                target.entry(key).or_insert(value);
            }
        }

        let data: JsonValue = self
            .authorized_post("create_receipt", "/v2/ebarimt/create", &payload)
            .await?;
        let raw: RawReceiptResponse = serde_json::from_value(data.clone())
            .map_err(|e| PaymentError::malformed("create_receipt", e.to_string()))?;
        let receipt_id = raw
            .id
            .as_ref()
            .and_then(id_text)
            .ok_or_else(|| PaymentError::malformed("create_receipt", "missing id"))?;

        Ok(ReceiptIssued { receipt_id, data })
    }

    fn name(&self) -> ProviderName {
        ProviderName::QrGateway
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(json: JsonValue) -> PaymentResult<PaymentCheck> {
        serde_json::from_value::<RawCheckResponse>(json)
            .map_err(|e| PaymentError::malformed("check_payment", e.to_string()))?
            .validate()
    }

    #[test]
    fn check_response_with_paid_row_parses() {
        let parsed = check(serde_json::json!({
            "count": 1,
            "paid_amount": 100,
            "rows": [{"payment_id": 5001, "payment_status": "PAID", "payment_amount": "100.00"}]
        }))
        .unwrap();

        assert_eq!(parsed.paid_amount, Decimal::from(100));
        assert_eq!(parsed.rows[0].payment_id.as_deref(), Some("5001"));
        assert!(parsed.has_paid_row());
    }

    #[test]
    fn empty_check_response_is_unpaid() {
        let parsed = check(serde_json::json!({"count": 0, "rows": []})).unwrap();
        assert_eq!(parsed, PaymentCheck::unpaid());
    }

    #[test]
    fn missing_rows_is_malformed() {
        let err = check(serde_json::json!({"count": 0, "paid_amount": 0})).unwrap_err();
        assert!(matches!(err, PaymentError::MalformedResponse { .. }));
    }

    #[test]
    fn rows_without_paid_amount_are_malformed() {
        let err = check(serde_json::json!({
            "rows": [{"payment_status": "PAID", "payment_amount": 100}]
        }))
        .unwrap_err();
        assert!(matches!(err, PaymentError::MalformedResponse { .. }));
    }

    #[test]
    fn unknown_row_status_is_malformed() {
        let err = check(serde_json::json!({
            "paid_amount": 100,
            "rows": [{"payment_status": "MAYBE", "payment_amount": 100}]
        }))
        .unwrap_err();
        assert!(matches!(err, PaymentError::MalformedResponse { .. }));
    }

    #[test]
    fn invoice_without_id_is_malformed() {
        let raw: RawInvoiceResponse =
            serde_json::from_value(serde_json::json!({"qr_text": "0002010102"})).unwrap();
        assert!(matches!(
            raw.validate(),
            Err(PaymentError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn token_without_expiry_is_malformed() {
        let raw: RawTokenResponse =
            serde_json::from_value(serde_json::json!({"access_token": "abc"})).unwrap();
        assert!(raw.validate().is_err());
    }

    #[test]
    fn client_requires_credentials() {
        assert!(QrGatewayClient::new(QrGatewayConfig::default()).is_err());
    }
}
