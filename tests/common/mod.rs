#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use paysession_backend::api::{self, AppState};
use paysession_backend::database::memory::{
    MemoryAuditLog, MemoryLedger, MemoryOrderBook, MemorySessionStore,
};
use paysession_backend::health::HealthChecker;
use paysession_backend::locking::MemoryLock;
use paysession_backend::payments::error::{PaymentError, PaymentResult};
use paysession_backend::payments::gateway::PaymentGateway;
use paysession_backend::payments::types::{
    CreatedInvoice, InvoiceDisplay, InvoiceRequest, PaymentCheck, PaymentRow, PaymentRowStatus,
    ProviderName, ReceiptIssued, ReceiptRequest,
};
use paysession_backend::config::SettlementConfig;
use paysession_backend::services::receipt::ReceiptIssuer;
use paysession_backend::services::{PaymentVerifier, WebhookAuth, WebhookIngress, WebhookRequest};
use paysession_backend::sessions::model::{CartItem, CartSnapshot, PaymentSession};
use paysession_backend::sessions::service::{SessionCreated, SessionService, SessionServiceConfig};
use paysession_backend::sessions::store::SessionStore;
use paysession_backend::workers::{
    CleanupConfig, CleanupWorker, ReconciliationConfig, ReconciliationWorker,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const INTERNAL_TOKEN: &str = "internal-test-token-0123456789";
pub const USER: &str = "user-1";

// ---------------------------------------------------------------------------
// Scripted gateway
// ---------------------------------------------------------------------------

/// In-process gateway whose check answers are scripted per invoice.
/// Unknown invoices report unpaid.
#[derive(Default)]
pub struct FakeGateway {
    checks: Mutex<HashMap<String, PaymentResult<PaymentCheck>>>,
    receipt_error: Mutex<Option<PaymentError>>,
    invoices: AtomicUsize,
    check_calls: AtomicUsize,
    receipt_calls: AtomicUsize,
    fail_invoices: AtomicBool,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `invoice_id` as paid in full with `amount`.
    pub fn pay(&self, invoice_id: &str, amount: i64) {
        self.set_check(invoice_id, paid_check(invoice_id, Decimal::from(amount)));
    }

    pub fn set_check(&self, invoice_id: &str, check: PaymentCheck) {
        self.checks
            .lock()
            .unwrap()
            .insert(invoice_id.to_string(), Ok(check));
    }

    pub fn fail_check(&self, invoice_id: &str, error: PaymentError) {
        self.checks
            .lock()
            .unwrap()
            .insert(invoice_id.to_string(), Err(error));
    }

    pub fn fail_invoice_creation(&self) {
        self.fail_invoices.store(true, Ordering::SeqCst);
    }

    pub fn fail_receipts(&self, error: PaymentError) {
        *self.receipt_error.lock().unwrap() = Some(error);
    }

    pub fn check_calls(&self) -> usize {
        self.check_calls.load(Ordering::SeqCst)
    }

    pub fn receipt_calls(&self) -> usize {
        self.receipt_calls.load(Ordering::SeqCst)
    }
}

pub fn paid_check(invoice_id: &str, amount: Decimal) -> PaymentCheck {
    PaymentCheck {
        paid_amount: amount,
        rows: vec![PaymentRow {
            payment_id: Some(format!("pay-{}", invoice_id)),
            status: PaymentRowStatus::Paid,
            amount,
        }],
    }
}

pub fn gateway_timeout() -> PaymentError {
    PaymentError::Timeout {
        operation: "check_payment".to_string(),
        timeout_secs: 10,
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_invoice(&self, _request: InvoiceRequest) -> PaymentResult<CreatedInvoice> {
        if self.fail_invoices.load(Ordering::SeqCst) {
            return Err(gateway_timeout());
        }
        let n = self.invoices.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CreatedInvoice {
            invoice_id: format!("INV-{}", n),
            display: InvoiceDisplay {
                qr_text: format!("qr-{}", n),
                qr_image: None,
                short_url: Some(format!("https://s.test/{}", n)),
                deep_links: vec![],
            },
        })
    }

    async fn check_payment(&self, invoice_id: &str) -> PaymentResult<PaymentCheck> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        self.checks
            .lock()
            .unwrap()
            .get(invoice_id)
            .cloned()
            .unwrap_or_else(|| Ok(PaymentCheck::unpaid()))
    }

    async fn create_receipt(&self, request: ReceiptRequest) -> PaymentResult<ReceiptIssued> {
        self.receipt_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.receipt_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(ReceiptIssued {
            receipt_id: format!("R-{}", request.payment_id),
            data: serde_json::json!({
                "id": format!("R-{}", request.payment_id),
                "lottery": "AB 12345678",
                "ebarimt_receiver": "88001122",
                "amount": request.metadata["amount"],
            }),
        })
    }

    fn name(&self) -> ProviderName {
        ProviderName::QrGateway
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Two sellers, total 150.
pub fn cart() -> CartSnapshot {
    CartSnapshot {
        items: vec![
            CartItem {
                product_id: "p-tea".to_string(),
                seller_id: "seller-a".to_string(),
                name: Some("Tea".to_string()),
                quantity: 2,
                unit_price: Decimal::from(50),
            },
            CartItem {
                product_id: "p-cup".to_string(),
                seller_id: "seller-b".to_string(),
                name: Some("Cup".to_string()),
                quantity: 1,
                unit_price: Decimal::from(50),
            },
        ],
        sellers: vec!["seller-a".to_string(), "seller-b".to_string()],
        total: Decimal::from(150),
        currency: "MNT".to_string(),
    }
}

pub const EXPECTED_AMOUNT: i64 = 150;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Every service wired against in-process stores and a scripted gateway.
pub struct Harness {
    pub gateway: Arc<FakeGateway>,
    pub sessions: Arc<MemorySessionStore>,
    pub ledger: Arc<MemoryLedger>,
    pub audit: Arc<MemoryAuditLog>,
    pub orders: Arc<MemoryOrderBook>,
    pub lock: Arc<MemoryLock>,
    pub verifier: Arc<PaymentVerifier>,
    pub service: Arc<SessionService>,
    pub ingress: Arc<WebhookIngress>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(MemoryOrderBook::new(), false)
    }

    pub fn with_orders(orders: MemoryOrderBook) -> Self {
        Self::build(orders, false)
    }

    pub fn with_receipts() -> Self {
        Self::build(MemoryOrderBook::new(), true)
    }

    fn build(orders: MemoryOrderBook, receipts: bool) -> Self {
        let gateway = Arc::new(FakeGateway::new());
        let sessions = Arc::new(MemorySessionStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let audit = Arc::new(MemoryAuditLog::new());
        let orders = Arc::new(orders);
        let lock = Arc::new(MemoryLock::new());

        let mut verifier = PaymentVerifier::new(
            sessions.clone(),
            ledger.clone(),
            gateway.clone(),
            orders.clone(),
            Duration::from_secs(300),
        );
        if receipts {
            verifier = verifier.with_receipts(Arc::new(ReceiptIssuer::new(
                gateway.clone(),
                sessions.clone(),
                "CITIZEN",
            )));
        }
        let verifier = Arc::new(verifier);

        let service = Arc::new(SessionService::new(
            sessions.clone(),
            ledger.clone(),
            gateway.clone(),
            verifier.clone(),
            SessionServiceConfig {
                settlement: SettlementConfig {
                    currency: "MNT".to_string(),
                    rate: Decimal::ONE,
                },
                callback_base_url: "https://shop.test".to_string(),
                check_cooldown: Duration::from_secs(20),
            },
        ));
        let ingress = Arc::new(WebhookIngress::new(
            verifier.clone(),
            sessions.clone(),
            ledger.clone(),
            audit.clone(),
        ));

        Self {
            gateway,
            sessions,
            ledger,
            audit,
            orders,
            lock,
            verifier,
            service,
            ingress,
        }
    }

    /// Start a session for [`USER`] over [`cart`].
    pub async fn open_session(&self) -> SessionCreated {
        self.service.create_session(USER, cart()).await.unwrap()
    }

    pub async fn session(&self, session_id: Uuid) -> PaymentSession {
        self.sessions.get(session_id).await.unwrap().unwrap()
    }

    /// A gateway callback carrying the session's real token.
    pub async fn callback(&self, session_id: Uuid) -> WebhookRequest {
        let token = self.session(session_id).await.callback_token;
        WebhookRequest {
            session_id: Some(session_id),
            invoice_id: None,
            auth: WebhookAuth::Public { token },
            payload: serde_json::json!({}),
        }
    }

    pub fn internal(&self, session_id: Uuid, invoice_id: Option<&str>) -> WebhookRequest {
        WebhookRequest {
            session_id: Some(session_id),
            invoice_id: invoice_id.map(str::to_string),
            auth: WebhookAuth::Internal,
            payload: serde_json::json!({"source": "test"}),
        }
    }

    pub fn reconciliation(&self) -> ReconciliationWorker {
        ReconciliationWorker::new(
            self.sessions.clone(),
            self.verifier.clone(),
            self.lock.clone(),
            ReconciliationConfig::default(),
        )
    }

    pub fn cleanup(&self, config: CleanupConfig) -> CleanupWorker {
        CleanupWorker::new(
            self.sessions.clone(),
            self.ledger.clone(),
            self.audit.clone(),
            self.lock.clone(),
            config,
        )
    }

    pub fn app(&self) -> Router {
        api::router(AppState {
            sessions: self.service.clone(),
            webhooks: self.ingress.clone(),
            health: HealthChecker::default(),
            internal_token: Arc::from(INTERNAL_TOKEN),
        })
    }
}
