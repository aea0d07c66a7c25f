//! In-process stores with the same semantics as the Postgres repositories.
//!
//! Used when running with `SKIP_EXTERNALS=true` and by the test suite.

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::ledger_repository::{IdempotencyLedger, LedgerEntry, LedgerInsert, LedgerResult};
use crate::database::order_repository::OrderRecord;
use crate::database::webhook_audit_repository::{WebhookAuditLog, WebhookAuditRecord};
use crate::services::order_materializer::{order_drafts, OrderMaterializer};
use crate::services::verification::VerifiedPayment;
use crate::sessions::model::{PaymentSession, ReceiptRecord, SessionStatus, TerminalStatus};
use crate::sessions::store::{SessionStore, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

fn not_found(id: Uuid) -> DatabaseError {
    DatabaseError::new(DatabaseErrorKind::NotFound {
        entity: "payment_session".to_string(),
        id: id.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, PaymentSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &PaymentSession) -> StoreResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.session_id) {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: Some("payment_sessions_pkey".to_string()),
            }));
        }
        sessions.insert(session.session_id, session.clone());
        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> StoreResult<Option<PaymentSession>> {
        Ok(self.sessions.read().await.get(&session_id).cloned())
    }

    async fn assign_invoice(
        &self,
        session_id: Uuid,
        invoice_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session_id) {
            Some(session) if session.invoice_id.is_none() => {
                session.invoice_id = Some(invoice_id.to_string());
                session.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition(
        &self,
        session_id: Uuid,
        to: SessionStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<PaymentSession>> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(&session_id) else {
            return Ok(None);
        };
        if !to.allowed_sources().contains(&session.status) {
            return Ok(None);
        }

        session.status = to;
        session.updated_at = now;
        if to == SessionStatus::Cancelled {
            session.cancelled_at = Some(now);
        }
        Ok(Some(session.clone()))
    }

    async fn record_payment(
        &self,
        session_id: Uuid,
        payment_id: Option<&str>,
        paid_amount: Decimal,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&session_id).ok_or_else(|| not_found(session_id))?;
        if session.payment_id.is_none() {
            session.payment_id = payment_id.map(str::to_string);
        }
        session.paid_amount = Some(paid_amount);
        session.updated_at = now;
        Ok(())
    }

    async fn claim_check(
        &self,
        session_id: Uuid,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session_id) {
            Some(session) if session.last_checked_at.map_or(true, |at| at <= cutoff) => {
                session.last_checked_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reconcile_candidates(
        &self,
        updated_before: DateTime<Utc>,
        checked_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<PaymentSession>> {
        let sessions = self.sessions.read().await;
        let mut candidates: Vec<PaymentSession> = sessions
            .values()
            .filter(|s| matches!(s.status, SessionStatus::Pending | SessionStatus::Paid))
            .filter(|s| s.invoice_id.is_some() && s.updated_at < updated_before)
            .filter(|s| s.last_checked_at.map_or(true, |at| at <= checked_before))
            .cloned()
            .collect();
        // None sorts before Some: never-checked sessions first
        candidates.sort_by_key(|s| (s.last_checked_at, s.updated_at));
        candidates.truncate(limit.max(0) as usize);
        Ok(candidates)
    }

    async fn expire_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Uuid>> {
        let mut sessions = self.sessions.write().await;
        let mut stale: Vec<(DateTime<Utc>, Uuid)> = sessions
            .values()
            .filter(|s| s.status == SessionStatus::Pending && s.created_at < created_before)
            .map(|s| (s.created_at, s.session_id))
            .collect();
        stale.sort();
        stale.truncate(limit.max(0) as usize);

        let mut expired = Vec::with_capacity(stale.len());
        for (_, session_id) in stale {
            if let Some(session) = sessions.get_mut(&session_id) {
                session.status = SessionStatus::Expired;
                session.updated_at = now;
                expired.push(session_id);
            }
        }
        Ok(expired)
    }

    async fn delete_terminal(
        &self,
        status: TerminalStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Uuid>> {
        let target = status.as_status();
        let mut sessions = self.sessions.write().await;
        let mut doomed: Vec<(DateTime<Utc>, Uuid)> = sessions
            .values()
            .filter(|s| s.status == target && s.updated_at < updated_before)
            .map(|s| (s.updated_at, s.session_id))
            .collect();
        doomed.sort();
        doomed.truncate(limit.max(0) as usize);

        Ok(doomed
            .into_iter()
            .filter_map(|(_, id)| sessions.remove(&id).map(|_| id))
            .collect())
    }

    async fn update_receipt(
        &self,
        session_id: Uuid,
        receipt: &ReceiptRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&session_id).ok_or_else(|| not_found(session_id))?;
        session.receipt = Some(receipt.clone());
        session.updated_at = now;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryLedger {
    entries: RwLock<HashMap<String, LedgerEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyLedger for MemoryLedger {
    async fn find(&self, invoice_id: &str) -> LedgerResult<Option<LedgerEntry>> {
        Ok(self.entries.read().await.get(invoice_id).cloned())
    }

    async fn try_create(
        &self,
        invoice_id: &str,
        session_id: Uuid,
        claim_token: Uuid,
        now: DateTime<Utc>,
    ) -> LedgerResult<LedgerInsert> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(invoice_id) {
            return Ok(LedgerInsert::AlreadyExists);
        }
        let entry = LedgerEntry {
            invoice_id: invoice_id.to_string(),
            session_id,
            order_ids: Vec::new(),
            processed_at: None,
            claim_token,
            claimed_at: now,
            created_at: now,
        };
        entries.insert(invoice_id.to_string(), entry.clone());
        Ok(LedgerInsert::Created(entry))
    }

    async fn complete(
        &self,
        invoice_id: &str,
        claim_token: Uuid,
        order_ids: &[String],
        now: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(invoice_id) {
            Some(entry) if entry.claim_token == claim_token && !entry.is_complete() => {
                entry.order_ids = order_ids.to_vec();
                entry.processed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_claim(&self, invoice_id: &str, claim_token: Uuid) -> LedgerResult<bool> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(invoice_id) {
            Some(entry) if entry.claim_token == claim_token && !entry.is_complete() => {
                entry.claimed_at = DateTime::<Utc>::UNIX_EPOCH;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reclaim_stale(
        &self,
        invoice_id: &str,
        claim_token: Uuid,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<LedgerEntry>> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(invoice_id) {
            Some(entry) if entry.claim_expired(stale_before) => {
                entry.claim_token = claim_token;
                entry.claimed_at = now;
                Ok(Some(entry.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete_processed_before(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> LedgerResult<u64> {
        let mut entries = self.entries.write().await;
        let mut doomed: Vec<(DateTime<Utc>, String)> = entries
            .values()
            .filter_map(|e| e.processed_at.filter(|at| *at < before).map(|at| (at, e.invoice_id.clone())))
            .collect();
        doomed.sort();
        doomed.truncate(limit.max(0) as usize);

        let mut deleted = 0;
        for (_, invoice_id) in doomed {
            if entries.remove(&invoice_id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

// ---------------------------------------------------------------------------
// Webhook audit log
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryAuditLog {
    records: RwLock<Vec<WebhookAuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<WebhookAuditRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl WebhookAuditLog for MemoryAuditLog {
    async fn record(&self, record: &WebhookAuditRecord) -> Result<(), DatabaseError> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn delete_before(&self, before: DateTime<Utc>, limit: i64) -> Result<u64, DatabaseError> {
        let mut records = self.records.write().await;
        let mut budget = limit.max(0) as usize;
        let before_len = records.len();
        records.retain(|record| {
            if budget > 0 && record.received_at < before {
                budget -= 1;
                false
            } else {
                true
            }
        });
        Ok((before_len - records.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Order book keyed by `(invoice_id, seller_id)`.
#[derive(Default)]
pub struct MemoryOrderBook {
    orders: RwLock<HashMap<(String, String), OrderRecord>>,
    created: AtomicUsize,
    failures_left: AtomicUsize,
    delay: Option<Duration>,
}

impl MemoryOrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold each materialization open for `delay`, widening race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `count` materializations.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Number of order rows ever inserted.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub async fn orders_for_invoice(&self, invoice_id: &str) -> Vec<OrderRecord> {
        let mut orders: Vec<OrderRecord> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| o.invoice_id == invoice_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.seller_id.cmp(&b.seller_id));
        orders
    }
}

#[async_trait]
impl OrderMaterializer for MemoryOrderBook {
    async fn materialize(
        &self,
        session: &PaymentSession,
        payment: &VerifiedPayment,
    ) -> Result<Vec<String>, DatabaseError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(DatabaseError::new(DatabaseErrorKind::ConnectionError {
                message: "order store unavailable".to_string(),
            }));
        }

        let now = Utc::now();
        let mut orders = self.orders.write().await;
        let mut order_ids = Vec::new();
        for draft in order_drafts(session)? {
            let key = (payment.invoice_id().to_string(), draft.seller_id.clone());
            let order = orders.entry(key).or_insert_with(|| {
                self.created.fetch_add(1, Ordering::SeqCst);
                OrderRecord::from_draft(draft, session, payment, now)
            });
            order_ids.push(order.order_id.clone());
        }
        Ok(order_ids)
    }
}
