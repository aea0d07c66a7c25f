//! Session store seam
//!
//! Postgres is authoritative. [`CachedSessionStore`] keeps a Redis projection
//! of each session in front of it; every mutation goes to the inner store
//! first and then refreshes or drops the projection.

use crate::cache::keys::session::SessionKey;
use crate::cache::Cache;
use crate::database::error::DatabaseError;
use crate::sessions::model::{PaymentSession, ReceiptRecord, SessionStatus, TerminalStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub type StoreResult<T> = Result<T, DatabaseError>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: &PaymentSession) -> StoreResult<()>;

    async fn get(&self, session_id: Uuid) -> StoreResult<Option<PaymentSession>>;

    /// Set the invoice id if none is set yet. Returns false when the session
    /// is missing or already has one.
    async fn assign_invoice(
        &self,
        session_id: Uuid,
        invoice_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Conditional status write: applies only if the current status is one of
    /// `to.allowed_sources()`. Returns the updated session when it applied.
    async fn transition(
        &self,
        session_id: Uuid,
        to: SessionStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<PaymentSession>>;

    /// Record what the gateway reported as paid. Status is left alone.
    async fn record_payment(
        &self,
        session_id: Uuid,
        payment_id: Option<&str>,
        paid_amount: Decimal,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Atomically set `last_checked_at = now` if it is unset or not after
    /// `cutoff`. Returns whether this caller won the check. Does not touch
    /// `updated_at`.
    async fn claim_check(
        &self,
        session_id: Uuid,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// PENDING or PAID sessions with an invoice, last updated before
    /// `updated_before` and not checked after `checked_before`. Never-checked
    /// sessions come first, then least recently checked, so consecutive
    /// batches rotate through the whole backlog.
    async fn reconcile_candidates(
        &self,
        updated_before: DateTime<Utc>,
        checked_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<PaymentSession>>;

    /// Move PENDING sessions created before `created_before` to EXPIRED.
    async fn expire_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Uuid>>;

    /// Delete up to `limit` sessions in `status` last updated before
    /// `updated_before`. Returns the deleted ids.
    async fn delete_terminal(
        &self,
        status: TerminalStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Uuid>>;

    async fn update_receipt(
        &self,
        session_id: Uuid,
        receipt: &ReceiptRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;
}

/// Read-through Redis projection over an authoritative store.
///
/// Cache failures are logged and ignored.
pub struct CachedSessionStore {
    inner: Arc<dyn SessionStore>,
    cache: Arc<dyn Cache<PaymentSession>>,
    ttl: Duration,
}

impl CachedSessionStore {
    pub fn new(
        inner: Arc<dyn SessionStore>,
        cache: Arc<dyn Cache<PaymentSession>>,
        ttl: Duration,
    ) -> Self {
        Self { inner, cache, ttl }
    }

    async fn put(&self, session: &PaymentSession) {
        let key = SessionKey::new(session.session_id).to_string();
        if let Err(e) = self.cache.set(&key, session, Some(self.ttl)).await {
            warn!(session_id = %session.session_id, error = %e, "Failed to cache session");
        }
    }

    async fn evict(&self, session_id: Uuid) {
        let key = SessionKey::new(session_id).to_string();
        if let Err(e) = self.cache.delete(&key).await {
            warn!(session_id = %session_id, error = %e, "Failed to evict cached session");
        }
    }
}

#[async_trait]
impl SessionStore for CachedSessionStore {
    async fn insert(&self, session: &PaymentSession) -> StoreResult<()> {
        self.inner.insert(session).await?;
        self.put(session).await;
        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> StoreResult<Option<PaymentSession>> {
        let key = SessionKey::new(session_id).to_string();
        match self.cache.get(&key).await {
            Ok(Some(session)) => return Ok(Some(session)),
            Ok(None) => {}
            Err(e) if e.is_stale_entry() => {
                warn!(session_id = %session_id, error = %e, "Dropping undecodable cached session");
                self.evict(session_id).await;
            }
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "Session cache unavailable, reading database");
            }
        }

        let session = self.inner.get(session_id).await?;
        if let Some(session) = &session {
            self.put(session).await;
        }
        Ok(session)
    }

    async fn assign_invoice(
        &self,
        session_id: Uuid,
        invoice_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let assigned = self.inner.assign_invoice(session_id, invoice_id, now).await?;
        self.evict(session_id).await;
        Ok(assigned)
    }

    async fn transition(
        &self,
        session_id: Uuid,
        to: SessionStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<PaymentSession>> {
        let updated = self.inner.transition(session_id, to, now).await?;
        match &updated {
            Some(session) => self.put(session).await,
            None => self.evict(session_id).await,
        }
        Ok(updated)
    }

    async fn record_payment(
        &self,
        session_id: Uuid,
        payment_id: Option<&str>,
        paid_amount: Decimal,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.inner
            .record_payment(session_id, payment_id, paid_amount, now)
            .await?;
        self.evict(session_id).await;
        Ok(())
    }

    async fn claim_check(
        &self,
        session_id: Uuid,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        // last_checked_at is throttling state only; the projection may lag
        self.inner.claim_check(session_id, cutoff, now).await
    }

    async fn reconcile_candidates(
        &self,
        updated_before: DateTime<Utc>,
        checked_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<PaymentSession>> {
        self.inner
            .reconcile_candidates(updated_before, checked_before, limit)
            .await
    }

    async fn expire_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Uuid>> {
        let expired = self.inner.expire_pending(created_before, limit, now).await?;
        for session_id in &expired {
            self.evict(*session_id).await;
        }
        Ok(expired)
    }

    async fn delete_terminal(
        &self,
        status: TerminalStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Uuid>> {
        let deleted = self
            .inner
            .delete_terminal(status, updated_before, limit)
            .await?;
        for session_id in &deleted {
            self.evict(*session_id).await;
        }
        Ok(deleted)
    }

    async fn update_receipt(
        &self,
        session_id: Uuid,
        receipt: &ReceiptRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.inner.update_receipt(session_id, receipt, now).await?;
        self.evict(session_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, CacheResult};
    use crate::database::memory::MemorySessionStore;
    use crate::sessions::model::{CartItem, CartSnapshot};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MapCache {
        entries: Mutex<HashMap<String, PaymentSession>>,
        broken: bool,
    }

    #[async_trait]
    impl Cache<PaymentSession> for MapCache {
        async fn get(&self, key: &str) -> CacheResult<Option<PaymentSession>> {
            if self.broken {
                return Err(CacheError::ConnectionError("down".to_string()));
            }
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn set(
            &self,
            key: &str,
            value: &PaymentSession,
            _ttl: Option<Duration>,
        ) -> CacheResult<()> {
            if self.broken {
                return Err(CacheError::ConnectionError("down".to_string()));
            }
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_string(), value.clone());
            Ok(())
        }

        async fn delete(&self, key: &str) -> CacheResult<()> {
            if self.broken {
                return Err(CacheError::ConnectionError("down".to_string()));
            }
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }
    }

    fn session() -> PaymentSession {
        let cart = CartSnapshot {
            items: vec![CartItem {
                product_id: "p-1".to_string(),
                seller_id: "s-1".to_string(),
                name: None,
                quantity: 1,
                unit_price: Decimal::from(100),
            }],
            sellers: vec!["s-1".to_string()],
            total: Decimal::from(100),
            currency: "MNT".to_string(),
        };
        PaymentSession::new("user-1", cart, 100, "qr_gateway", Utc::now())
    }

    #[tokio::test]
    async fn test_transition_refreshes_projection() {
        let cache = Arc::new(MapCache::default());
        let store = CachedSessionStore::new(
            Arc::new(MemorySessionStore::new()),
            cache.clone(),
            Duration::from_secs(60),
        );
        let session = session();
        store.insert(&session).await.unwrap();

        store
            .transition(session.session_id, SessionStatus::Cancelled, Utc::now())
            .await
            .unwrap();

        let key = SessionKey::new(session.session_id).to_string();
        let cached = cache.entries.lock().unwrap().get(&key).cloned().unwrap();
        assert_eq!(cached.status, SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_broken_cache_falls_back_to_inner_store() {
        let inner = Arc::new(MemorySessionStore::new());
        let session = session();
        inner.insert(&session).await.unwrap();

        let store = CachedSessionStore::new(
            inner,
            Arc::new(MapCache {
                broken: true,
                ..Default::default()
            }),
            Duration::from_secs(60),
        );

        let loaded = store.get(session.session_id).await.unwrap();
        assert_eq!(loaded.map(|s| s.session_id), Some(session.session_id));
    }

    #[tokio::test]
    async fn test_assign_invoice_evicts_stale_projection() {
        let cache = Arc::new(MapCache::default());
        let store = CachedSessionStore::new(
            Arc::new(MemorySessionStore::new()),
            cache.clone(),
            Duration::from_secs(60),
        );
        let session = session();
        store.insert(&session).await.unwrap();

        assert!(store
            .assign_invoice(session.session_id, "INV-1", Utc::now())
            .await
            .unwrap());

        let loaded = store.get(session.session_id).await.unwrap().unwrap();
        assert_eq!(loaded.invoice_id.as_deref(), Some("INV-1"));
    }
}
