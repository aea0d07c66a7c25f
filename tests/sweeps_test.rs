mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{Harness, EXPECTED_AMOUNT, USER};
use paysession_backend::cache::keys::lock::JobLockKey;
use paysession_backend::database::ledger_repository::IdempotencyLedger;
use paysession_backend::locking::DistributedLock;
use paysession_backend::sessions::model::SessionStatus;
use paysession_backend::sessions::store::SessionStore;
use paysession_backend::workers::{
    CleanupConfig, ReconciliationConfig, CLEANUP_JOB, RECONCILIATION_JOB,
};
use std::time::Duration;

fn later() -> chrono::DateTime<Utc> {
    Utc::now() + ChronoDuration::minutes(5)
}

#[tokio::test]
async fn test_reconciliation_completes_payments_without_webhook() {
    let h = Harness::new();
    let paid = h.open_session().await;
    let unpaid = h.open_session().await;
    h.gateway.pay(&paid.invoice_id, EXPECTED_AMOUNT);

    let report = h.reconciliation().run_cycle(later()).await.unwrap();

    assert!(report.lock_acquired);
    assert_eq!(report.candidates, 2);
    assert_eq!(report.processed, 1);
    assert_eq!(report.not_paid, 1);
    assert_eq!(h.session(paid.session_id).await.status, SessionStatus::Processed);
    assert_eq!(h.session(unpaid.session_id).await.status, SessionStatus::Pending);
    assert_eq!(h.orders.created_count(), 2);
}

#[tokio::test]
async fn test_reconciliation_leaves_fresh_sessions_to_the_webhook() {
    let h = Harness::new();
    let created = h.open_session().await;
    h.gateway.pay(&created.invoice_id, EXPECTED_AMOUNT);

    let report = h.reconciliation().run_cycle(Utc::now()).await.unwrap();

    assert_eq!(report.candidates, 0);
    assert_eq!(h.gateway.check_calls(), 0);
}

#[tokio::test]
async fn test_reconciliation_respects_check_cooldown() {
    let h = Harness::new();
    h.open_session().await;
    let now = later();

    let first = h.reconciliation().run_cycle(now).await.unwrap();
    assert_eq!(first.not_paid, 1);

    let second = h.reconciliation().run_cycle(now).await.unwrap();
    assert_eq!(second.candidates, 0);
    assert_eq!(h.gateway.check_calls(), 1);

    let third = h
        .reconciliation()
        .run_cycle(now + ChronoDuration::seconds(21))
        .await
        .unwrap();
    assert_eq!(third.candidates, 1);
    assert_eq!(h.gateway.check_calls(), 2);
}

#[tokio::test]
async fn test_reconciliation_rotates_through_backlog_larger_than_batch() {
    let h = Harness::new();
    let batch_size = ReconciliationConfig::default().batch_size as usize;
    let mut opened = Vec::new();
    for _ in 0..=batch_size {
        opened.push(h.open_session().await);
    }
    let newest = opened.last().unwrap();
    h.gateway.pay(&newest.invoice_id, EXPECTED_AMOUNT);

    let now = later();
    let first = h.reconciliation().run_cycle(now).await.unwrap();
    assert_eq!(first.candidates, batch_size);

    let second = h
        .reconciliation()
        .run_cycle(now + ChronoDuration::seconds(61))
        .await
        .unwrap();
    assert_eq!(first.processed + second.processed, 1);
    assert_eq!(h.session(newest.session_id).await.status, SessionStatus::Processed);

    // Every session was checked at least once across the two ticks
    for created in &opened {
        assert!(h.session(created.session_id).await.last_checked_at.is_some());
    }
}

#[tokio::test]
async fn test_reconciliation_skips_tick_while_lock_is_held() {
    let h = Harness::new();
    let created = h.open_session().await;
    h.gateway.pay(&created.invoice_id, EXPECTED_AMOUNT);

    let key = JobLockKey::new(RECONCILIATION_JOB).to_string();
    let lease = h
        .lock
        .try_acquire(&key, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    let report = h.reconciliation().run_cycle(later()).await.unwrap();
    assert!(!report.lock_acquired);
    assert_eq!(h.gateway.check_calls(), 0);

    assert!(h.lock.release(&lease).await.unwrap());
    let report = h.reconciliation().run_cycle(later()).await.unwrap();
    assert!(report.lock_acquired);
    assert_eq!(report.processed, 1);
}

#[tokio::test]
async fn test_reconciliation_releases_lock_after_each_tick() {
    let h = Harness::new();
    h.reconciliation().run_cycle(later()).await.unwrap();

    let key = JobLockKey::new(RECONCILIATION_JOB).to_string();
    assert!(h
        .lock
        .try_acquire(&key, Duration::from_secs(1))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_cleanup_expires_abandoned_sessions() {
    let h = Harness::new();
    let created = h.open_session().await;

    let report = h
        .cleanup(CleanupConfig::default())
        .run_cycle(Utc::now() + ChronoDuration::minutes(31))
        .await
        .unwrap();

    assert!(report.lock_acquired);
    assert_eq!(report.expired, 1);
    assert_eq!(report.failed_steps, 0);
    assert_eq!(h.session(created.session_id).await.status, SessionStatus::Expired);

    // Expired sessions are answered from storage alone
    let checks = h.gateway.check_calls();
    let status = h
        .service
        .session_status(USER, created.session_id)
        .await
        .unwrap();
    assert_eq!(status.status, SessionStatus::Expired);
    assert_eq!(h.gateway.check_calls(), checks);
}

#[tokio::test]
async fn test_cleanup_never_deletes_pending_or_paid_sessions() {
    let h = Harness::new();

    let pending = h.open_session().await;

    let paid = h.open_session().await;
    h.gateway.pay(&paid.invoice_id, EXPECTED_AMOUNT);
    h.orders.fail_next(1);
    h.ingress.handle(h.callback(paid.session_id).await).await;
    assert_eq!(h.session(paid.session_id).await.status, SessionStatus::Paid);

    let processed = h.open_session().await;
    h.gateway.pay(&processed.invoice_id, EXPECTED_AMOUNT);
    h.ingress.handle(h.callback(processed.session_id).await).await;

    let cancelled = h.open_session().await;
    h.service
        .cancel_session(USER, cancelled.session_id)
        .await
        .unwrap();

    let config = CleanupConfig {
        pending_expiry: Duration::from_secs(3600),
        audit_retention: Duration::ZERO,
        closed_session_retention: Duration::ZERO,
        processed_session_retention: Some(Duration::ZERO),
        ledger_retention: Some(Duration::ZERO),
        ..CleanupConfig::default()
    };
    let report = h
        .cleanup(config)
        .run_cycle(Utc::now() + ChronoDuration::seconds(1))
        .await
        .unwrap();

    assert_eq!(report.expired, 0);
    assert_eq!(report.closed_deleted, 1);
    assert_eq!(report.processed_deleted, 1);
    assert_eq!(report.ledger_deleted, 1);
    assert_eq!(report.audit_deleted, 2);

    assert_eq!(h.session(pending.session_id).await.status, SessionStatus::Pending);
    assert_eq!(h.session(paid.session_id).await.status, SessionStatus::Paid);
    assert!(h.sessions.get(processed.session_id).await.unwrap().is_none());
    assert!(h.sessions.get(cancelled.session_id).await.unwrap().is_none());

    // The unfinished claim of the PAID session survives retention
    assert!(h.ledger.find(&paid.invoice_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_cleanup_keeps_processed_history_without_retention() {
    let h = Harness::new();
    let processed = h.open_session().await;
    h.gateway.pay(&processed.invoice_id, EXPECTED_AMOUNT);
    h.ingress.handle(h.callback(processed.session_id).await).await;

    let config = CleanupConfig {
        processed_session_retention: None,
        ledger_retention: None,
        ..CleanupConfig::default()
    };
    let report = h
        .cleanup(config)
        .run_cycle(Utc::now() + ChronoDuration::days(3650))
        .await
        .unwrap();

    assert_eq!(report.processed_deleted, 0);
    assert_eq!(report.ledger_deleted, 0);
    assert_eq!(h.session(processed.session_id).await.status, SessionStatus::Processed);
    assert!(h.ledger.find(&processed.invoice_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_cleanup_skips_tick_while_lock_is_held() {
    let h = Harness::new();
    let created = h.open_session().await;

    let key = JobLockKey::new(CLEANUP_JOB).to_string();
    h.lock
        .try_acquire(&key, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    let report = h
        .cleanup(CleanupConfig::default())
        .run_cycle(Utc::now() + ChronoDuration::hours(1))
        .await
        .unwrap();
    assert!(!report.lock_acquired);
    assert_eq!(h.session(created.session_id).await.status, SessionStatus::Pending);
}
