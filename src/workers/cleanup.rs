use crate::cache::keys::lock::JobLockKey;
use crate::config::SweepConfig;
use crate::database::ledger_repository::IdempotencyLedger;
use crate::database::webhook_audit_repository::WebhookAuditLog;
use crate::locking::DistributedLock;
use crate::sessions::model::TerminalStatus;
use crate::sessions::store::SessionStore;
use crate::workers::{chrono_duration, SweepError, CLEANUP_JOB};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: Duration,
    /// Upper bound on rows touched per step.
    pub batch_size: i64,
    pub pending_expiry: Duration,
    pub audit_retention: Duration,
    /// Applies to CANCELLED, EXPIRED and FAILED sessions.
    pub closed_session_retention: Duration,
    /// `None` keeps processed sessions forever.
    pub processed_session_retention: Option<Duration>,
    /// `None` keeps ledger entries forever.
    pub ledger_retention: Option<Duration>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        let days = |n: u64| Duration::from_secs(n * 24 * 3600);
        Self {
            interval: Duration::from_secs(6 * 3600),
            batch_size: 500,
            pending_expiry: Duration::from_secs(30 * 60),
            audit_retention: days(90),
            closed_session_retention: days(30),
            processed_session_retention: Some(days(365)),
            ledger_retention: Some(days(365)),
        }
    }
}

impl From<&SweepConfig> for CleanupConfig {
    fn from(sweeps: &SweepConfig) -> Self {
        Self {
            interval: sweeps.cleanup_interval,
            batch_size: sweeps.cleanup_batch_size,
            pending_expiry: sweeps.pending_expiry,
            audit_retention: sweeps.audit_retention,
            closed_session_retention: sweeps.closed_session_retention,
            processed_session_retention: sweeps.processed_session_retention,
            ledger_retention: sweeps.ledger_retention,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub lock_acquired: bool,
    pub expired: usize,
    pub audit_deleted: u64,
    pub closed_deleted: usize,
    pub processed_deleted: usize,
    pub ledger_deleted: u64,
    pub failed_steps: usize,
}

/// Expires abandoned sessions and enforces retention windows.
///
/// Deletion only ever goes through [`TerminalStatus`], so PENDING and PAID
/// sessions cannot be deleted here. PAID sessions are not touched at all.
pub struct CleanupWorker {
    sessions: Arc<dyn SessionStore>,
    ledger: Arc<dyn IdempotencyLedger>,
    audit: Arc<dyn WebhookAuditLog>,
    lock: Arc<dyn DistributedLock>,
    config: CleanupConfig,
}

impl CleanupWorker {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        ledger: Arc<dyn IdempotencyLedger>,
        audit: Arc<dyn WebhookAuditLog>,
        lock: Arc<dyn DistributedLock>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            sessions,
            ledger,
            audit,
            lock,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            pending_expiry_secs = self.config.pending_expiry.as_secs(),
            "cleanup sweep started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("cleanup sweep stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    match self.run_cycle(Utc::now()).await {
                        Ok(report) if report.lock_acquired => {
                            info!(
                                expired = report.expired,
                                audit_deleted = report.audit_deleted,
                                closed_deleted = report.closed_deleted,
                                processed_deleted = report.processed_deleted,
                                ledger_deleted = report.ledger_deleted,
                                failed_steps = report.failed_steps,
                                "cleanup tick finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "cleanup tick failed"),
                    }
                }
            }
        }

        info!("cleanup sweep stopped");
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CleanupReport, SweepError> {
        let key = JobLockKey::new(CLEANUP_JOB).to_string();
        let ttl = SweepConfig::lock_ttl(self.config.interval);

        let Some(lease) = self.lock.try_acquire(&key, ttl).await? else {
            debug!("cleanup lock held by another replica");
            return Ok(CleanupReport::default());
        };

        let mut report = CleanupReport {
            lock_acquired: true,
            ..Default::default()
        };
        self.sweep(now, &mut report).await;

        match self.lock.release(&lease).await {
            Ok(true) => {}
            Ok(false) => warn!("cleanup lock lapsed before release"),
            Err(e) => warn!(error = %e, "failed to release cleanup lock"),
        }

        Ok(report)
    }

    /// Each step stands alone; one failing does not stop the rest.
    async fn sweep(&self, now: DateTime<Utc>, report: &mut CleanupReport) {
        let batch = self.config.batch_size;

        let created_before = now - chrono_duration(self.config.pending_expiry);
        match self.sessions.expire_pending(created_before, batch, now).await {
            Ok(expired) => report.expired = expired.len(),
            Err(e) => {
                warn!(error = %e, "failed to expire pending sessions");
                report.failed_steps += 1;
            }
        }

        let audit_before = now - chrono_duration(self.config.audit_retention);
        match self.audit.delete_before(audit_before, batch).await {
            Ok(deleted) => report.audit_deleted = deleted,
            Err(e) => {
                warn!(error = %e, "failed to delete webhook audit records");
                report.failed_steps += 1;
            }
        }

        let closed_before = now - chrono_duration(self.config.closed_session_retention);
        for status in [
            TerminalStatus::Cancelled,
            TerminalStatus::Expired,
            TerminalStatus::Failed,
        ] {
            match self.sessions.delete_terminal(status, closed_before, batch).await {
                Ok(deleted) => report.closed_deleted += deleted.len(),
                Err(e) => {
                    warn!(status = status.as_str(), error = %e, "failed to delete closed sessions");
                    report.failed_steps += 1;
                }
            }
        }

        if let Some(retention) = self.config.processed_session_retention {
            let before = now - chrono_duration(retention);
            match self
                .sessions
                .delete_terminal(TerminalStatus::Processed, before, batch)
                .await
            {
                Ok(deleted) => report.processed_deleted = deleted.len(),
                Err(e) => {
                    warn!(error = %e, "failed to delete processed sessions");
                    report.failed_steps += 1;
                }
            }
        }

        if let Some(retention) = self.config.ledger_retention {
            let before = now - chrono_duration(retention);
            match self.ledger.delete_processed_before(before, batch).await {
                Ok(deleted) => report.ledger_deleted = deleted,
                Err(e) => {
                    warn!(error = %e, "failed to delete ledger entries");
                    report.failed_steps += 1;
                }
            }
        }
    }
}
