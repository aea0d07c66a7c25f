use crate::cache::keys::lock::JobLockKey;
use crate::config::SweepConfig;
use crate::locking::DistributedLock;
use crate::services::verification::{PaymentVerifier, ProcessingReason};
use crate::sessions::store::SessionStore;
use crate::workers::{chrono_duration, SweepError, RECONCILIATION_JOB};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// How often the sweep wakes up.
    pub interval: Duration,
    /// Maximum sessions checked per tick.
    pub batch_size: i64,
    /// Sessions updated more recently than this are left to the webhook.
    pub min_age: Duration,
    /// Minimum gap between two gateway checks of the same session.
    pub check_cooldown: Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 25,
            min_age: Duration::from_secs(30),
            check_cooldown: Duration::from_secs(20),
        }
    }
}

impl From<&SweepConfig> for ReconciliationConfig {
    fn from(sweeps: &SweepConfig) -> Self {
        Self {
            interval: sweeps.reconcile_interval,
            batch_size: sweeps.reconcile_batch_size,
            min_age: sweeps.reconcile_min_age,
            check_cooldown: sweeps.check_cooldown,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub lock_acquired: bool,
    pub candidates: usize,
    pub skipped_cooldown: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub not_paid: usize,
    pub amount_mismatch: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Polls the gateway for sessions whose webhook never arrived.
pub struct ReconciliationWorker {
    sessions: Arc<dyn SessionStore>,
    verifier: Arc<PaymentVerifier>,
    lock: Arc<dyn DistributedLock>,
    config: ReconciliationConfig,
}

impl ReconciliationWorker {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        verifier: Arc<PaymentVerifier>,
        lock: Arc<dyn DistributedLock>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            sessions,
            verifier,
            lock,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "reconciliation sweep started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("reconciliation sweep stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    match self.run_cycle(Utc::now()).await {
                        Ok(report) if report.candidates > 0 => {
                            info!(
                                candidates = report.candidates,
                                processed = report.processed,
                                duplicates = report.duplicates,
                                not_paid = report.not_paid,
                                amount_mismatch = report.amount_mismatch,
                                failed = report.failed,
                                "reconciliation tick finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "reconciliation tick failed"),
                    }
                }
            }
        }

        info!("reconciliation sweep stopped");
    }

    /// One tick. The lock is released whatever happens inside.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<ReconciliationReport, SweepError> {
        let key = JobLockKey::new(RECONCILIATION_JOB).to_string();
        let ttl = SweepConfig::lock_ttl(self.config.interval);

        let Some(lease) = self.lock.try_acquire(&key, ttl).await? else {
            debug!("reconciliation lock held by another replica");
            return Ok(ReconciliationReport::default());
        };

        let mut report = ReconciliationReport {
            lock_acquired: true,
            ..Default::default()
        };
        let outcome = self.reconcile(now, &mut report).await;

        match self.lock.release(&lease).await {
            Ok(true) => {}
            Ok(false) => warn!("reconciliation lock lapsed before release"),
            Err(e) => warn!(error = %e, "failed to release reconciliation lock"),
        }

        outcome.map(|_| report)
    }

    async fn reconcile(
        &self,
        now: DateTime<Utc>,
        report: &mut ReconciliationReport,
    ) -> Result<(), SweepError> {
        let updated_before = now - chrono_duration(self.config.min_age);
        let cutoff = now - chrono_duration(self.config.check_cooldown);

        let candidates = self
            .sessions
            .reconcile_candidates(updated_before, cutoff, self.config.batch_size)
            .await?;
        report.candidates = candidates.len();

        for session in candidates {
            let session_id = session.session_id;
            match self.sessions.claim_check(session_id, cutoff, now).await {
                Ok(true) => {}
                Ok(false) => {
                    report.skipped_cooldown += 1;
                    continue;
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "failed to claim session check");
                    report.failed += 1;
                    continue;
                }
            }

            match self.verifier.verify_and_materialize(&session).await {
                Ok(result) => match result.reason {
                    ProcessingReason::Processed => report.processed += 1,
                    ProcessingReason::Duplicate => report.duplicates += 1,
                    ProcessingReason::NotPaid => report.not_paid += 1,
                    ProcessingReason::AmountMismatch => report.amount_mismatch += 1,
                    _ => {}
                },
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "reconciliation check failed");
                    report.failed += 1;
                }
            }
        }

        Ok(())
    }
}
