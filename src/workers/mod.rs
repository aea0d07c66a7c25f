//! Periodic sweeps. Each tick runs under a cross-replica lock so only one
//! replica does the work.

pub mod cleanup;
pub mod reconciliation;

pub use cleanup::{CleanupConfig, CleanupReport, CleanupWorker};
pub use reconciliation::{ReconciliationConfig, ReconciliationReport, ReconciliationWorker};

use crate::database::error::DatabaseError;
use crate::locking::LockError;
use std::time::Duration;

pub const RECONCILIATION_JOB: &str = "reconciliation";
pub const CLEANUP_JOB: &str = "cleanup";

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}
