use crate::database::error::{DatabaseError, DatabaseErrorKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// One row per invoice that reached verified-paid.
///
/// The primary key on `invoice_id` is what makes materialization happen at
/// most once: whoever inserts the row owns materialization, everyone else
/// reads it back.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct LedgerEntry {
    pub invoice_id: String,
    pub session_id: Uuid,
    pub order_ids: Vec<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub claim_token: Uuid,
    pub claimed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Orders exist and are recorded.
    pub fn is_complete(&self) -> bool {
        self.processed_at.is_some()
    }

    /// An unfinished entry whose owner has gone quiet.
    pub fn claim_expired(&self, stale_before: DateTime<Utc>) -> bool {
        !self.is_complete() && self.claimed_at < stale_before
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerInsert {
    /// This caller created the entry and owns materialization.
    Created(LedgerEntry),
    /// Another caller got there first.
    AlreadyExists,
}

pub type LedgerResult<T> = Result<T, DatabaseError>;

#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    async fn find(&self, invoice_id: &str) -> LedgerResult<Option<LedgerEntry>>;

    /// Insert the entry for `invoice_id`. A uniqueness conflict is reported as
    /// [`LedgerInsert::AlreadyExists`], never as an error.
    async fn try_create(
        &self,
        invoice_id: &str,
        session_id: Uuid,
        claim_token: Uuid,
        now: DateTime<Utc>,
    ) -> LedgerResult<LedgerInsert>;

    /// Record the order ids. Only the current claim holder can complete.
    async fn complete(
        &self,
        invoice_id: &str,
        claim_token: Uuid,
        order_ids: &[String],
        now: DateTime<Utc>,
    ) -> LedgerResult<bool>;

    /// Give up an unfinished claim so the next caller can take it at once.
    async fn release_claim(&self, invoice_id: &str, claim_token: Uuid) -> LedgerResult<bool>;

    /// Take over an unfinished entry whose claim is older than `stale_before`.
    async fn reclaim_stale(
        &self,
        invoice_id: &str,
        claim_token: Uuid,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<LedgerEntry>>;

    /// Retention: delete completed entries processed before `before`.
    /// Unfinished entries are never deleted.
    async fn delete_processed_before(&self, before: DateTime<Utc>, limit: i64)
        -> LedgerResult<u64>;
}

/// Postgres implementation over `payment_ledger`.
pub struct PgLedgerRepository {
    pool: PgPool,
}

impl PgLedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const LEDGER_COLUMNS: &str =
    "invoice_id, session_id, order_ids, processed_at, claim_token, claimed_at, created_at";

#[async_trait]
impl IdempotencyLedger for PgLedgerRepository {
    async fn find(&self, invoice_id: &str) -> LedgerResult<Option<LedgerEntry>> {
        sqlx::query_as::<_, LedgerEntry>(&format!(
            "SELECT {} FROM payment_ledger WHERE invoice_id = $1",
            LEDGER_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn try_create(
        &self,
        invoice_id: &str,
        session_id: Uuid,
        claim_token: Uuid,
        now: DateTime<Utc>,
    ) -> LedgerResult<LedgerInsert> {
        let inserted = sqlx::query_as::<_, LedgerEntry>(&format!(
            "INSERT INTO payment_ledger
                (invoice_id, session_id, order_ids, claim_token, claimed_at, created_at)
             VALUES ($1, $2, '{{}}', $3, $4, $4)
             RETURNING {}",
            LEDGER_COLUMNS
        ))
        .bind(invoice_id)
        .bind(session_id)
        .bind(claim_token)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx);

        match inserted {
            Ok(entry) => Ok(LedgerInsert::Created(entry)),
            Err(e) if e.is_unique_violation() => Ok(LedgerInsert::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    async fn complete(
        &self,
        invoice_id: &str,
        claim_token: Uuid,
        order_ids: &[String],
        now: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_ledger
             SET order_ids = $3, processed_at = $4
             WHERE invoice_id = $1 AND claim_token = $2 AND processed_at IS NULL",
        )
        .bind(invoice_id)
        .bind(claim_token)
        .bind(order_ids)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_claim(&self, invoice_id: &str, claim_token: Uuid) -> LedgerResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_ledger
             SET claimed_at = 'epoch'::timestamptz
             WHERE invoice_id = $1 AND claim_token = $2 AND processed_at IS NULL",
        )
        .bind(invoice_id)
        .bind(claim_token)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    async fn reclaim_stale(
        &self,
        invoice_id: &str,
        claim_token: Uuid,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<LedgerEntry>> {
        sqlx::query_as::<_, LedgerEntry>(&format!(
            "UPDATE payment_ledger
             SET claim_token = $2, claimed_at = $4
             WHERE invoice_id = $1 AND processed_at IS NULL AND claimed_at < $3
             RETURNING {}",
            LEDGER_COLUMNS
        ))
        .bind(invoice_id)
        .bind(claim_token)
        .bind(stale_before)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn delete_processed_before(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> LedgerResult<u64> {
        if limit <= 0 {
            return Err(DatabaseError::new(DatabaseErrorKind::QueryError {
                message: "delete limit must be positive".to_string(),
            }));
        }

        let result = sqlx::query(
            "DELETE FROM payment_ledger
             WHERE invoice_id IN (
                 SELECT invoice_id FROM payment_ledger
                 WHERE processed_at IS NOT NULL AND processed_at < $1
                 ORDER BY processed_at
                 LIMIT $2
             )",
        )
        .bind(before)
        .bind(limit)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(processed: bool, claimed_at: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry {
            invoice_id: "INV-1".to_string(),
            session_id: Uuid::new_v4(),
            order_ids: if processed { vec!["o-1".to_string()] } else { vec![] },
            processed_at: processed.then_some(claimed_at),
            claim_token: Uuid::new_v4(),
            claimed_at,
            created_at: claimed_at,
        }
    }

    #[test]
    fn test_completed_entries_never_expire() {
        let now = Utc::now();
        let e = entry(true, now - Duration::hours(2));
        assert!(!e.claim_expired(now));
    }

    #[test]
    fn test_unfinished_claim_expires_after_cutoff() {
        let now = Utc::now();
        let e = entry(false, now - Duration::minutes(10));
        assert!(e.claim_expired(now - Duration::minutes(5)));
        assert!(!e.claim_expired(now - Duration::minutes(15)));
    }

    #[tokio::test]
    #[ignore] // Requires database running
    async fn test_second_insert_reports_already_exists() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = PgPool::connect(&url).await.unwrap();
        let repo = PgLedgerRepository::new(pool);
        let invoice = format!("INV-{}", Uuid::new_v4());

        let first = repo
            .try_create(&invoice, Uuid::new_v4(), Uuid::new_v4(), Utc::now())
            .await
            .unwrap();
        let second = repo
            .try_create(&invoice, Uuid::new_v4(), Uuid::new_v4(), Utc::now())
            .await
            .unwrap();

        assert!(matches!(first, LedgerInsert::Created(_)));
        assert_eq!(second, LedgerInsert::AlreadyExists);
    }
}
