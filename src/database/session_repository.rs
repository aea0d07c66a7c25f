use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::sessions::model::{
    CartSnapshot, PaymentSession, ReceiptRecord, ReceiptStatus, SessionStatus, TerminalStatus,
};
use crate::sessions::store::{SessionStore, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Raw `payment_sessions` row
#[derive(Debug, Clone, FromRow)]
struct SessionRow {
    session_id: Uuid,
    user_id: String,
    cart_snapshot: Json<CartSnapshot>,
    expected_amount: i64,
    provider: String,
    invoice_id: Option<String>,
    payment_id: Option<String>,
    paid_amount: Option<Decimal>,
    callback_token: String,
    status: String,
    last_checked_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    receipt_status: Option<String>,
    receipt_id: Option<String>,
    receipt_error: Option<String>,
    receipt_data: Option<JsonValue>,
}

impl TryFrom<SessionRow> for PaymentSession {
    type Error = DatabaseError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let decode = |message: String| {
            DatabaseError::new(DatabaseErrorKind::QueryError { message })
        };

        let status: SessionStatus = row.status.parse().map_err(decode)?;
        let receipt = match row.receipt_status {
            Some(raw) => Some(ReceiptRecord {
                status: raw.parse::<ReceiptStatus>().map_err(decode)?,
                receipt_id: row.receipt_id,
                error: row.receipt_error,
                data: row.receipt_data,
            }),
            None => None,
        };

        Ok(PaymentSession {
            session_id: row.session_id,
            user_id: row.user_id,
            cart_snapshot: row.cart_snapshot.0,
            expected_amount: row.expected_amount,
            provider: row.provider,
            invoice_id: row.invoice_id,
            payment_id: row.payment_id,
            paid_amount: row.paid_amount,
            callback_token: row.callback_token,
            status,
            last_checked_at: row.last_checked_at,
            cancelled_at: row.cancelled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            receipt,
        })
    }
}

const SESSION_COLUMNS: &str = "session_id, user_id, cart_snapshot, expected_amount, provider, \
     invoice_id, payment_id, paid_amount, callback_token, status, last_checked_at, \
     cancelled_at, created_at, updated_at, receipt_status, receipt_id, receipt_error, receipt_data";

fn status_list(statuses: &[SessionStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

/// Authoritative session storage over `payment_sessions`.
pub struct PgSessionRepository {
    pool: PgPool,
}

impl PgSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionRepository {
    async fn insert(&self, session: &PaymentSession) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO payment_sessions
                (session_id, user_id, cart_snapshot, expected_amount, provider, invoice_id,
                 callback_token, status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(session.session_id)
        .bind(&session.user_id)
        .bind(Json(&session.cart_snapshot))
        .bind(session.expected_amount)
        .bind(&session.provider)
        .bind(&session.invoice_id)
        .bind(&session.callback_token)
        .bind(session.status.as_str())
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> StoreResult<Option<PaymentSession>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM payment_sessions WHERE session_id = $1",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        row.map(PaymentSession::try_from).transpose()
    }

    async fn assign_invoice(
        &self,
        session_id: Uuid,
        invoice_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_sessions
             SET invoice_id = $2, updated_at = $3
             WHERE session_id = $1 AND invoice_id IS NULL",
        )
        .bind(session_id)
        .bind(invoice_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    async fn transition(
        &self,
        session_id: Uuid,
        to: SessionStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<PaymentSession>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "UPDATE payment_sessions
             SET status = $3,
                 updated_at = $4,
                 cancelled_at = CASE WHEN $3 = 'CANCELLED' THEN $4 ELSE cancelled_at END
             WHERE session_id = $1 AND status = ANY($2)
             RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .bind(status_list(to.allowed_sources()))
        .bind(to.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        row.map(PaymentSession::try_from).transpose()
    }

    async fn record_payment(
        &self,
        session_id: Uuid,
        payment_id: Option<&str>,
        paid_amount: Decimal,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE payment_sessions
             SET payment_id = COALESCE(payment_id, $2), paid_amount = $3, updated_at = $4
             WHERE session_id = $1",
        )
        .bind(session_id)
        .bind(payment_id)
        .bind(paid_amount)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::new(DatabaseErrorKind::NotFound {
                entity: "payment_session".to_string(),
                id: session_id.to_string(),
            }));
        }
        Ok(())
    }

    async fn claim_check(
        &self,
        session_id: Uuid,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_sessions
             SET last_checked_at = $3
             WHERE session_id = $1 AND (last_checked_at IS NULL OR last_checked_at <= $2)",
        )
        .bind(session_id)
        .bind(cutoff)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() == 1)
    }

    async fn reconcile_candidates(
        &self,
        updated_before: DateTime<Utc>,
        checked_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<PaymentSession>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM payment_sessions
             WHERE status IN ('PENDING', 'PAID')
               AND invoice_id IS NOT NULL
               AND updated_at < $1
               AND (last_checked_at IS NULL OR last_checked_at <= $2)
             ORDER BY last_checked_at NULLS FIRST, updated_at
             LIMIT $3",
            SESSION_COLUMNS
        ))
        .bind(updated_before)
        .bind(checked_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        rows.into_iter().map(PaymentSession::try_from).collect()
    }

    async fn expire_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Uuid>> {
        sqlx::query_scalar::<_, Uuid>(
            "UPDATE payment_sessions
             SET status = 'EXPIRED', updated_at = $3
             WHERE session_id IN (
                 SELECT session_id FROM payment_sessions
                 WHERE status = 'PENDING' AND created_at < $1
                 ORDER BY created_at
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             AND status = 'PENDING'
             RETURNING session_id",
        )
        .bind(created_before)
        .bind(limit)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn delete_terminal(
        &self,
        status: TerminalStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Uuid>> {
        sqlx::query_scalar::<_, Uuid>(
            "DELETE FROM payment_sessions
             WHERE session_id IN (
                 SELECT session_id FROM payment_sessions
                 WHERE status = $1 AND updated_at < $2
                 ORDER BY updated_at
                 LIMIT $3
             )
             AND status = $1
             RETURNING session_id",
        )
        .bind(status.as_str())
        .bind(updated_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn update_receipt(
        &self,
        session_id: Uuid,
        receipt: &ReceiptRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE payment_sessions
             SET receipt_status = $2, receipt_id = $3, receipt_error = $4, receipt_data = $5,
                 updated_at = $6
             WHERE session_id = $1",
        )
        .bind(session_id)
        .bind(receipt.status.as_str())
        .bind(&receipt.receipt_id)
        .bind(&receipt.error)
        .bind(&receipt.data)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }
}
