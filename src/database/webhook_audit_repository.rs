use crate::database::error::DatabaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

/// Which door a webhook call came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookSource {
    Public,
    Internal,
}

impl WebhookSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookSource::Public => "public",
            WebhookSource::Internal => "internal",
        }
    }
}

/// Write-once record of one inbound webhook call and its outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookAuditRecord {
    pub id: Uuid,
    pub source: WebhookSource,
    pub session_id: Option<Uuid>,
    pub invoice_id: Option<String>,
    pub reason: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait WebhookAuditLog: Send + Sync {
    async fn record(&self, record: &WebhookAuditRecord) -> Result<(), DatabaseError>;

    async fn delete_before(&self, before: DateTime<Utc>, limit: i64) -> Result<u64, DatabaseError>;
}

pub struct PgWebhookAuditRepository {
    pool: PgPool,
}

impl PgWebhookAuditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookAuditLog for PgWebhookAuditRepository {
    async fn record(&self, record: &WebhookAuditRecord) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO webhook_audit_log
                (id, source, session_id, invoice_id, reason, payload, received_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(record.id)
        .bind(record.source.as_str())
        .bind(record.session_id)
        .bind(record.invoice_id.as_deref())
        .bind(&record.reason)
        .bind(&record.payload)
        .bind(record.received_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    async fn delete_before(&self, before: DateTime<Utc>, limit: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "DELETE FROM webhook_audit_log
             WHERE id IN (
                 SELECT id FROM webhook_audit_log
                 WHERE received_at < $1
                 ORDER BY received_at
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
