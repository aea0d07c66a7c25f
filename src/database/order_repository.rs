use crate::database::error::DatabaseError;
use crate::services::order_materializer::{order_drafts, OrderDraft, OrderMaterializer};
use crate::services::verification::VerifiedPayment;
use crate::sessions::model::{CartItem, PaymentSession};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::info;
use uuid::Uuid;

/// Order row as stored in `orders`
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct OrderRecord {
    pub order_id: String,
    pub invoice_id: String,
    pub session_id: Uuid,
    pub user_id: String,
    pub seller_id: String,
    pub items: Json<Vec<CartItem>>,
    pub total: Decimal,
    pub currency: String,
    pub payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OrderRecord {
    pub fn from_draft(
        draft: OrderDraft,
        session: &PaymentSession,
        payment: &VerifiedPayment,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id: format!("ord_{}", Uuid::new_v4().simple()),
            invoice_id: payment.invoice_id().to_string(),
            session_id: session.session_id,
            user_id: session.user_id.clone(),
            seller_id: draft.seller_id,
            items: Json(draft.items),
            total: draft.total,
            currency: draft.currency,
            payment_id: payment.payment_id().map(str::to_string),
            created_at: now,
        }
    }
}

pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderMaterializer for PgOrderRepository {
    async fn materialize(
        &self,
        session: &PaymentSession,
        payment: &VerifiedPayment,
    ) -> Result<Vec<String>, DatabaseError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;
        let mut order_ids = Vec::new();

        for draft in order_drafts(session)? {
            let record = OrderRecord::from_draft(draft, session, payment, now);
            // An earlier partial attempt keeps its order id
            let order_id: String = sqlx::query_scalar(
                "INSERT INTO orders
                    (order_id, invoice_id, session_id, user_id, seller_id, items, total,
                     currency, payment_id, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 ON CONFLICT (invoice_id, seller_id)
                 DO UPDATE SET payment_id = COALESCE(orders.payment_id, EXCLUDED.payment_id)
                 RETURNING order_id",
            )
            .bind(&record.order_id)
            .bind(&record.invoice_id)
            .bind(record.session_id)
            .bind(&record.user_id)
            .bind(&record.seller_id)
            .bind(&record.items)
            .bind(record.total)
            .bind(&record.currency)
            .bind(&record.payment_id)
            .bind(record.created_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            order_ids.push(order_id);
        }

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;

        info!(
            session_id = %session.session_id,
            order_count = order_ids.len(),
            "Orders materialized"
        );
        Ok(order_ids)
    }
}
