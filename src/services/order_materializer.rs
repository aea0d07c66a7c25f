//! Boundary to the order subsystem.

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::services::verification::VerifiedPayment;
use crate::sessions::model::{items_total, CartItem, PaymentSession};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Turns a verified payment into one order per seller.
///
/// Implementations must be idempotent per `(invoice_id, seller_id)`: a repeat
/// call for the same invoice returns the ids created the first time.
#[async_trait]
pub trait OrderMaterializer: Send + Sync {
    async fn materialize(
        &self,
        session: &PaymentSession,
        payment: &VerifiedPayment,
    ) -> Result<Vec<String>, DatabaseError>;
}

/// One seller's share of a cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDraft {
    pub seller_id: String,
    pub items: Vec<CartItem>,
    pub total: Decimal,
    pub currency: String,
}

/// Split the session's cart into per-seller drafts, in cart order.
pub fn order_drafts(session: &PaymentSession) -> Result<Vec<OrderDraft>, DatabaseError> {
    let cart = &session.cart_snapshot;
    cart.items_by_seller()
        .into_iter()
        .map(|(seller_id, items)| {
            let total = items_total(items.iter().copied()).ok_or_else(|| {
                DatabaseError::new(DatabaseErrorKind::QueryError {
                    message: format!(
                        "order total for seller '{}' in session {} is out of range",
                        seller_id, session.session_id
                    ),
                })
            })?;
            Ok(OrderDraft {
                seller_id: seller_id.to_string(),
                total,
                items: items.into_iter().cloned().collect(),
                currency: cart.currency.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::model::CartSnapshot;
    use chrono::Utc;

    fn item(product: &str, seller: &str, qty: u32, price: i64) -> CartItem {
        CartItem {
            product_id: product.to_string(),
            seller_id: seller.to_string(),
            name: None,
            quantity: qty,
            unit_price: Decimal::from(price),
        }
    }

    #[test]
    fn test_drafts_split_by_seller() {
        let cart = CartSnapshot {
            items: vec![
                item("p-1", "s-a", 2, 100),
                item("p-2", "s-b", 1, 50),
                item("p-3", "s-a", 1, 25),
            ],
            sellers: vec!["s-a".to_string(), "s-b".to_string()],
            total: Decimal::from(275),
            currency: "MNT".to_string(),
        };
        let session = PaymentSession::new("user-1", cart, 275, "qr_gateway", Utc::now());

        let drafts = order_drafts(&session).unwrap();
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].seller_id, "s-a");
        assert_eq!(drafts[0].items.len(), 2);
        assert_eq!(drafts[0].total, Decimal::from(225));
        assert_eq!(drafts[1].total, Decimal::from(50));
    }

    #[test]
    fn test_overflowing_seller_total_is_an_error() {
        let cart = CartSnapshot {
            items: vec![item("p-1", "s-a", 1, 1), item("p-2", "s-a", 1, 1)],
            sellers: vec!["s-a".to_string()],
            total: Decimal::from(2),
            currency: "MNT".to_string(),
        };
        let mut session = PaymentSession::new("user-1", cart, 2, "qr_gateway", Utc::now());
        session.cart_snapshot.items[0].unit_price = Decimal::MAX;

        let err = order_drafts(&session).unwrap_err();
        assert!(matches!(err.kind, DatabaseErrorKind::QueryError { .. }));
    }
}
