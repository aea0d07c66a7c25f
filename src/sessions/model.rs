//! Payment session types and the status state machine

use chrono::{DateTime, Utc};
use rand::RngCore;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Paid,
    Processed,
    Cancelled,
    Expired,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::Paid => "PAID",
            SessionStatus::Processed => "PROCESSED",
            SessionStatus::Cancelled => "CANCELLED",
            SessionStatus::Expired => "EXPIRED",
            SessionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Pending | SessionStatus::Paid)
    }

    /// Statuses a session may be in for a move to `self` to be legal.
    pub fn allowed_sources(&self) -> &'static [SessionStatus] {
        match self {
            SessionStatus::Pending => &[],
            SessionStatus::Paid => &[SessionStatus::Pending],
            SessionStatus::Processed => &[SessionStatus::Paid],
            SessionStatus::Cancelled => &[SessionStatus::Pending, SessionStatus::Paid],
            SessionStatus::Expired => &[SessionStatus::Pending],
            SessionStatus::Failed => &[SessionStatus::Pending],
        }
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        next.allowed_sources().contains(self)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(SessionStatus::Pending),
            "PAID" => Ok(SessionStatus::Paid),
            "PROCESSED" => Ok(SessionStatus::Processed),
            "CANCELLED" => Ok(SessionStatus::Cancelled),
            "EXPIRED" => Ok(SessionStatus::Expired),
            "FAILED" => Ok(SessionStatus::Failed),
            other => Err(format!("unknown session status '{}'", other)),
        }
    }
}

/// Statuses the cleanup sweep may delete. There is no `Pending` or `Paid`
/// variant, so delete predicates built from this type can never match them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Processed,
    Cancelled,
    Expired,
    Failed,
}

impl TerminalStatus {
    pub fn as_status(&self) -> SessionStatus {
        match self {
            TerminalStatus::Processed => SessionStatus::Processed,
            TerminalStatus::Cancelled => SessionStatus::Cancelled,
            TerminalStatus::Expired => SessionStatus::Expired,
            TerminalStatus::Failed => SessionStatus::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.as_status().as_str()
    }
}

// ---------------------------------------------------------------------------
// Cart snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: String,
    pub seller_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub quantity: u32,
    pub unit_price: Decimal,
}

impl CartItem {
    /// `None` when the product does not fit a `Decimal`.
    pub fn line_total(&self) -> Option<Decimal> {
        self.unit_price.checked_mul(Decimal::from(self.quantity))
    }
}

/// Sum of line totals, `None` on overflow.
pub fn items_total<'a>(items: impl IntoIterator<Item = &'a CartItem>) -> Option<Decimal> {
    items
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, item| acc.checked_add(item.line_total()?))
}

/// Immutable copy of the cart taken when the session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartSnapshot {
    pub items: Vec<CartItem>,
    pub sellers: Vec<String>,
    pub total: Decimal,
    pub currency: String,
}

impl CartSnapshot {
    /// Structural checks on a cart submitted by the client.
    pub fn validate(&self) -> Result<(), String> {
        if self.items.is_empty() {
            return Err("cart has no items".to_string());
        }
        if self.total <= Decimal::ZERO {
            return Err("cart total must be positive".to_string());
        }
        if self.currency.trim().is_empty() {
            return Err("cart currency is required".to_string());
        }
        for (i, seller) in self.sellers.iter().enumerate() {
            if self.sellers[..i].contains(seller) {
                return Err(format!("seller '{}' is listed twice", seller));
            }
        }
        for item in &self.items {
            if item.quantity == 0 {
                return Err(format!("item '{}' has zero quantity", item.product_id));
            }
            if item.unit_price < Decimal::ZERO {
                return Err(format!("item '{}' has a negative price", item.product_id));
            }
            if !self.sellers.contains(&item.seller_id) {
                return Err(format!(
                    "item '{}' belongs to unlisted seller '{}'",
                    item.product_id, item.seller_id
                ));
            }
        }
        let computed = items_total(&self.items)
            .ok_or_else(|| "cart item total is out of range".to_string())?;
        if computed != self.total {
            return Err(format!(
                "cart total {} does not match item total {}",
                self.total, computed
            ));
        }
        Ok(())
    }

    /// Items grouped per seller, in seller list order. Sellers without items
    /// are skipped.
    pub fn items_by_seller(&self) -> Vec<(&str, Vec<&CartItem>)> {
        self.sellers
            .iter()
            .map(|seller| {
                let items: Vec<&CartItem> = self
                    .items
                    .iter()
                    .filter(|item| &item.seller_id == seller)
                    .collect();
                (seller.as_str(), items)
            })
            .filter(|(_, items)| !items.is_empty())
            .collect()
    }
}

/// Convert a cart total into settlement minor units.
///
/// Rounds half away from zero; the one-minor-unit tolerance in payment
/// verification absorbs the rounding.
pub fn settlement_amount(total: Decimal, rate: Decimal) -> Option<i64> {
    total
        .checked_mul(rate)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .filter(|amount| *amount > 0)
}

// ---------------------------------------------------------------------------
// Receipt sub-record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Pending,
    Issued,
    Failed,
    Skipped,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Pending => "pending",
            ReceiptStatus::Issued => "issued",
            ReceiptStatus::Failed => "failed",
            ReceiptStatus::Skipped => "skipped",
        }
    }
}

impl FromStr for ReceiptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReceiptStatus::Pending),
            "issued" => Ok(ReceiptStatus::Issued),
            "failed" => Ok(ReceiptStatus::Failed),
            "skipped" => Ok(ReceiptStatus::Skipped),
            other => Err(format!("unknown receipt status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub status: ReceiptStatus,
    pub receipt_id: Option<String>,
    pub error: Option<String>,
    pub data: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSession {
    pub session_id: Uuid,
    pub user_id: String,
    pub cart_snapshot: CartSnapshot,
    pub expected_amount: i64,
    pub provider: String,
    pub invoice_id: Option<String>,
    pub payment_id: Option<String>,
    pub paid_amount: Option<Decimal>,
    pub callback_token: String,
    pub status: SessionStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub receipt: Option<ReceiptRecord>,
}

impl PaymentSession {
    pub fn new(
        user_id: impl Into<String>,
        cart_snapshot: CartSnapshot,
        expected_amount: i64,
        provider: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id: user_id.into(),
            cart_snapshot,
            expected_amount,
            provider: provider.into(),
            invoice_id: None,
            payment_id: None,
            paid_amount: None,
            callback_token: generate_callback_token(),
            status: SessionStatus::Pending,
            last_checked_at: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
            receipt: None,
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}

/// 32 random bytes, hex encoded.
pub fn generate_callback_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn cart() -> CartSnapshot {
        CartSnapshot {
            items: vec![
                CartItem {
                    product_id: "p-1".to_string(),
                    seller_id: "s-1".to_string(),
                    name: Some("Tea".to_string()),
                    quantity: 2,
                    unit_price: dec("25"),
                },
                CartItem {
                    product_id: "p-2".to_string(),
                    seller_id: "s-2".to_string(),
                    name: None,
                    quantity: 1,
                    unit_price: dec("50"),
                },
            ],
            sellers: vec!["s-1".to_string(), "s-2".to_string()],
            total: dec("100"),
            currency: "MNT".to_string(),
        }
    }

    const ALL: [SessionStatus; 6] = [
        SessionStatus::Pending,
        SessionStatus::Paid,
        SessionStatus::Processed,
        SessionStatus::Cancelled,
        SessionStatus::Expired,
        SessionStatus::Failed,
    ];

    #[test]
    fn test_nothing_leaves_a_terminal_status() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{} -> {} allowed", from, to);
            }
        }
    }

    #[test]
    fn test_forward_transitions() {
        use SessionStatus::*;
        assert!(Pending.can_transition_to(Paid));
        assert!(Paid.can_transition_to(Processed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Paid.can_transition_to(Cancelled));
        assert!(Pending.can_transition_to(Expired));
        assert!(!Paid.can_transition_to(Expired));
        assert!(!Paid.can_transition_to(Pending));
        assert!(!Paid.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Processed));
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<SessionStatus>(), Ok(status));
        }
        assert!("paid".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_terminal_status_never_maps_to_live_status() {
        for t in [
            TerminalStatus::Processed,
            TerminalStatus::Cancelled,
            TerminalStatus::Expired,
            TerminalStatus::Failed,
        ] {
            assert!(t.as_status().is_terminal());
        }
    }

    #[test]
    fn test_cart_validation() {
        assert!(cart().validate().is_ok());

        let mut empty = cart();
        empty.items.clear();
        assert!(empty.validate().is_err());

        let mut wrong_total = cart();
        wrong_total.total = dec("99");
        assert!(wrong_total.validate().is_err());

        let mut unknown_seller = cart();
        unknown_seller.sellers.pop();
        assert!(unknown_seller.validate().is_err());

        let mut repeated_seller = cart();
        repeated_seller.sellers.push("s-1".to_string());
        assert_eq!(
            repeated_seller.validate(),
            Err("seller 's-1' is listed twice".to_string())
        );
    }

    #[test]
    fn test_oversized_prices_are_rejected_not_panicking() {
        let mut cart = cart();
        cart.items[0].unit_price = Decimal::MAX;
        cart.items[0].quantity = 2;
        assert_eq!(
            cart.validate(),
            Err("cart item total is out of range".to_string())
        );

        assert_eq!(settlement_amount(Decimal::MAX, dec("2")), None);
    }

    #[test]
    fn test_items_grouped_by_seller() {
        let cart = cart();
        let groups = cart.items_by_seller();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "s-1");
        assert_eq!(groups[0].1.len(), 1);
    }

    #[test]
    fn test_settlement_amount_rounds_half_away_from_zero() {
        assert_eq!(settlement_amount(dec("100"), dec("1")), Some(100));
        assert_eq!(settlement_amount(dec("10.05"), dec("10")), Some(101));
        assert_eq!(settlement_amount(dec("1.25"), dec("3450.5")), Some(4313));
        assert_eq!(settlement_amount(dec("0.0001"), dec("1")), None);
    }

    #[test]
    fn test_callback_tokens_are_random_hex() {
        let a = generate_callback_token();
        let b = generate_callback_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
