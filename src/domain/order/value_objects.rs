use serde::{Deserialize, Serialize};
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

use super::errors::OrderError;

// ============================================================================
// Order Value Objects
// ============================================================================

/// Store-wide order identifier. Refund records share the same id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub i64);

impl OrderId {
    /// Placeholder id for an order that has not been saved yet
    pub const UNSAVED: OrderId = OrderId(0);

    pub fn is_saved(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Line item identifier, unique within the store (not only within an order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl ItemId {
    pub const UNSAVED: ItemId = ItemId(0);

    pub fn is_saved(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub i64);

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Order Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderStatus {
    Pending,
    Processing,
    OnHold,
    Completed,
    Cancelled,
    Refunded,
    Failed,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        OrderStatus::Pending,
        OrderStatus::Processing,
        OrderStatus::OnHold,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
        OrderStatus::Refunded,
        OrderStatus::Failed,
    ];

    pub fn slug(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::OnHold => "on-hold",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
            OrderStatus::Failed => "failed",
        }
    }

    /// Human-readable name used in audit notes
    pub fn label(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "Pending payment",
            OrderStatus::Processing => "Processing",
            OrderStatus::OnHold => "On hold",
            OrderStatus::Completed => "Completed",
            OrderStatus::Cancelled => "Cancelled",
            OrderStatus::Refunded => "Refunded",
            OrderStatus::Failed => "Failed",
        }
    }

    /// Statuses from which a gateway confirmation counts as a fresh payment
    pub fn is_payable(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::OnHold | OrderStatus::Failed | OrderStatus::Cancelled
        )
    }

    /// Statuses that represent a paid order
    pub fn is_paid(&self) -> bool {
        matches!(self, OrderStatus::Processing | OrderStatus::Completed)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for OrderStatus {
    type Err = OrderError;

    /// Accepts the bare slug or the storage form with a `wc-` prefix
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let slug = s.trim();
        let slug = slug.strip_prefix("wc-").unwrap_or(slug);

        OrderStatus::ALL
            .iter()
            .copied()
            .find(|status| status.slug() == slug)
            .ok_or_else(|| OrderError::InvalidStatus(s.to_string()))
    }
}

// ============================================================================
// Totals
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub shipping: Decimal,
    pub fees: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

// ============================================================================
// Addresses
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Billing,
    Shipping,
}

impl AddressKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            AddressKind::Billing => "_billing",
            AddressKind::Shipping => "_shipping",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub first_name: String,
    pub last_name: String,
    pub company: String,
    pub address_1: String,
    pub address_2: String,
    pub city: String,
    pub state: String,
    pub postcode: String,
    pub country: String,
    pub email: String,
    pub phone: String,
}

impl Address {
    /// Field name/value pairs in storage order
    pub fn fields(&self) -> [(&'static str, &str); 11] {
        [
            ("first_name", &self.first_name),
            ("last_name", &self.last_name),
            ("company", &self.company),
            ("address_1", &self.address_1),
            ("address_2", &self.address_2),
            ("city", &self.city),
            ("state", &self.state),
            ("postcode", &self.postcode),
            ("country", &self.country),
            ("email", &self.email),
            ("phone", &self.phone),
        ]
    }

    /// Space-joined denormalization used by free-text search
    pub fn search_index(&self) -> String {
        self.fields()
            .iter()
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Who an order belongs to: a registered customer or a guest email
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomerRef {
    UserId(i64),
    Email(String),
}

impl fmt::Display for CustomerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CustomerRef::UserId(id) => write!(f, "{}", id),
            CustomerRef::Email(email) => f.write_str(email),
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parses_slug_and_prefixed_form() {
        assert_eq!("on-hold".parse::<OrderStatus>().unwrap(), OrderStatus::OnHold);
        assert_eq!("wc-completed".parse::<OrderStatus>().unwrap(), OrderStatus::Completed);
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let result = "shipped".parse::<OrderStatus>();
        assert!(matches!(result, Err(OrderError::InvalidStatus(s)) if s == "shipped"));
    }

    #[test]
    fn test_status_serializes_as_slug() {
        let json = serde_json::to_string(&OrderStatus::OnHold).unwrap();
        assert_eq!(json, "\"on-hold\"");
    }

    #[test]
    fn test_payable_statuses() {
        assert!(OrderStatus::Pending.is_payable());
        assert!(OrderStatus::Failed.is_payable());
        assert!(!OrderStatus::Processing.is_payable());
        assert!(!OrderStatus::Refunded.is_payable());
    }

    #[test]
    fn test_address_search_index_skips_blank_fields() {
        let address = Address {
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            city: "London".to_string(),
            email: "ada@example.com".to_string(),
            ..Default::default()
        };

        assert_eq!(address.search_index(), "Ada Lovelace London ada@example.com");
    }
}
