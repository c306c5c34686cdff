use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::line_item::{LineItem, LineItemLedger};
use super::order_types::SHOP_ORDER;
use super::value_objects::{Address, AddressKind, CustomerRef, OrderId, OrderStatus, OrderTotals};

// ============================================================================
// Order Aggregate
// ============================================================================

pub const CREATED_VIA_CHECKOUT: &str = "checkout";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderNote {
    pub content: String,
    pub added_at: DateTime<Utc>,
}

/// Refund-only attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundDetails {
    pub amount: Decimal,
    pub reason: String,
    pub refunded_by: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    // Identity
    pub id: OrderId,
    pub order_type: String,
    pub parent_id: Option<OrderId>,

    // State
    pub status: OrderStatus,
    pub customer_id: Option<i64>,
    pub created_via: Option<String>,
    #[serde(default)]
    pub coupon_codes: Vec<String>,
    pub totals: OrderTotals,
    pub items: LineItemLedger,

    // Audit trail
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Vec<OrderNote>,

    /// Open key/value extension point; also holds effect markers
    #[serde(default)]
    pub meta: BTreeMap<String, String>,

    #[serde(default)]
    pub refund: Option<RefundDetails>,
}

impl Order {
    pub fn new(order_type: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: OrderId::UNSAVED,
            order_type: order_type.into(),
            parent_id: None,
            status: OrderStatus::Pending,
            customer_id: None,
            created_via: None,
            coupon_codes: Vec::new(),
            totals: OrderTotals::default(),
            items: LineItemLedger::new(),
            created_at: now,
            modified_at: now,
            completed_at: None,
            paid_at: None,
            notes: Vec::new(),
            meta: BTreeMap::new(),
            refund: None,
        }
    }

    /// A standard shop order placed through checkout
    pub fn checkout(now: DateTime<Utc>) -> Self {
        let mut order = Self::new(SHOP_ORDER, now);
        order.created_via = Some(CREATED_VIA_CHECKOUT.to_string());
        order
    }

    pub fn is_refund(&self) -> bool {
        self.refund.is_some()
    }

    pub fn add_item(&mut self, item: LineItem) {
        self.items.add(item);
    }

    pub fn add_note(&mut self, content: impl Into<String>, now: DateTime<Utc>) {
        let content = content.into();
        if content.trim().is_empty() {
            return;
        }
        self.notes.push(OrderNote { content, added_at: now });
    }

    // ------------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------------

    pub fn get_meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.meta.insert(key.into(), value.into());
    }

    pub fn delete_meta(&mut self, key: &str) -> bool {
        self.meta.remove(key).is_some()
    }

    pub fn has_flag(&self, key: &str) -> bool {
        matches!(self.get_meta(key), Some("yes") | Some("1"))
    }

    // ------------------------------------------------------------------------
    // Customer data
    // ------------------------------------------------------------------------

    /// Write an address into `_billing_*` / `_shipping_*` meta plus its search index
    pub fn set_address(&mut self, kind: AddressKind, address: &Address) {
        let prefix = kind.prefix();
        for (field, value) in address.fields() {
            if kind == AddressKind::Shipping && matches!(field, "email" | "phone") {
                continue;
            }
            self.set_meta(format!("{}_{}", prefix, field), value);
        }
        self.set_meta(format!("{}_address_index", prefix), address.search_index());
    }

    pub fn billing_email(&self) -> Option<&str> {
        self.get_meta("_billing_email").filter(|email| !email.is_empty())
    }

    /// Identity used for per-customer accounting: user id, else billing email
    pub fn customer_ref(&self) -> Option<CustomerRef> {
        match self.customer_id {
            Some(id) if id > 0 => Some(CustomerRef::UserId(id)),
            _ => self.billing_email().map(|email| CustomerRef::Email(email.to_string())),
        }
    }

    // ------------------------------------------------------------------------
    // Totals
    // ------------------------------------------------------------------------

    /// Recompute every total from the line items
    pub fn calculate_totals(&mut self) {
        let subtotal: Decimal = self.items.products().map(|item| item.subtotal).sum();
        let products_total = self.items.sum_total("line_item");
        let shipping = self.items.sum_total("shipping");
        let fees = self.items.sum_total("fee");
        let tax = self.items.sum_tax();

        self.totals = OrderTotals {
            subtotal,
            discount: subtotal - products_total,
            shipping,
            fees,
            tax,
            total: products_total + shipping + fees + tax,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::value_objects::ProductId;

    fn dec(units: i64, scale: u32) -> Decimal {
        Decimal::new(units, scale)
    }

    #[test]
    fn test_calculate_totals() {
        let mut order = Order::checkout(Utc::now());
        order.add_item(
            LineItem::product(ProductId(1), "Book", 2, dec(3600, 2))
                .with_subtotal(dec(4000, 2))
                .with_tax("1", dec(360, 2)),
        );
        order.add_item(LineItem::shipping("flat_rate", "Flat rate", dec(500, 2)));
        order.add_item(LineItem::fee("Handling", dec(100, 2)));

        order.calculate_totals();

        assert_eq!(order.totals.subtotal, dec(4000, 2));
        assert_eq!(order.totals.discount, dec(400, 2));
        assert_eq!(order.totals.tax, dec(360, 2));
        assert_eq!(order.totals.total, dec(4560, 2));
    }

    #[test]
    fn test_set_address_writes_meta_and_index() {
        let mut order = Order::checkout(Utc::now());
        let address = Address {
            first_name: "Grace".to_string(),
            last_name: "Hopper".to_string(),
            email: "grace@example.com".to_string(),
            city: "Arlington".to_string(),
            ..Default::default()
        };

        order.set_address(AddressKind::Billing, &address);
        order.set_address(AddressKind::Shipping, &address);

        assert_eq!(order.get_meta("_billing_last_name"), Some("Hopper"));
        assert_eq!(order.billing_email(), Some("grace@example.com"));
        assert_eq!(order.get_meta("_shipping_email"), None);
        assert!(order.get_meta("_shipping_address_index").unwrap().contains("Arlington"));
    }

    #[test]
    fn test_customer_ref_prefers_user_id() {
        let mut order = Order::checkout(Utc::now());
        order.set_meta("_billing_email", "guest@example.com");
        assert_eq!(order.customer_ref(), Some(CustomerRef::Email("guest@example.com".to_string())));

        order.customer_id = Some(42);
        assert_eq!(order.customer_ref(), Some(CustomerRef::UserId(42)));
    }

    #[test]
    fn test_blank_notes_are_ignored() {
        let mut order = Order::checkout(Utc::now());
        order.add_note("  ", Utc::now());
        order.add_note("Payment received", Utc::now());
        assert_eq!(order.notes.len(), 1);
    }
}
