use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::value_objects::{ItemId, ProductId};

// ============================================================================
// Line Items
// ============================================================================
//
// The priced components of an order. Every item kind shares the same money
// and metadata fields; kind-specific data lives in the variant.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LineItemKind {
    #[serde(rename = "line_item")]
    Product {
        product_id: Option<ProductId>,
        variation_id: Option<ProductId>,
    },
    Fee {
        tax_class: Option<String>,
    },
    Shipping {
        method_id: String,
    },
    Tax {
        rate_id: String,
        label: String,
    },
}

impl LineItemKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            LineItemKind::Product { .. } => "line_item",
            LineItemKind::Fee { .. } => "fee",
            LineItemKind::Shipping { .. } => "shipping",
            LineItemKind::Tax { .. } => "tax",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: ItemId,
    pub kind: LineItemKind,
    pub name: String,
    pub quantity: i64,

    /// Pre-discount line amounts
    pub subtotal: Decimal,
    pub subtotal_tax: Decimal,

    /// Line amounts after discounts, excluding tax
    pub total: Decimal,
    pub total_tax: Decimal,

    /// Tax amount per tax-rate id
    #[serde(default)]
    pub taxes: BTreeMap<String, Decimal>,

    #[serde(default)]
    pub meta: BTreeMap<String, String>,

    /// Set on refund items: the item of the parent order being refunded
    #[serde(default)]
    pub refunded_item_id: Option<ItemId>,
}

impl LineItem {
    pub fn new(kind: LineItemKind, name: impl Into<String>, quantity: i64, total: Decimal) -> Self {
        Self {
            id: ItemId::UNSAVED,
            kind,
            name: name.into(),
            quantity,
            subtotal: total,
            subtotal_tax: Decimal::ZERO,
            total,
            total_tax: Decimal::ZERO,
            taxes: BTreeMap::new(),
            meta: BTreeMap::new(),
            refunded_item_id: None,
        }
    }

    pub fn product(product_id: ProductId, name: impl Into<String>, quantity: i64, total: Decimal) -> Self {
        Self::new(
            LineItemKind::Product { product_id: Some(product_id), variation_id: None },
            name,
            quantity,
            total,
        )
    }

    pub fn fee(name: impl Into<String>, total: Decimal) -> Self {
        Self::new(LineItemKind::Fee { tax_class: None }, name, 1, total)
    }

    pub fn shipping(method_id: impl Into<String>, name: impl Into<String>, total: Decimal) -> Self {
        Self::new(LineItemKind::Shipping { method_id: method_id.into() }, name, 1, total)
    }

    /// Attach a tax amount under a tax-rate id, keeping total_tax in sync
    pub fn with_tax(mut self, rate_id: impl Into<String>, amount: Decimal) -> Self {
        self.taxes.insert(rate_id.into(), amount);
        self.total_tax = self.taxes.values().copied().sum();
        self.subtotal_tax = self.total_tax;
        self
    }

    pub fn with_subtotal(mut self, subtotal: Decimal) -> Self {
        self.subtotal = subtotal;
        self
    }

    /// Effective product: the variation when present, else the parent product
    pub fn product_id(&self) -> Option<ProductId> {
        match &self.kind {
            LineItemKind::Product { product_id, variation_id } => variation_id.or(*product_id),
            _ => None,
        }
    }

    pub fn is_product(&self) -> bool {
        matches!(self.kind, LineItemKind::Product { .. })
    }

    /// Clone-with-overrides for refunds: same variant and name as the
    /// original, negative quantity/total/tax, back-reference to the original.
    pub fn refund_of(
        original: &LineItem,
        quantity: i64,
        refund_total: Decimal,
        refund_taxes: &BTreeMap<String, Decimal>,
    ) -> LineItem {
        let taxes: BTreeMap<String, Decimal> = refund_taxes
            .iter()
            .map(|(rate_id, amount)| (rate_id.clone(), -amount.abs()))
            .collect();
        let total_tax: Decimal = taxes.values().copied().sum();

        LineItem {
            id: ItemId::UNSAVED,
            kind: original.kind.clone(),
            name: original.name.clone(),
            quantity: -quantity.abs(),
            subtotal: -refund_total.abs(),
            subtotal_tax: total_tax,
            total: -refund_total.abs(),
            total_tax,
            taxes,
            meta: BTreeMap::new(),
            refunded_item_id: Some(original.id),
        }
    }
}

// ============================================================================
// Line Item Ledger
// ============================================================================

/// The collection of an order's line items, keyed by item id.
///
/// Unsaved items are kept in insertion order until the store assigns their ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineItemLedger {
    saved: BTreeMap<ItemId, LineItem>,
    #[serde(default)]
    pending: Vec<LineItem>,
}

impl LineItemLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, item: LineItem) {
        if item.id.is_saved() {
            self.saved.insert(item.id, item);
        } else {
            self.pending.push(item);
        }
    }

    pub fn get(&self, id: ItemId) -> Option<&LineItem> {
        self.saved.get(&id)
    }

    pub fn get_mut(&mut self, id: ItemId) -> Option<&mut LineItem> {
        self.saved.get_mut(&id)
    }

    pub fn remove(&mut self, id: ItemId) -> Option<LineItem> {
        self.saved.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LineItem> {
        self.saved.values().chain(self.pending.iter())
    }

    pub fn products(&self) -> impl Iterator<Item = &LineItem> {
        self.iter().filter(|item| item.is_product())
    }

    pub fn of_type<'a>(&'a self, type_name: &'a str) -> impl Iterator<Item = &'a LineItem> + 'a {
        self.iter().filter(move |item| item.kind.type_name() == type_name)
    }

    pub fn len(&self) -> usize {
        self.saved.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_unsaved(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Give every pending item an id from `next_id` and file it under that id
    pub fn assign_ids(&mut self, mut next_id: impl FnMut() -> ItemId) -> Vec<ItemId> {
        let mut assigned = Vec::with_capacity(self.pending.len());
        for mut item in self.pending.drain(..) {
            item.id = next_id();
            assigned.push(item.id);
            self.saved.insert(item.id, item);
        }
        assigned
    }

    pub fn item_ids(&self) -> Vec<ItemId> {
        self.saved.keys().copied().collect()
    }

    pub fn get_meta(&self, id: ItemId, key: &str) -> Option<&str> {
        self.saved.get(&id)?.meta.get(key).map(String::as_str)
    }

    /// Returns false when the item does not exist
    pub fn set_meta(&mut self, id: ItemId, key: impl Into<String>, value: impl Into<String>) -> bool {
        match self.saved.get_mut(&id) {
            Some(item) => {
                item.meta.insert(key.into(), value.into());
                true
            }
            None => false,
        }
    }

    pub fn delete_meta(&mut self, id: ItemId, key: &str) -> bool {
        self.saved
            .get_mut(&id)
            .map(|item| item.meta.remove(key).is_some())
            .unwrap_or(false)
    }

    pub fn sum_total(&self, type_name: &str) -> Decimal {
        self.of_type(type_name).map(|item| item.total).sum()
    }

    pub fn sum_tax(&self) -> Decimal {
        self.iter()
            .filter(|item| !matches!(item.kind, LineItemKind::Tax { .. }))
            .map(|item| item.total_tax)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(units: i64, scale: u32) -> Decimal {
        Decimal::new(units, scale)
    }

    #[test]
    fn test_assign_ids_moves_pending_items() {
        let mut ledger = LineItemLedger::new();
        ledger.add(LineItem::product(ProductId(7), "Mug", 2, dec(2000, 2)));
        ledger.add(LineItem::fee("Gift wrap", dec(500, 2)));
        assert!(ledger.has_unsaved());

        let mut next = 100;
        let ids = ledger.assign_ids(|| {
            next += 1;
            ItemId(next)
        });

        assert_eq!(ids, vec![ItemId(101), ItemId(102)]);
        assert!(!ledger.has_unsaved());
        assert_eq!(ledger.get(ItemId(101)).unwrap().name, "Mug");
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_item_meta_roundtrip() {
        let mut ledger = LineItemLedger::new();
        ledger.add(LineItem { id: ItemId(5), ..LineItem::fee("Fee", dec(100, 2)) });

        assert!(ledger.set_meta(ItemId(5), "_gift", "yes"));
        assert_eq!(ledger.get_meta(ItemId(5), "_gift"), Some("yes"));
        assert!(ledger.delete_meta(ItemId(5), "_gift"));
        assert_eq!(ledger.get_meta(ItemId(5), "_gift"), None);
        assert!(!ledger.set_meta(ItemId(6), "_gift", "yes"));
    }

    #[test]
    fn test_refund_of_keeps_variant_and_negates_amounts() {
        let original = LineItem {
            id: ItemId(11),
            ..LineItem::shipping("flat_rate", "Flat rate", dec(1000, 2)).with_tax("1", dec(200, 2))
        };
        let taxes = BTreeMap::from([("1".to_string(), dec(100, 2))]);

        let refund = LineItem::refund_of(&original, 1, dec(500, 2), &taxes);

        assert_eq!(refund.kind, original.kind);
        assert_eq!(refund.refunded_item_id, Some(ItemId(11)));
        assert_eq!(refund.quantity, -1);
        assert_eq!(refund.total, dec(-500, 2));
        assert_eq!(refund.total_tax, dec(-100, 2));
        assert_eq!(refund.id, ItemId::UNSAVED);
    }

    #[test]
    fn test_sums_by_type() {
        let mut ledger = LineItemLedger::new();
        ledger.add(LineItem::product(ProductId(1), "A", 1, dec(1000, 2)).with_tax("1", dec(100, 2)));
        ledger.add(LineItem::product(ProductId(2), "B", 3, dec(3000, 2)));
        ledger.add(LineItem::shipping("flat_rate", "Ship", dec(500, 2)).with_tax("1", dec(50, 2)));

        assert_eq!(ledger.sum_total("line_item"), dec(4000, 2));
        assert_eq!(ledger.sum_total("shipping"), dec(500, 2));
        assert_eq!(ledger.sum_tax(), dec(150, 2));
    }

    #[test]
    fn test_variation_takes_precedence() {
        let item = LineItem::new(
            LineItemKind::Product { product_id: Some(ProductId(1)), variation_id: Some(ProductId(9)) },
            "Shirt - L",
            1,
            dec(1500, 2),
        );
        assert_eq!(item.product_id(), Some(ProductId(9)));
    }
}
