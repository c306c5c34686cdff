use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::{VersionedCache, ORDERS_NAMESPACE};
use crate::config::LifecycleConfig;
use crate::domain::order::{
    ItemId, LineItem, Order, OrderError, OrderId, OrderKind, OrderStatus, OrderTypeRegistry, ProductId, RefundDetails,
};
use crate::effects::Extensions;
use crate::metrics::Metrics;
use crate::store::{CatalogStore, OrderFilter, OrderStore};

// ============================================================================
// Refund Settlement Engine
// ============================================================================
//
// A refund is an order record of the refund type whose parent is the
// refunded order. Its line items mirror the refunded items with negative
// quantities and amounts, and its total is always the negated amount.
//
// Invariant: the sum of refund amounts never exceeds the parent total.
//
// The engine does not lock. Callers serialize refunds of one order with the
// per-order lock (OrderService and the effect registry both hold it).
//
// ============================================================================

pub const FULL_REFUND_REASON: &str = "Order fully refunded";

/// One refunded line of the parent order
#[derive(Debug, Clone, PartialEq)]
pub struct RefundLineRequest {
    pub item_id: ItemId,
    pub quantity: i64,
    pub refund_total: Decimal,
    /// Tax amount per tax-rate id
    pub refund_tax: BTreeMap<String, Decimal>,
}

impl RefundLineRequest {
    pub fn new(item_id: ItemId, quantity: i64, refund_total: Decimal) -> Self {
        Self { item_id, quantity, refund_total, refund_tax: BTreeMap::new() }
    }

    pub fn with_tax(mut self, rate_id: impl Into<String>, amount: Decimal) -> Self {
        self.refund_tax.insert(rate_id.into(), amount);
        self
    }

    fn is_empty(&self) -> bool {
        self.quantity == 0 && self.refund_total.is_zero() && self.refund_tax.values().all(Decimal::is_zero)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundRequest {
    pub order_id: OrderId,
    pub amount: Decimal,
    pub reason: String,
    pub refunded_by: Option<i64>,
    pub line_items: Vec<RefundLineRequest>,
    pub restock_items: bool,
}

impl RefundRequest {
    pub fn new(order_id: OrderId, amount: Decimal) -> Self {
        Self {
            order_id,
            amount,
            reason: String::new(),
            refunded_by: None,
            line_items: Vec::new(),
            restock_items: false,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn refunded_by(mut self, user_id: i64) -> Self {
        self.refunded_by = Some(user_id);
        self
    }

    pub fn with_line(mut self, line: RefundLineRequest) -> Self {
        self.line_items.push(line);
        self
    }

    pub fn restock(mut self) -> Self {
        self.restock_items = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub refund: Order,
    pub total_refunded: Decimal,
    pub remaining: Decimal,
    pub fully_refunded: bool,
}

#[derive(Clone)]
pub struct RefundEngine {
    orders: Arc<dyn OrderStore>,
    catalog: Arc<dyn CatalogStore>,
    cache: VersionedCache,
    order_types: Arc<OrderTypeRegistry>,
    config: Arc<LifecycleConfig>,
    extensions: Extensions,
    metrics: Option<Arc<Metrics>>,
}

impl RefundEngine {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        catalog: Arc<dyn CatalogStore>,
        cache: VersionedCache,
        order_types: Arc<OrderTypeRegistry>,
        config: Arc<LifecycleConfig>,
        extensions: Extensions,
    ) -> Self {
        Self {
            orders,
            catalog,
            cache,
            order_types,
            config,
            extensions,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn total_refunded_key(order_id: OrderId) -> String {
        format!("total_refunded:{}", order_id)
    }

    /// Refund records of an order
    pub async fn refunds_of(&self, order_id: OrderId) -> Result<Vec<Order>, OrderError> {
        let mut filter = OrderFilter::default().with_parent(order_id);
        filter.order_types = self.order_types.of_kind(OrderKind::Refund);
        Ok(self.orders.find(&filter).await?.items)
    }

    async fn sum_refunds(&self, order_id: OrderId) -> Result<Decimal, OrderError> {
        let refunds = self.refunds_of(order_id).await?;
        Ok(refunds
            .iter()
            .filter_map(|refund| refund.refund.as_ref())
            .map(|details| details.amount)
            .sum())
    }

    /// Sum of all refund amounts of an order, served from cache when possible
    pub async fn total_refunded(&self, order_id: OrderId) -> Result<Decimal, OrderError> {
        let key = Self::total_refunded_key(order_id);
        match self.cache.get(&key, ORDERS_NAMESPACE).await {
            Ok(Some(raw)) => {
                if let Ok(total) = raw.parse::<Decimal>() {
                    return Ok(total);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(order_id = %order_id, error = %e, "Cache read failed"),
        }

        let total = self.sum_refunds(order_id).await?;
        if let Err(e) = self.cache.set(&key, &total.to_string(), ORDERS_NAMESPACE).await {
            tracing::warn!(order_id = %order_id, error = %e, "Cache write failed");
        }
        Ok(total)
    }

    pub async fn create_refund(&self, request: RefundRequest) -> Result<RefundOutcome, OrderError> {
        let order = self
            .orders
            .load(request.order_id)
            .await
            .map_err(|e| OrderError::from_store(request.order_id, e))?;
        self.refund_order(&order, request).await
    }

    /// Order total not yet refunded
    pub async fn remaining(&self, order: &Order) -> Result<Decimal, OrderError> {
        Ok(order.totals.total - self.sum_refunds(order.id).await?)
    }

    /// Refund whatever is left of the order total, if anything
    pub async fn settle_remaining(&self, order: &Order) -> Result<Option<RefundOutcome>, OrderError> {
        let remaining = self.remaining(order).await?;
        if remaining <= Decimal::ZERO {
            tracing::debug!(order_id = %order.id, "Nothing left to refund");
            return Ok(None);
        }

        let request = RefundRequest::new(order.id, remaining).with_reason(FULL_REFUND_REASON);
        self.refund_order(order, request).await.map(Some)
    }

    async fn refund_order(&self, order: &Order, request: RefundRequest) -> Result<RefundOutcome, OrderError> {
        if order.is_refund() || self.order_types.kind_of(&order.order_type) == Some(OrderKind::Refund) {
            return Err(OrderError::InvalidOrder(order.id));
        }

        let amount = request.amount.max(Decimal::ZERO);
        // Summed from the store, not the cache
        let already_refunded = self.sum_refunds(order.id).await?;
        let available = order.totals.total - already_refunded;
        if amount > available {
            return Err(OrderError::RefundExceedsRemaining { requested: amount, available });
        }

        let now = Utc::now();
        let mut refund = Order::new(self.order_types.refund_type(), now);
        refund.parent_id = Some(order.id);
        refund.status = OrderStatus::Completed;
        refund.customer_id = order.customer_id;
        refund.refund = Some(RefundDetails {
            amount,
            reason: request.reason.clone(),
            refunded_by: request.refunded_by,
        });

        let mut restock = Vec::new();
        for line in request.line_items.iter().filter(|line| !line.is_empty()) {
            let Some(original) = order.items.get(line.item_id) else {
                tracing::warn!(order_id = %order.id, item_id = %line.item_id, "Refund line references unknown item");
                continue;
            };
            if line.refund_total.abs() > original.total.abs() {
                return Err(OrderError::InvalidRefundAmount(line.refund_total));
            }

            refund.add_item(LineItem::refund_of(original, line.quantity, line.refund_total, &line.refund_tax));
            if line.quantity != 0 {
                if let Some(product_id) = original.product_id() {
                    restock.push((line.item_id, product_id, line.quantity.abs()));
                }
            }
        }

        refund.calculate_totals();
        refund.totals.total = -amount;

        self.orders.save(&mut refund).await?;
        tracing::info!(order_id = %order.id, refund_id = %refund.id, amount = %amount, "Refund created");

        if request.restock_items && self.config.manage_stock {
            self.restock(order.id, &restock).await?;
        }

        if let Err(e) = self.cache.bump_prefix(ORDERS_NAMESPACE).await {
            tracing::warn!(order_id = %order.id, error = %e, "Cache invalidation failed");
        }
        if let Some(metrics) = &self.metrics {
            metrics.refunds_created.inc();
        }
        self.extensions.notify(|o| o.refund_created(order, &refund));

        let total_refunded = already_refunded + amount;
        let remaining = order.totals.total - total_refunded;
        Ok(RefundOutcome {
            refund,
            total_refunded,
            remaining,
            fully_refunded: remaining <= Decimal::ZERO,
        })
    }

    /// Put refunded quantities back on the shelf, noting each change on the parent
    async fn restock(&self, order_id: OrderId, lines: &[(ItemId, ProductId, i64)]) -> Result<(), OrderError> {
        let mut notes = Vec::new();
        for (item_id, product_id, qty) in lines {
            match self.catalog.product(*product_id).await? {
                Some(product) if product.manage_stock => {}
                _ => continue,
            }
            let change = self.catalog.adjust_stock(*product_id, *qty).await?;
            notes.push(format!("Item #{} stock increased from {} to {}.", item_id, change.before, change.after));
        }

        if notes.is_empty() {
            return Ok(());
        }

        let mut order = self.orders.load(order_id).await.map_err(|e| OrderError::from_store(order_id, e))?;
        let now = Utc::now();
        for note in notes {
            order.add_note(note, now);
        }
        self.orders.save(&mut order).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::catalog::Product;
    use crate::store::MemoryStore;

    fn dec(units: i64) -> Decimal {
        Decimal::new(units, 0)
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        engine: RefundEngine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let engine = RefundEngine::new(
            store.clone(),
            store.clone(),
            VersionedCache::in_memory(),
            Arc::new(OrderTypeRegistry::with_defaults()),
            Arc::new(LifecycleConfig::default()),
            Extensions::default(),
        );
        Fixture { store, engine }
    }

    async fn order_of(fx: &Fixture, total: i64) -> Order {
        let mut order = Order::checkout(Utc::now());
        order.add_item(LineItem::product(ProductId(1), "Chair", 2, dec(total)).with_tax("1", dec(0)));
        order.calculate_totals();
        fx.store.save(&mut order).await.unwrap();
        order
    }

    #[tokio::test]
    async fn test_partial_then_settle_conserves_total() {
        let fx = fixture();
        let order = order_of(&fx, 100).await;

        let first = fx.engine.create_refund(RefundRequest::new(order.id, dec(30))).await.unwrap();
        assert_eq!(first.refund.totals.total, dec(-30));
        assert_eq!(first.remaining, dec(70));
        assert!(!first.fully_refunded);
        assert_eq!(fx.engine.total_refunded(order.id).await.unwrap(), dec(30));

        let settled = fx.engine.settle_remaining(&order).await.unwrap().unwrap();
        assert_eq!(settled.refund.refund.as_ref().unwrap().reason, FULL_REFUND_REASON);
        assert_eq!(settled.refund.totals.total, dec(-70));
        assert!(settled.fully_refunded);

        // The cached figure was invalidated by the second refund
        assert_eq!(fx.engine.total_refunded(order.id).await.unwrap(), dec(100));
        assert!(fx.engine.settle_remaining(&order).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_over_refund_is_rejected_without_writes() {
        let fx = fixture();
        let order = order_of(&fx, 100).await;

        let result = fx.engine.create_refund(RefundRequest::new(order.id, dec(101))).await;

        assert!(matches!(result, Err(OrderError::RefundExceedsRemaining { available, .. }) if available == dec(100)));
        assert_eq!(fx.store.order_count().await, 1);
    }

    #[tokio::test]
    async fn test_negative_amount_is_clamped() {
        let fx = fixture();
        let order = order_of(&fx, 100).await;

        let outcome = fx.engine.create_refund(RefundRequest::new(order.id, dec(-5))).await.unwrap();
        assert_eq!(outcome.refund.refund.unwrap().amount, Decimal::ZERO);
        assert_eq!(outcome.remaining, dec(100));
    }

    #[tokio::test]
    async fn test_refund_lines_mirror_originals() {
        let fx = fixture();
        let order = order_of(&fx, 100).await;
        let item_id = order.items.item_ids()[0];

        let request = RefundRequest::new(order.id, dec(55))
            .with_reason("Damaged")
            .refunded_by(7)
            .with_line(RefundLineRequest::new(item_id, 1, dec(50)).with_tax("1", dec(5)))
            .with_line(RefundLineRequest::new(ItemId(9999), 1, dec(1)))
            .with_line(RefundLineRequest::new(item_id, 0, Decimal::ZERO));

        let outcome = fx.engine.create_refund(request).await.unwrap();
        let refund = fx.store.load(outcome.refund.id).await.unwrap();

        assert_eq!(refund.parent_id, Some(order.id));
        assert_eq!(refund.items.len(), 1);
        let line = refund.items.iter().next().unwrap();
        assert_eq!(line.refunded_item_id, Some(item_id));
        assert_eq!(line.quantity, -1);
        assert_eq!(line.total, dec(-50));
        assert_eq!(line.total_tax, dec(-5));
        assert_eq!(refund.totals.tax, dec(-5));
        assert_eq!(refund.totals.total, dec(-55));
        assert_eq!(refund.refund.unwrap().refunded_by, Some(7));
    }

    #[tokio::test]
    async fn test_refund_of_refund_is_invalid() {
        let fx = fixture();
        let order = order_of(&fx, 100).await;
        let outcome = fx.engine.create_refund(RefundRequest::new(order.id, dec(10))).await.unwrap();

        let result = fx.engine.create_refund(RefundRequest::new(outcome.refund.id, dec(1))).await;
        assert!(matches!(result, Err(OrderError::InvalidOrder(id)) if id == outcome.refund.id));

        let missing = fx.engine.create_refund(RefundRequest::new(OrderId(424242), dec(1))).await;
        assert!(matches!(missing, Err(OrderError::InvalidOrder(OrderId(424242)))));
    }

    #[tokio::test]
    async fn test_line_larger_than_original_is_invalid() {
        let fx = fixture();
        let order = order_of(&fx, 100).await;
        let item_id = order.items.item_ids()[0];

        let request = RefundRequest::new(order.id, dec(50)).with_line(RefundLineRequest::new(item_id, 1, dec(150)));
        let result = fx.engine.create_refund(request).await;

        assert!(matches!(result, Err(OrderError::InvalidRefundAmount(amount)) if amount == dec(150)));
        assert_eq!(fx.store.order_count().await, 1);
    }

    #[tokio::test]
    async fn test_restock_returns_quantities() {
        let fx = fixture();
        fx.store.save_product(&Product::new(ProductId(1), "Chair").with_stock(4)).await.unwrap();
        let order = order_of(&fx, 100).await;
        let item_id = order.items.item_ids()[0];

        let request = RefundRequest::new(order.id, dec(50))
            .with_line(RefundLineRequest::new(item_id, 1, dec(50)))
            .restock();
        fx.engine.create_refund(request).await.unwrap();

        assert_eq!(fx.store.product(ProductId(1)).await.unwrap().unwrap().stock_quantity, 5);
        let parent = fx.store.load(order.id).await.unwrap();
        assert_eq!(parent.notes.last().unwrap().content, format!("Item #{} stock increased from 4 to 5.", item_id));
    }
}
