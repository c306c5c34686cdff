use std::sync::Arc;

use crate::domain::catalog::Product;
use crate::domain::order::{LineItem, Order, OrderStatus, CREATED_VIA_CHECKOUT};
use super::EffectMarker;

// ============================================================================
// Extension Points
// ============================================================================
//
// Strategy objects replacing open-ended hooks. Each trait has a default
// implementation carrying the stock behavior; `Extensions` bundles the set
// the engine uses.
//
// ============================================================================

/// Decides whether and by how much payment reduces stock
pub trait StockPolicy: Send + Sync {
    fn reduction_due(&self, order: &Order) -> bool {
        !order.has_flag(EffectMarker::OrderStockReduced.key())
    }

    fn quantity_to_reduce(&self, _order: &Order, item: &LineItem) -> i64 {
        item.quantity
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStockPolicy;

impl StockPolicy for DefaultStockPolicy {}

/// Confirms that a stale pending order may be cancelled by the reaper
pub trait UnpaidOrderPolicy: Send + Sync {
    fn should_cancel(&self, order: &Order) -> bool;
}

/// Only orders placed through checkout are cancelled
#[derive(Debug, Default, Clone, Copy)]
pub struct CheckoutOrdersOnly;

impl UnpaidOrderPolicy for CheckoutOrdersOnly {
    fn should_cancel(&self, order: &Order) -> bool {
        order.created_via.as_deref() == Some(CREATED_VIA_CHECKOUT)
    }
}

/// Notified after lifecycle facts are persisted. Every method defaults to a no-op.
pub trait LifecycleObserver: Send + Sync {
    fn status_changed(&self, _order: &Order, _from: OrderStatus, _to: OrderStatus) {}

    fn payment_complete(&self, _order: &Order, _transaction_id: Option<&str>) {}

    /// Stock fell below zero; `shortfall` is the positive deficit
    fn backorder(&self, _order: &Order, _product: &Product, _shortfall: i64) {}

    fn refund_created(&self, _order: &Order, _refund: &Order) {}
}

#[derive(Clone)]
pub struct Extensions {
    pub stock: Arc<dyn StockPolicy>,
    pub unpaid_orders: Arc<dyn UnpaidOrderPolicy>,
    observers: Vec<Arc<dyn LifecycleObserver>>,
}

impl Default for Extensions {
    fn default() -> Self {
        Self {
            stock: Arc::new(DefaultStockPolicy),
            unpaid_orders: Arc::new(CheckoutOrdersOnly),
            observers: Vec::new(),
        }
    }
}

impl Extensions {
    pub fn with_stock_policy(mut self, policy: Arc<dyn StockPolicy>) -> Self {
        self.stock = policy;
        self
    }

    pub fn with_unpaid_order_policy(mut self, policy: Arc<dyn UnpaidOrderPolicy>) -> Self {
        self.unpaid_orders = policy;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn notify(&self, f: impl Fn(&dyn LifecycleObserver)) {
        for observer in &self.observers {
            f(observer.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::domain::order::{ProductId, SHOP_ORDER};

    #[test]
    fn test_default_stock_policy_follows_marker() {
        let mut order = Order::checkout(Utc::now());
        assert!(DefaultStockPolicy.reduction_due(&order));

        order.set_meta(EffectMarker::OrderStockReduced.key(), "yes");
        assert!(!DefaultStockPolicy.reduction_due(&order));

        let item = LineItem::product(ProductId(1), "Mug", 3, Decimal::TEN);
        assert_eq!(DefaultStockPolicy.quantity_to_reduce(&order, &item), 3);
    }

    #[test]
    fn test_checkout_orders_only() {
        let checkout = Order::checkout(Utc::now());
        let manual = Order::new(SHOP_ORDER, Utc::now());

        assert!(CheckoutOrdersOnly.should_cancel(&checkout));
        assert!(!CheckoutOrdersOnly.should_cancel(&manual));
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl LifecycleObserver for Counting {
        fn status_changed(&self, _order: &Order, _from: OrderStatus, _to: OrderStatus) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_observers_are_notified() {
        let counter = Arc::new(Counting::default());
        let extensions = Extensions::default().with_observer(counter.clone());
        let order = Order::checkout(Utc::now());

        extensions.notify(|o| o.status_changed(&order, OrderStatus::Pending, OrderStatus::Processing));
        extensions.notify(|o| o.payment_complete(&order, None));

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
