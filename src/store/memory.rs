use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CatalogStore, OrderFilter, OrderStore, Page, SearchClause, StoreError};
use crate::domain::catalog::{Coupon, DownloadPermission, Product, StockChange};
use crate::domain::order::{CustomerRef, ItemId, Order, OrderId, ProductId};
use crate::search::like::LikePattern;

// ============================================================================
// In-Memory Store
// ============================================================================

#[derive(Default)]
struct Inner {
    orders: BTreeMap<OrderId, Order>,
    item_owner: HashMap<ItemId, OrderId>,
    next_order_id: i64,
    next_item_id: i64,

    products: HashMap<ProductId, Product>,
    coupons: HashMap<String, Coupon>,
    permissions: Vec<DownloadPermission>,

    leases: HashMap<String, (Uuid, Instant)>,
    /// Saves still allowed before the order's writes start failing
    failing_saves: HashMap<OrderId, usize>,
    failing_finds: usize,
}

/// Process-local store backed by a single RwLock
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every save of this order fail with `Unavailable`
    pub async fn fail_saves_for(&self, id: OrderId) {
        self.fail_saves_after(id, 0).await;
    }

    /// Let `allowed` more saves of this order through, then fail the rest
    pub async fn fail_saves_after(&self, id: OrderId, allowed: usize) {
        self.inner.write().await.failing_saves.insert(id, allowed);
    }

    pub async fn clear_save_failures(&self, id: OrderId) {
        self.inner.write().await.failing_saves.remove(&id);
    }

    /// Fail the next `count` calls to `find`
    pub async fn fail_next_finds(&self, count: usize) {
        self.inner.write().await.failing_finds = count;
    }

    pub async fn order_count(&self) -> usize {
        self.inner.read().await.orders.len()
    }
}

fn coupon_key(code: &str) -> String {
    code.trim().to_lowercase()
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn find(&self, filter: &OrderFilter) -> Result<Page<Order>, StoreError> {
        {
            let mut inner = self.inner.write().await;
            if inner.failing_finds > 0 {
                inner.failing_finds -= 1;
                return Err(StoreError::Unavailable("order query rejected".to_string()));
            }
        }

        let inner = self.inner.read().await;
        let matching = inner
            .orders
            .values()
            .filter(|order| filter.matches(order))
            .cloned()
            .collect();
        Ok(filter.paginate(matching))
    }

    async fn load(&self, id: OrderId) -> Result<Order, StoreError> {
        self.inner
            .read()
            .await
            .orders
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::order_not_found(id))
    }

    async fn save(&self, order: &mut Order) -> Result<OrderId, StoreError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;

        if let Some(allowed) = inner.failing_saves.get_mut(&order.id) {
            if *allowed == 0 {
                return Err(StoreError::Unavailable(format!("write to order {} rejected", order.id)));
            }
            *allowed -= 1;
        }

        if !order.id.is_saved() {
            inner.next_order_id += 1;
            order.id = OrderId(inner.next_order_id);
        }

        let next_item_id = &mut inner.next_item_id;
        order.items.assign_ids(|| {
            *next_item_id += 1;
            ItemId(*next_item_id)
        });

        for item_id in order.items.item_ids() {
            inner.item_owner.insert(item_id, order.id);
        }
        inner.orders.insert(order.id, order.clone());

        Ok(order.id)
    }

    async fn exists(&self, id: OrderId) -> Result<bool, StoreError> {
        Ok(self.inner.read().await.orders.contains_key(&id))
    }

    async fn order_for_item(&self, item: ItemId) -> Result<Option<OrderId>, StoreError> {
        Ok(self.inner.read().await.item_owner.get(&item).copied())
    }

    async fn ids_matching(
        &self,
        clause: &SearchClause,
        pattern: &LikePattern,
        order_types: &[String],
    ) -> Result<Vec<OrderId>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .orders
            .values()
            .filter(|order| order_types.is_empty() || order_types.contains(&order.order_type))
            .filter(|order| clause.matches(order, pattern))
            .map(|order| order.id)
            .collect())
    }

    async fn try_acquire_lease(&self, name: &str, holder: Uuid, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();

        let available = match inner.leases.get(name) {
            Some((current, expires)) => *current == holder || *expires <= now,
            None => true,
        };
        if available {
            inner.leases.insert(name.to_string(), (holder, now + ttl));
        }
        Ok(available)
    }

    async fn release_lease(&self, name: &str, holder: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.leases.get(name).is_some_and(|(current, _)| *current == holder) {
            inner.leases.remove(name);
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.inner.read().await.products.get(&id).cloned())
    }

    async fn save_product(&self, product: &Product) -> Result<(), StoreError> {
        self.inner.write().await.products.insert(product.id, product.clone());
        Ok(())
    }

    async fn adjust_stock(&self, id: ProductId, delta: i64) -> Result<StockChange, StoreError> {
        let mut inner = self.inner.write().await;
        let product = inner.products.get_mut(&id).ok_or_else(|| StoreError::product_not_found(id))?;

        let before = product.stock_quantity;
        product.stock_quantity += delta;
        Ok(StockChange { product_id: id, before, after: product.stock_quantity })
    }

    async fn record_sales(&self, id: ProductId, quantity: i64) -> Result<i64, StoreError> {
        let mut inner = self.inner.write().await;
        let product = inner.products.get_mut(&id).ok_or_else(|| StoreError::product_not_found(id))?;
        product.total_sales += quantity;
        Ok(product.total_sales)
    }

    async fn coupon(&self, code: &str) -> Result<Option<Coupon>, StoreError> {
        Ok(self.inner.read().await.coupons.get(&coupon_key(code)).cloned())
    }

    async fn save_coupon(&self, coupon: &Coupon) -> Result<(), StoreError> {
        self.inner.write().await.coupons.insert(coupon_key(&coupon.code), coupon.clone());
        Ok(())
    }

    async fn update_coupon_usage(
        &self,
        code: &str,
        identity: Option<&CustomerRef>,
        increase: bool,
    ) -> Result<Option<i64>, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(coupon) = inner.coupons.get_mut(&coupon_key(code)) else {
            return Ok(None);
        };

        if increase {
            coupon.increase_usage(identity);
        } else {
            coupon.decrease_usage(identity);
        }
        Ok(Some(coupon.usage_count))
    }

    async fn grant_download(&self, permission: DownloadPermission) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let key = permission.key();
        if inner.permissions.iter().any(|existing| existing.key() == key) {
            return Ok(false);
        }
        inner.permissions.push(permission);
        Ok(true)
    }

    async fn download_permissions(&self, order_id: OrderId) -> Result<Vec<DownloadPermission>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .permissions
            .iter()
            .filter(|permission| permission.order_id == order_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{LineItem, OrderStatus, SHOP_ORDER};
    use crate::store::MetaTarget;
    use chrono::Utc;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn test_save_assigns_order_and_item_ids() {
        let store = MemoryStore::new();
        let mut order = Order::new(SHOP_ORDER, Utc::now());
        order.add_item(LineItem::product(ProductId(1), "Mug", 1, Decimal::TEN));

        let id = store.save(&mut order).await.unwrap();

        assert!(id.is_saved());
        assert!(!order.items.has_unsaved());
        let item_id = order.items.item_ids()[0];
        assert_eq!(store.order_for_item(item_id).await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_save_keeps_timestamps() {
        let store = MemoryStore::new();
        let stamp = Utc::now() - chrono::Duration::days(3);
        let mut order = Order::new(SHOP_ORDER, stamp);
        let id = store.save(&mut order).await.unwrap();

        let loaded = store.load(id).await.unwrap();
        assert_eq!(loaded.modified_at, stamp);
    }

    #[tokio::test]
    async fn test_meta_on_orders_and_items() {
        let store = MemoryStore::new();
        let mut order = Order::new(SHOP_ORDER, Utc::now());
        order.add_item(LineItem::fee("Fee", Decimal::ONE));
        let id = store.save(&mut order).await.unwrap();
        let item_id = order.items.item_ids()[0];

        store.set_meta(MetaTarget::Order(id), "_flag", "yes").await.unwrap();
        store.set_meta(MetaTarget::LineItem(item_id), "_reduced_stock", "2").await.unwrap();

        assert_eq!(store.get_meta(MetaTarget::Order(id), "_flag").await.unwrap().as_deref(), Some("yes"));
        assert_eq!(
            store.get_meta(MetaTarget::LineItem(item_id), "_reduced_stock").await.unwrap().as_deref(),
            Some("2")
        );
        assert!(store.delete_meta(MetaTarget::Order(id), "_flag").await.unwrap());
        assert!(!store.delete_meta(MetaTarget::Order(id), "_flag").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_order_is_not_found() {
        let store = MemoryStore::new();
        let err = store.load(OrderId(404)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_injected_save_failure() {
        let store = MemoryStore::new();
        let mut order = Order::new(SHOP_ORDER, Utc::now());
        let id = store.save(&mut order).await.unwrap();

        store.fail_saves_for(id).await;
        order.status = OrderStatus::Cancelled;
        assert!(matches!(store.save(&mut order).await, Err(StoreError::Unavailable(_))));
        assert_eq!(store.load(id).await.unwrap().status, OrderStatus::Pending);

        store.clear_save_failures(id).await;
        assert!(store.save(&mut order).await.is_ok());
    }

    #[tokio::test]
    async fn test_save_failure_after_allowed_writes() {
        let store = MemoryStore::new();
        let mut order = Order::new(SHOP_ORDER, Utc::now());
        let id = store.save(&mut order).await.unwrap();

        store.fail_saves_after(id, 1).await;
        assert!(store.save(&mut order).await.is_ok());
        assert!(store.save(&mut order).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_find_failure() {
        let store = MemoryStore::new();
        store.fail_next_finds(1).await;

        assert!(store.find(&OrderFilter::default()).await.is_err());
        assert!(store.find(&OrderFilter::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(store.try_acquire_lease("reaper", a, Duration::from_secs(60)).await.unwrap());
        assert!(!store.try_acquire_lease("reaper", b, Duration::from_secs(60)).await.unwrap());

        store.release_lease("reaper", a).await.unwrap();
        assert!(store.try_acquire_lease("reaper", b, Duration::from_millis(10)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.try_acquire_lease("reaper", a, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_stock_and_coupon_updates() {
        let store = MemoryStore::new();
        store.save_product(&Product::new(ProductId(3), "Lamp").with_stock(5)).await.unwrap();
        store.save_coupon(&Coupon::new("SPRING")).await.unwrap();

        let change = store.adjust_stock(ProductId(3), -2).await.unwrap();
        assert_eq!((change.before, change.after), (5, 3));

        assert_eq!(store.update_coupon_usage("spring", None, true).await.unwrap(), Some(1));
        assert_eq!(store.update_coupon_usage("unknown", None, true).await.unwrap(), None);
    }
}
