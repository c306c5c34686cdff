use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::catalog::{Coupon, DownloadPermission, Product, StockChange};
use crate::domain::order::{CustomerRef, ItemId, Order, OrderId, OrderStatus, ProductId};
use crate::search::like::LikePattern;
use crate::utils::IsTransient;

pub mod memory;
pub mod scylla_store;

pub use memory::MemoryStore;
pub use scylla_store::ScyllaStore;

// ============================================================================
// Storage Abstraction
// ============================================================================
//
// Two traits split what the engine persists:
// - OrderStore   - orders, refunds, their line items and metadata
// - CatalogStore - products, coupons and download permissions
//
// Backends: MemoryStore (tests, demos) and ScyllaStore.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn order_not_found(id: OrderId) -> Self {
        StoreError::NotFound { kind: "order", id: id.to_string() }
    }

    pub fn item_not_found(id: ItemId) -> Self {
        StoreError::NotFound { kind: "line item", id: id.to_string() }
    }

    pub fn product_not_found(id: ProductId) -> Self {
        StoreError::NotFound { kind: "product", id: id.to_string() }
    }
}

impl IsTransient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Conflict(_))
    }
}

// ============================================================================
// Queries
// ============================================================================

/// Order query filter. Empty collections mean "no restriction".
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub statuses: Vec<OrderStatus>,
    pub order_types: Vec<String>,
    pub customer: Option<CustomerRef>,
    pub parent: Option<OrderId>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Strictly earlier than
    pub modified_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    /// 1-based
    pub page: usize,
}

impl OrderFilter {
    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_type(mut self, order_type: impl Into<String>) -> Self {
        self.order_types.push(order_type.into());
        self
    }

    pub fn with_parent(mut self, parent: OrderId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, order: &Order) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&order.status) {
            return false;
        }
        if !self.order_types.is_empty() && !self.order_types.iter().any(|t| *t == order.order_type) {
            return false;
        }
        if let Some(parent) = self.parent {
            if order.parent_id != Some(parent) {
                return false;
            }
        }
        if let Some(customer) = &self.customer {
            let owned = match customer {
                CustomerRef::UserId(id) => order.customer_id == Some(*id),
                CustomerRef::Email(email) => order
                    .billing_email()
                    .map(|billing| billing.eq_ignore_ascii_case(email))
                    .unwrap_or(false),
            };
            if !owned {
                return false;
            }
        }
        if self.created_after.is_some_and(|after| order.created_at < after) {
            return false;
        }
        if self.created_before.is_some_and(|before| order.created_at > before) {
            return false;
        }
        if self.modified_before.is_some_and(|cutoff| order.modified_at >= cutoff) {
            return false;
        }
        true
    }

    /// Sort newest first and cut the requested page
    pub fn paginate(&self, mut orders: Vec<Order>) -> Page<Order> {
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = orders.len();
        let (items, page_count) = match self.limit {
            Some(0) => (Vec::new(), 0),
            Some(limit) => {
                let page = self.page.max(1);
                let items = orders.into_iter().skip((page - 1) * limit).take(limit).collect();
                (items, total.div_ceil(limit))
            }
            None => (orders, usize::from(total > 0)),
        };

        Page { items, total, page_count }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page_count: usize,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page_count: self.page_count,
        }
    }
}

/// Free-text search clause evaluated against stored orders
#[derive(Debug, Clone, PartialEq)]
pub enum SearchClause {
    /// Any of these order meta values matches
    MetaLike { keys: Vec<String> },
    /// `first + " " + last` matches
    FullNameLike { first_key: String, last_key: String },
    /// Any line item name matches
    ItemNameLike,
}

impl SearchClause {
    pub fn matches(&self, order: &Order, pattern: &LikePattern) -> bool {
        match self {
            SearchClause::MetaLike { keys } => keys
                .iter()
                .filter_map(|key| order.get_meta(key))
                .any(|value| pattern.matches(value)),
            SearchClause::FullNameLike { first_key, last_key } => {
                let first = order.get_meta(first_key).unwrap_or_default();
                let last = order.get_meta(last_key).unwrap_or_default();
                pattern.matches(&format!("{} {}", first, last))
            }
            SearchClause::ItemNameLike => order.items.iter().any(|item| pattern.matches(&item.name)),
        }
    }
}

/// Whose metadata a meta operation addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaTarget {
    Order(OrderId),
    LineItem(ItemId),
}

// ============================================================================
// Traits
// ============================================================================

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find(&self, filter: &OrderFilter) -> Result<Page<Order>, StoreError>;

    async fn load(&self, id: OrderId) -> Result<Order, StoreError>;

    /// Persist the order, assigning ids to it and any unsaved line items.
    /// Timestamps are stored as given.
    async fn save(&self, order: &mut Order) -> Result<OrderId, StoreError>;

    async fn exists(&self, id: OrderId) -> Result<bool, StoreError>;

    /// Owning order of a line item
    async fn order_for_item(&self, item: ItemId) -> Result<Option<OrderId>, StoreError>;

    /// Ids of orders of the given types matching a search clause
    async fn ids_matching(
        &self,
        clause: &SearchClause,
        pattern: &LikePattern,
        order_types: &[String],
    ) -> Result<Vec<OrderId>, StoreError>;

    /// Named, expiring, single-holder lease
    async fn try_acquire_lease(&self, name: &str, holder: Uuid, ttl: Duration) -> Result<bool, StoreError>;

    async fn release_lease(&self, name: &str, holder: Uuid) -> Result<(), StoreError>;

    // ------------------------------------------------------------------------
    // Metadata (read-modify-write of the owning order)
    // ------------------------------------------------------------------------

    async fn get_meta(&self, target: MetaTarget, key: &str) -> Result<Option<String>, StoreError> {
        let order = self.load(self.resolve(target).await?).await?;
        Ok(match target {
            MetaTarget::Order(_) => order.get_meta(key).map(str::to_string),
            MetaTarget::LineItem(item) => order.items.get_meta(item, key).map(str::to_string),
        })
    }

    async fn set_meta(&self, target: MetaTarget, key: &str, value: &str) -> Result<(), StoreError> {
        let mut order = self.load(self.resolve(target).await?).await?;
        match target {
            MetaTarget::Order(_) => order.set_meta(key, value),
            MetaTarget::LineItem(item) => {
                if !order.items.set_meta(item, key, value) {
                    return Err(StoreError::item_not_found(item));
                }
            }
        }
        self.save(&mut order).await?;
        Ok(())
    }

    /// Returns whether the key existed
    async fn delete_meta(&self, target: MetaTarget, key: &str) -> Result<bool, StoreError> {
        let mut order = self.load(self.resolve(target).await?).await?;
        let removed = match target {
            MetaTarget::Order(_) => order.delete_meta(key),
            MetaTarget::LineItem(item) => order.items.delete_meta(item, key),
        };
        if removed {
            self.save(&mut order).await?;
        }
        Ok(removed)
    }

    async fn resolve(&self, target: MetaTarget) -> Result<OrderId, StoreError> {
        match target {
            MetaTarget::Order(id) => Ok(id),
            MetaTarget::LineItem(item) => self
                .order_for_item(item)
                .await?
                .ok_or_else(|| StoreError::item_not_found(item)),
        }
    }
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn product(&self, id: ProductId) -> Result<Option<Product>, StoreError>;

    async fn save_product(&self, product: &Product) -> Result<(), StoreError>;

    /// Atomically add `delta` to the stock level
    async fn adjust_stock(&self, id: ProductId, delta: i64) -> Result<StockChange, StoreError>;

    /// Atomically add to the sales counter, returning the new total
    async fn record_sales(&self, id: ProductId, quantity: i64) -> Result<i64, StoreError>;

    async fn coupon(&self, code: &str) -> Result<Option<Coupon>, StoreError>;

    async fn save_coupon(&self, coupon: &Coupon) -> Result<(), StoreError>;

    /// Atomically count one use (or un-use) of a coupon.
    /// Returns the new usage count, or None for unknown codes.
    async fn update_coupon_usage(
        &self,
        code: &str,
        identity: Option<&CustomerRef>,
        increase: bool,
    ) -> Result<Option<i64>, StoreError>;

    /// Returns false when a permission with the same key already exists
    async fn grant_download(&self, permission: DownloadPermission) -> Result<bool, StoreError>;

    async fn download_permissions(&self, order_id: OrderId) -> Result<Vec<DownloadPermission>, StoreError>;
}
