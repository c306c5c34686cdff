use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::{VersionedCache, ORDERS_NAMESPACE};
use crate::config::LifecycleConfig;
use crate::domain::refund::{RefundEngine, RefundOutcome, RefundRequest};
use crate::effects::{DispatchReport, EffectContext, EffectHandler, EffectRegistry, Extensions, OrderLocks};
use crate::events::EventEnvelope;
use crate::metrics::Metrics;
use crate::search::OrderSearch;
use crate::store::{CatalogStore, OrderFilter, OrderStore, Page};

use super::aggregate::Order;
use super::errors::OrderError;
use super::events::{EventKey, LifecycleEvent, PaymentComplete, StatusChanged};
use super::order_types::{OrderTypeCapability, OrderTypeRegistry};
use super::value_objects::{OrderId, OrderStatus};

// ============================================================================
// Order Service
// ============================================================================
//
// The command/query surface over orders:
//   lock order → load → validate → mutate → save → unlock → dispatch effects
//
// The per-order lock is released before effects run; the registry takes it
// again for each handler.
//
// ============================================================================

pub const TRANSACTION_ID_META: &str = "_transaction_id";

/// Result of a status write
#[derive(Debug)]
pub struct StatusUpdate {
    pub order: Order,
    pub from: OrderStatus,
    pub to: OrderStatus,
    /// None when the status was already the requested one
    pub effects: Option<DispatchReport>,
}

impl StatusUpdate {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// Payment recorded, order moved to this status
    Paid(OrderStatus),
    /// Order was not in a payable status; nothing changed
    AlreadyPaid(OrderStatus),
}

pub struct OrderServiceBuilder {
    orders: Arc<dyn OrderStore>,
    catalog: Arc<dyn CatalogStore>,
    config: LifecycleConfig,
    cache: Option<VersionedCache>,
    extensions: Extensions,
    metrics: Option<Arc<Metrics>>,
    order_types: OrderTypeRegistry,
    handlers: Vec<(EventKey, Arc<dyn EffectHandler>)>,
}

impl OrderServiceBuilder {
    pub fn config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache(mut self, cache: VersionedCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn order_types(mut self, order_types: OrderTypeRegistry) -> Self {
        self.order_types = order_types;
        self
    }

    /// Register an effect on top of the stock handlers
    pub fn effect(mut self, key: EventKey, handler: Arc<dyn EffectHandler>) -> Self {
        self.handlers.push((key, handler));
        self
    }

    pub fn build(self) -> OrderService {
        let config = Arc::new(self.config);
        let order_types = Arc::new(self.order_types);
        let cache = self.cache.unwrap_or_else(VersionedCache::in_memory);

        let mut refunds = RefundEngine::new(
            self.orders.clone(),
            self.catalog.clone(),
            cache.clone(),
            order_types.clone(),
            config.clone(),
            self.extensions.clone(),
        );
        if let Some(metrics) = &self.metrics {
            refunds = refunds.with_metrics(metrics.clone());
        }

        let context = EffectContext {
            orders: self.orders.clone(),
            catalog: self.catalog.clone(),
            refunds: refunds.clone(),
            cache: cache.clone(),
            config: config.clone(),
            extensions: self.extensions.clone(),
            metrics: self.metrics.clone(),
        };

        let locks = OrderLocks::new();
        let mut registry = EffectRegistry::with_default_handlers(context, locks.clone());
        for (key, handler) in self.handlers {
            registry.register(key, handler);
        }

        let search = OrderSearch::new(self.orders.clone(), order_types.clone(), config.search.clone());

        OrderService {
            orders: self.orders,
            catalog: self.catalog,
            cache,
            config,
            extensions: self.extensions,
            metrics: self.metrics,
            order_types,
            locks,
            registry: Arc::new(registry),
            refunds,
            search,
        }
    }
}

#[derive(Clone)]
pub struct OrderService {
    orders: Arc<dyn OrderStore>,
    catalog: Arc<dyn CatalogStore>,
    cache: VersionedCache,
    config: Arc<LifecycleConfig>,
    extensions: Extensions,
    metrics: Option<Arc<Metrics>>,
    order_types: Arc<OrderTypeRegistry>,
    locks: OrderLocks,
    registry: Arc<EffectRegistry>,
    refunds: RefundEngine,
    search: OrderSearch,
}

impl OrderService {
    pub fn builder(orders: Arc<dyn OrderStore>, catalog: Arc<dyn CatalogStore>) -> OrderServiceBuilder {
        OrderServiceBuilder {
            orders,
            catalog,
            config: LifecycleConfig::default(),
            cache: None,
            extensions: Extensions::default(),
            metrics: None,
            order_types: OrderTypeRegistry::with_defaults(),
            handlers: Vec::new(),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn order_types(&self) -> &OrderTypeRegistry {
        &self.order_types
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn orders(&self) -> &Arc<dyn OrderStore> {
        &self.orders
    }

    pub fn registry(&self) -> &EffectRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn get_order(&self, id: OrderId) -> Result<Order, OrderError> {
        self.orders.load(id).await.map_err(|e| OrderError::from_store(id, e))
    }

    /// Orders matching the filter; without explicit types, the types shown in order views
    pub async fn get_orders(&self, mut filter: OrderFilter) -> Result<Page<Order>, OrderError> {
        if filter.order_types.is_empty() {
            filter.order_types = self.order_types.with_capability(OrderTypeCapability::Views);
        }
        Ok(self.orders.find(&filter).await?)
    }

    pub async fn order_search(&self, term: &str) -> Result<BTreeSet<OrderId>, OrderError> {
        self.search.search(term).await
    }

    /// Orders with this status across counted order types (cached)
    pub async fn count_orders(&self, status: OrderStatus) -> Result<usize, OrderError> {
        let key = format!("count:{}", status);
        match self.cache.get(&key, ORDERS_NAMESPACE).await {
            Ok(Some(raw)) => {
                if let Ok(count) = raw.parse() {
                    return Ok(count);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(status = %status, error = %e, "Cache read failed"),
        }

        let mut filter = OrderFilter::default().with_status(status).with_limit(1);
        filter.order_types = self.order_types.with_capability(OrderTypeCapability::Counts);
        let count = self.orders.find(&filter).await?.total;

        if let Err(e) = self.cache.set(&key, &count.to_string(), ORDERS_NAMESPACE).await {
            tracing::warn!(status = %status, error = %e, "Cache write failed");
        }
        Ok(count)
    }

    pub async fn total_refunded(&self, id: OrderId) -> Result<Decimal, OrderError> {
        self.refunds.total_refunded(id).await
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    pub async fn create_order(&self, mut order: Order) -> Result<Order, OrderError> {
        if !self.order_types.is_registered(&order.order_type) {
            return Err(OrderError::UnknownOrderType(order.order_type));
        }

        self.orders.save(&mut order).await?;
        self.invalidate_cache().await;

        tracing::info!(order_id = %order.id, order_type = %order.order_type, status = %order.status, "Order created");
        Ok(order)
    }

    /// Set the status, append the audit note and run the effects of the new status.
    /// Writing the current status again only appends `note`.
    pub async fn update_status(&self, id: OrderId, new_status: &str, note: &str) -> Result<StatusUpdate, OrderError> {
        let to: OrderStatus = new_status.parse()?;
        self.update_status_when(id, to, note, |_| true)
            .await?
            .ok_or(OrderError::InvalidOrder(id))
    }

    /// Like `update_status`, but only when `guard` accepts the freshly loaded order.
    /// Returns None when it does not.
    pub async fn update_status_when(
        &self,
        id: OrderId,
        to: OrderStatus,
        note: &str,
        guard: impl Fn(&Order) -> bool + Send,
    ) -> Result<Option<StatusUpdate>, OrderError> {
        let now = Utc::now();
        let (order, from) = {
            let _guard = self.locks.lock(id).await;

            let mut order = self.get_order(id).await?;
            if !guard(&order) {
                return Ok(None);
            }

            let from = order.status;
            if from == to {
                if !note.trim().is_empty() {
                    order.add_note(note, now);
                    order.modified_at = now;
                    self.orders.save(&mut order).await?;
                }
                return Ok(Some(StatusUpdate { order, from, to, effects: None }));
            }

            self.config.transition_policy.check(from, to)?;
            self.apply_status(&mut order, to, note, now);
            self.orders.save(&mut order).await?;
            (order, from)
        };

        let effects = self.after_transition(&order, from, to, Uuid::new_v4()).await;
        Ok(Some(StatusUpdate { order, from, to, effects: Some(effects) }))
    }

    /// Record a gateway-confirmed payment
    pub async fn payment_complete(&self, id: OrderId, transaction_id: Option<&str>) -> Result<PaymentOutcome, OrderError> {
        let now = Utc::now();
        let (order, from, to) = {
            let _guard = self.locks.lock(id).await;

            let mut order = self.get_order(id).await?;
            let from = order.status;
            if !from.is_payable() {
                tracing::debug!(order_id = %id, status = %from, "Payment for an order that is not payable");
                return Ok(PaymentOutcome::AlreadyPaid(from));
            }

            let to = if self.needs_processing(&order).await? {
                OrderStatus::Processing
            } else {
                OrderStatus::Completed
            };
            self.config.transition_policy.check(from, to)?;

            if let Some(tx) = transaction_id.filter(|tx| !tx.is_empty()) {
                order.set_meta(TRANSACTION_ID_META, tx);
            }
            self.apply_status(&mut order, to, "", now);
            self.orders.save(&mut order).await?;
            (order, from, to)
        };

        let correlation_id = Uuid::new_v4();
        self.after_transition(&order, from, to, correlation_id).await;

        tracing::info!(order_id = %id, transaction_id = ?transaction_id, "Payment complete");
        self.extensions.notify(|o| o.payment_complete(&order, transaction_id));
        let envelope = EventEnvelope::new(
            id,
            LifecycleEvent::PaymentComplete(PaymentComplete { transaction_id: transaction_id.map(str::to_string) }),
            correlation_id,
        );
        self.registry.dispatch(&envelope).await;

        Ok(PaymentOutcome::Paid(to))
    }

    /// Create a refund; an order refunded in full moves to `refunded`
    pub async fn create_refund(&self, request: RefundRequest) -> Result<RefundOutcome, OrderError> {
        let order_id = request.order_id;
        let outcome = {
            let _guard = self.locks.lock(order_id).await;

            // A refund of the whole remainder must be able to move the order to refunded
            let order = self.get_order(order_id).await?;
            if order.status != OrderStatus::Refunded
                && request.amount.max(Decimal::ZERO) == self.refunds.remaining(&order).await?
            {
                self.config.transition_policy.check(order.status, OrderStatus::Refunded)?;
            }

            self.refunds.create_refund(request).await?
        };

        if outcome.fully_refunded {
            let parent = self.get_order(order_id).await?;
            if parent.status != OrderStatus::Refunded {
                self.update_status(order_id, OrderStatus::Refunded.slug(), "").await?;
            }
        }
        Ok(outcome)
    }

    /// Run the effects of an event again, e.g. one lost in a crash before dispatch
    pub async fn replay_event(&self, envelope: &EventEnvelope<LifecycleEvent>) -> DispatchReport {
        self.registry.dispatch(envelope).await
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn apply_status(&self, order: &mut Order, to: OrderStatus, note: &str, now: DateTime<Utc>) {
        let from = order.status;
        order.status = to;
        order.modified_at = now;

        if to == OrderStatus::Completed {
            order.completed_at = Some(now);
        }
        if to.is_paid() && order.paid_at.is_none() {
            order.paid_at = Some(now);
        }

        let transition = format!("Order status changed from {} to {}.", from.label(), to.label());
        order.add_note(format!("{} {}", transition, note.trim()).trim_end(), now);
    }

    /// False when every product line is a virtual download
    async fn needs_processing(&self, order: &Order) -> Result<bool, OrderError> {
        for item in order.items.products() {
            let Some(product_id) = item.product_id() else { return Ok(true) };
            match self.catalog.product(product_id).await? {
                Some(product) if product.is_virtual_download() => continue,
                _ => return Ok(true),
            }
        }
        Ok(false)
    }

    async fn after_transition(&self, order: &Order, from: OrderStatus, to: OrderStatus, correlation_id: Uuid) -> DispatchReport {
        tracing::info!(order_id = %order.id, from = %from, to = %to, "Order status changed");

        self.invalidate_cache().await;
        if let Some(metrics) = &self.metrics {
            metrics.record_transition(to.slug());
        }
        self.extensions.notify(|o| o.status_changed(order, from, to));

        let envelope = EventEnvelope::new(
            order.id,
            LifecycleEvent::StatusChanged(StatusChanged { from, to }),
            correlation_id,
        );
        self.registry.dispatch(&envelope).await
    }

    async fn invalidate_cache(&self) {
        if let Err(e) = self.cache.bump_prefix(ORDERS_NAMESPACE).await {
            tracing::warn!(error = %e, "Cache invalidation failed");
        }
    }
}
