use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::cache::VersionedCache;
use crate::config::LifecycleConfig;
use crate::domain::order::{EventKey, LifecycleEvent, Order, OrderError, OrderId, OrderStatus};
use crate::domain::refund::RefundEngine;
use crate::events::EventEnvelope;
use crate::metrics::Metrics;
use crate::store::{CatalogStore, MetaTarget, OrderStore, StoreError};

pub mod policy;
pub mod downloads;
pub mod sales;
pub mod coupons;
pub mod stock;
pub mod refund;

pub use policy::{
    CheckoutOrdersOnly, DefaultStockPolicy, Extensions, LifecycleObserver, StockPolicy, UnpaidOrderPolicy,
};

// ============================================================================
// Idempotent Effect Registry
// ============================================================================
//
// Handlers are registered per event key. For each handler of a dispatched
// event the registry:
//   1. takes the per-order lock
//   2. reloads the order
//   3. asks the handler for a plan (skip, or run and then set/clear a marker)
//   4. runs it, applies the marker change and saves the order
//
// The lock spans steps 2-4 so two dispatches for one order can never both
// observe an unset marker. A handler failure leaves the marker untouched and
// does not stop the remaining handlers.
//
// Handlers that move several counters persist a progress entry per unit
// (line item or coupon) before touching its counter, and skip units that
// already carry one. A retry after a partial failure resumes instead of
// counting twice.
//
// ============================================================================

pub const MARKER_VALUE: &str = "yes";

/// Order meta flags recording that an effect already ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectMarker {
    DownloadPermissionsGranted,
    RecordedSales,
    RecordedCouponUsageCounts,
    OrderStockReduced,
}

impl EffectMarker {
    pub fn key(&self) -> &'static str {
        match self {
            EffectMarker::DownloadPermissionsGranted => "_download_permissions_granted",
            EffectMarker::RecordedSales => "_recorded_sales",
            EffectMarker::RecordedCouponUsageCounts => "_recorded_coupon_usage_counts",
            EffectMarker::OrderStockReduced => "_order_stock_reduced",
        }
    }

    pub fn is_set(&self, order: &Order) -> bool {
        order.has_flag(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerUpdate {
    Set,
    Clear,
    Keep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The marker says the effect already ran
    AlreadyApplied,
    /// An undo was requested but nothing was recorded
    NotRecorded,
    /// Turned off by configuration
    PolicyDisabled(&'static str),
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::AlreadyApplied => "already_applied",
            SkipReason::NotRecorded => "not_recorded",
            SkipReason::PolicyDisabled(_) => "policy_disabled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectPlan {
    Skip(SkipReason),
    Run { on_success: MarkerUpdate },
}

impl EffectPlan {
    /// Run once per order: skip when `marker` is set, otherwise run and set it
    pub fn once(order: &Order, marker: EffectMarker) -> Self {
        if marker.is_set(order) {
            EffectPlan::Skip(SkipReason::AlreadyApplied)
        } else {
            EffectPlan::Run { on_success: MarkerUpdate::Set }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EffectError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Order(#[from] OrderError),
}

#[derive(Debug)]
pub enum EffectOutcome {
    Applied,
    Skipped(SkipReason),
    Failed(EffectError),
}

impl EffectOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, EffectOutcome::Applied)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, EffectOutcome::Failed(_))
    }
}

/// Per-handler outcomes of one dispatch
#[derive(Debug)]
pub struct DispatchReport {
    pub order_id: OrderId,
    pub event: EventKey,
    pub outcomes: Vec<(&'static str, EffectOutcome)>,
}

impl DispatchReport {
    pub fn outcome(&self, effect: &str) -> Option<&EffectOutcome> {
        self.outcomes.iter().find(|(name, _)| *name == effect).map(|(_, outcome)| outcome)
    }

    pub fn applied(&self) -> Vec<&'static str> {
        self.outcomes.iter().filter(|(_, o)| o.is_applied()).map(|(name, _)| *name).collect()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_failed()).count()
    }
}

/// Everything a handler may touch
#[derive(Clone)]
pub struct EffectContext {
    pub orders: Arc<dyn OrderStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub refunds: RefundEngine,
    pub cache: VersionedCache,
    pub config: Arc<LifecycleConfig>,
    pub extensions: Extensions,
    pub metrics: Option<Arc<Metrics>>,
}

#[async_trait]
pub trait EffectHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn plan(&self, order: &Order, event: &LifecycleEvent, ctx: &EffectContext) -> EffectPlan;

    /// Perform the effect. Changes made to `order` are saved by the registry.
    async fn execute(&self, order: &mut Order, event: &LifecycleEvent, ctx: &EffectContext) -> Result<(), EffectError>;

    fn marker(&self) -> Option<EffectMarker>;
}

// ============================================================================
// Progress Entries
// ============================================================================

fn apply_meta(order: &mut Order, target: MetaTarget, key: &str, value: Option<&str>) {
    match (target, value) {
        (MetaTarget::Order(_), Some(value)) => order.set_meta(key, value),
        (MetaTarget::Order(_), None) => {
            order.delete_meta(key);
        }
        (MetaTarget::LineItem(item), Some(value)) => {
            order.items.set_meta(item, key, value);
        }
        (MetaTarget::LineItem(item), None) => {
            order.items.delete_meta(item, key);
        }
    }
}

/// Persist `key = value` on `target`, mirror it on the working copy, then run
/// `apply`. The entry is withdrawn again when `apply` fails.
pub(crate) async fn claim_then<T, F, Fut>(
    ctx: &EffectContext,
    order: &mut Order,
    target: MetaTarget,
    key: &str,
    value: &str,
    apply: F,
) -> Result<T, EffectError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    ctx.orders.set_meta(target, key, value).await?;
    apply_meta(order, target, key, Some(value));

    match apply().await {
        Ok(result) => Ok(result),
        Err(e) => {
            match ctx.orders.delete_meta(target, key).await {
                Ok(_) => apply_meta(order, target, key, None),
                Err(undo) => {
                    tracing::error!(order_id = %order.id, key = key, error = %undo, "Could not withdraw progress entry");
                }
            }
            Err(e.into())
        }
    }
}

/// Remove `key` from `target`, mirror it on the working copy, then run
/// `apply`. The entry is put back with `value` when `apply` fails.
pub(crate) async fn release_then<T, F, Fut>(
    ctx: &EffectContext,
    order: &mut Order,
    target: MetaTarget,
    key: &str,
    value: &str,
    apply: F,
) -> Result<T, EffectError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    ctx.orders.delete_meta(target, key).await?;
    apply_meta(order, target, key, None);

    match apply().await {
        Ok(result) => Ok(result),
        Err(e) => {
            match ctx.orders.set_meta(target, key, value).await {
                Ok(()) => apply_meta(order, target, key, Some(value)),
                Err(undo) => {
                    tracing::error!(order_id = %order.id, key = key, error = %undo, "Could not restore progress entry");
                }
            }
            Err(e.into())
        }
    }
}

// ============================================================================
// Per-Order Locks
// ============================================================================

type LockMap = HashMap<OrderId, Arc<Mutex<()>>>;

fn entries(locks: &StdMutex<LockMap>) -> MutexGuard<'_, LockMap> {
    locks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One mutex per order with a holder or waiter. Entries go away with the
/// last guard.
#[derive(Clone, Default)]
pub struct OrderLocks {
    locks: Arc<StdMutex<LockMap>>,
}

impl OrderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize read-modify-write sequences on one order
    pub async fn lock(&self, order_id: OrderId) -> OrderGuard {
        let mutex = entries(&self.locks)
            .entry(order_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        OrderGuard {
            order_id,
            locks: self.locks.clone(),
            _held: mutex.lock_owned().await,
        }
    }

    /// Orders currently locked or waited on
    pub fn tracked_orders(&self) -> usize {
        entries(&self.locks).len()
    }
}

pub struct OrderGuard {
    order_id: OrderId,
    locks: Arc<StdMutex<LockMap>>,
    _held: OwnedMutexGuard<()>,
}

impl Drop for OrderGuard {
    fn drop(&mut self) {
        let mut locks = entries(&self.locks);
        // Nobody but the map and this guard left
        if locks.get(&self.order_id).is_some_and(|mutex| Arc::strong_count(mutex) <= 2) {
            locks.remove(&self.order_id);
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

pub struct EffectRegistry {
    handlers: BTreeMap<EventKey, Vec<Arc<dyn EffectHandler>>>,
    locks: OrderLocks,
    context: EffectContext,
}

impl EffectRegistry {
    pub fn new(context: EffectContext, locks: OrderLocks) -> Self {
        Self {
            handlers: BTreeMap::new(),
            locks,
            context,
        }
    }

    /// Registry wired with the stock handlers
    pub fn with_default_handlers(context: EffectContext, locks: OrderLocks) -> Self {
        use OrderStatus::*;

        let mut registry = Self::new(context, locks);

        let downloads: Arc<dyn EffectHandler> = Arc::new(downloads::GrantDownloads);
        let sales: Arc<dyn EffectHandler> = Arc::new(sales::RecordSales);
        let coupons: Arc<dyn EffectHandler> = Arc::new(coupons::CouponUsage);

        for status in [Completed, Processing] {
            registry.register(EventKey::Status(status), downloads.clone());
        }
        for status in [Completed, Processing, OnHold] {
            registry.register(EventKey::Status(status), sales.clone());
        }
        for status in [Completed, Processing, OnHold, Cancelled] {
            registry.register(EventKey::Status(status), coupons.clone());
        }
        registry.register(EventKey::Status(Cancelled), Arc::new(stock::RestoreStock));
        registry.register(EventKey::PaymentComplete, Arc::new(stock::ReduceStock));
        registry.register(EventKey::Status(Refunded), Arc::new(refund::SettleRefund));

        registry
    }

    pub fn register(&mut self, key: EventKey, handler: Arc<dyn EffectHandler>) {
        self.handlers.entry(key).or_default().push(handler);
    }

    pub fn handler_names(&self, key: EventKey) -> Vec<&'static str> {
        self.handlers
            .get(&key)
            .map(|handlers| handlers.iter().map(|h| h.name()).collect())
            .unwrap_or_default()
    }

    pub fn context(&self) -> &EffectContext {
        &self.context
    }

    pub fn locks(&self) -> &OrderLocks {
        &self.locks
    }

    pub async fn dispatch(&self, envelope: &EventEnvelope<LifecycleEvent>) -> DispatchReport {
        let key = envelope.event_data.key();
        let started = Instant::now();
        let mut report = DispatchReport {
            order_id: envelope.order_id,
            event: key,
            outcomes: Vec::new(),
        };

        let Some(handlers) = self.handlers.get(&key) else {
            tracing::debug!(order_id = %envelope.order_id, event = %key, "No effect handlers registered");
            return report;
        };

        for handler in handlers {
            let outcome = self.run_handler(handler.as_ref(), envelope).await;
            self.record(handler.name(), envelope.order_id, &outcome);
            report.outcomes.push((handler.name(), outcome));
        }

        if let Some(metrics) = &self.context.metrics {
            metrics.record_dispatch(&key.to_string(), started.elapsed().as_secs_f64());
        }

        report
    }

    async fn run_handler(&self, handler: &dyn EffectHandler, envelope: &EventEnvelope<LifecycleEvent>) -> EffectOutcome {
        let _guard = self.locks.lock(envelope.order_id).await;

        let mut order = match self.context.orders.load(envelope.order_id).await {
            Ok(order) => order,
            Err(e) => return EffectOutcome::Failed(OrderError::from_store(envelope.order_id, e).into()),
        };

        let on_success = match handler.plan(&order, &envelope.event_data, &self.context) {
            EffectPlan::Skip(reason) => return EffectOutcome::Skipped(reason),
            EffectPlan::Run { on_success } => on_success,
        };

        let before = order.clone();
        if let Err(e) = handler.execute(&mut order, &envelope.event_data, &self.context).await {
            return EffectOutcome::Failed(e);
        }

        if let Some(marker) = handler.marker() {
            match on_success {
                MarkerUpdate::Set => order.set_meta(marker.key(), MARKER_VALUE),
                MarkerUpdate::Clear => {
                    order.delete_meta(marker.key());
                }
                MarkerUpdate::Keep => {}
            }
        }

        if order != before {
            if let Err(e) = self.context.orders.save(&mut order).await {
                return EffectOutcome::Failed(e.into());
            }
        }

        EffectOutcome::Applied
    }

    fn record(&self, effect: &'static str, order_id: OrderId, outcome: &EffectOutcome) {
        match outcome {
            EffectOutcome::Applied => {
                tracing::info!(order_id = %order_id, effect = effect, "Effect applied");
            }
            EffectOutcome::Skipped(reason) => {
                tracing::debug!(order_id = %order_id, effect = effect, reason = ?reason, "Effect skipped");
            }
            EffectOutcome::Failed(e) => {
                tracing::error!(order_id = %order_id, effect = effect, error = %e, "Effect failed");
            }
        }

        if let Some(metrics) = &self.context.metrics {
            match outcome {
                EffectOutcome::Applied => metrics.record_effect_applied(effect),
                EffectOutcome::Skipped(reason) => metrics.record_effect_skipped(effect, reason.label()),
                EffectOutcome::Failed(_) => metrics.record_effect_failed(effect),
            }
        }
    }
}

// ============================================================================
// Test Support
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::domain::order::OrderTypeRegistry;
    use crate::store::MemoryStore;

    pub struct Fixture {
        pub store: Arc<MemoryStore>,
        pub context: EffectContext,
    }

    pub fn fixture(config: LifecycleConfig) -> Fixture {
        fixture_with(config, Extensions::default())
    }

    pub fn fixture_with(config: LifecycleConfig, extensions: Extensions) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let cache = VersionedCache::in_memory();
        let config = Arc::new(config);
        let refunds = RefundEngine::new(
            store.clone(),
            store.clone(),
            cache.clone(),
            Arc::new(OrderTypeRegistry::with_defaults()),
            config.clone(),
            extensions.clone(),
        );

        let context = EffectContext {
            orders: store.clone(),
            catalog: store.clone(),
            refunds,
            cache,
            config,
            extensions,
            metrics: None,
        };

        Fixture { store, context }
    }

    pub fn status_event(order_id: OrderId, from: OrderStatus, to: OrderStatus) -> EventEnvelope<LifecycleEvent> {
        use crate::domain::order::StatusChanged;
        EventEnvelope::new(
            order_id,
            LifecycleEvent::StatusChanged(StatusChanged { from, to }),
            uuid::Uuid::new_v4(),
        )
    }

    pub fn payment_event(order_id: OrderId) -> EventEnvelope<LifecycleEvent> {
        use crate::domain::order::PaymentComplete;
        EventEnvelope::new(
            order_id,
            LifecycleEvent::PaymentComplete(PaymentComplete { transaction_id: None }),
            uuid::Uuid::new_v4(),
        )
    }
}
