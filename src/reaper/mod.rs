use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::order::{Order, OrderError, OrderId, OrderService, OrderStatus};
use crate::metrics::Metrics;
use crate::store::OrderFilter;
use crate::utils::{retry_on_transient, RetryConfig, RetryResult};

// ============================================================================
// Unpaid Order Reaper
// ============================================================================
//
// Cancels checkout orders that sat in `pending` longer than the stock hold,
// then schedules its own next run one hold period later.
//
// Only one node sweeps at a time: a run first takes the store lease named
// `unpaid_order_reaper` and gives up with `LeaseHeld` if another node has it.
// Lease misses and failed passes still re-arm, so every node keeps trying.
//
// ============================================================================

pub const REAPER_LEASE: &str = "unpaid_order_reaper";
pub const CANCEL_NOTE: &str = "Unpaid order cancelled - time limit reached.";

const LEASE_TTL: std::time::Duration = std::time::Duration::from_secs(300);

/// One-shot timer the reaper uses to re-arm itself
pub trait Scheduler: Send + Sync {
    fn schedule_once(&self, at: DateTime<Utc>);

    fn clear_scheduled(&self);
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReaperReport {
    pub cutoff: DateTime<Utc>,
    pub cancelled: Vec<OrderId>,
    /// Stale orders the unpaid-order policy kept
    pub skipped: Vec<OrderId>,
    pub failed: Vec<(OrderId, String)>,
    pub next_run: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReaperOutcome {
    /// Hold time is zero or stock management is off; nothing scheduled
    Disabled,
    /// Another node holds the lease
    LeaseHeld,
    Completed(ReaperReport),
}

impl ReaperOutcome {
    fn label(&self) -> &'static str {
        match self {
            ReaperOutcome::Disabled => "disabled",
            ReaperOutcome::LeaseHeld => "lease_held",
            ReaperOutcome::Completed(_) => "completed",
        }
    }
}

struct Sweep {
    cancelled: Vec<OrderId>,
    skipped: Vec<OrderId>,
    failed: Vec<(OrderId, String)>,
}

pub struct UnpaidOrderReaper {
    service: OrderService,
    scheduler: Arc<dyn Scheduler>,
    holder: Uuid,
    retry: RetryConfig,
    metrics: Option<Arc<Metrics>>,
}

impl UnpaidOrderReaper {
    pub fn new(service: OrderService, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            service,
            scheduler,
            holder: Uuid::new_v4(),
            retry: RetryConfig::default(),
            metrics: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<ReaperOutcome, OrderError> {
        let config = self.service.config();
        if config.hold_stock_minutes == 0 || !config.manage_stock {
            tracing::debug!("Unpaid order reaper disabled");
            return Ok(self.finish(ReaperOutcome::Disabled));
        }
        let hold = Duration::minutes(config.hold_stock_minutes as i64);

        let cutoff = now - hold;
        let next_run = now + hold;

        // Any outcome past this point keeps a run pending on this node
        let swept = self.sweep_under_lease(cutoff).await;
        self.scheduler.schedule_once(next_run);

        let Sweep { cancelled, skipped, failed } = match swept {
            Ok(Some(sweep)) => sweep,
            Ok(None) => {
                tracing::info!(lease = REAPER_LEASE, next_run = %next_run, "Reaper lease held elsewhere, skipping run");
                return Ok(self.finish(ReaperOutcome::LeaseHeld));
            }
            Err(e) => {
                tracing::error!(error = %e, next_run = %next_run, "Unpaid order sweep failed");
                return Err(e);
            }
        };

        tracing::info!(
            cutoff = %cutoff,
            cancelled = cancelled.len(),
            skipped = skipped.len(),
            failed = failed.len(),
            next_run = %next_run,
            "Unpaid order sweep finished"
        );

        Ok(self.finish(ReaperOutcome::Completed(ReaperReport {
            cutoff,
            cancelled,
            skipped,
            failed,
            next_run,
        })))
    }

    /// None when another node holds the lease
    async fn sweep_under_lease(&self, cutoff: DateTime<Utc>) -> Result<Option<Sweep>, OrderError> {
        let orders = self.service.orders();
        if !orders.try_acquire_lease(REAPER_LEASE, self.holder, LEASE_TTL).await? {
            return Ok(None);
        }

        self.scheduler.clear_scheduled();
        let swept = self.sweep(cutoff).await;

        if let Err(e) = orders.release_lease(REAPER_LEASE, self.holder).await {
            tracing::warn!(error = %e, "Failed to release reaper lease");
        }
        swept.map(Some)
    }

    async fn sweep(&self, cutoff: DateTime<Utc>) -> Result<Sweep, OrderError> {
        let mut filter = OrderFilter::default().with_status(OrderStatus::Pending);
        filter.order_types = self.service.order_types().all();
        filter.modified_before = Some(cutoff);
        let stale = self.service.orders().find(&filter).await?.items;

        let policy = self.service.extensions().unpaid_orders.clone();
        let (mut cancelled, mut skipped, mut failed) = (Vec::new(), Vec::new(), Vec::new());

        for order in stale {
            if !policy.should_cancel(&order) {
                skipped.push(order.id);
                continue;
            }

            let order_id = order.id;
            let result = retry_on_transient(self.retry.clone(), |_attempt| {
                let policy = policy.clone();
                async move {
                    self.service
                        .update_status_when(order_id, OrderStatus::Cancelled, CANCEL_NOTE, move |current: &Order| {
                            current.status == OrderStatus::Pending
                                && current.modified_at < cutoff
                                && policy.should_cancel(current)
                        })
                        .await
                }
            })
            .await;

            match result {
                RetryResult::Success(Some(_)) => cancelled.push(order_id),
                // Paid or touched since the query
                RetryResult::Success(None) => skipped.push(order_id),
                RetryResult::Failed(e) | RetryResult::PermanentFailure(e) => {
                    tracing::warn!(order_id = %order_id, error = %e, "Failed to cancel unpaid order");
                    failed.push((order_id, e.to_string()));
                }
            }
        }

        Ok(Sweep { cancelled, skipped, failed })
    }

    fn finish(&self, outcome: ReaperOutcome) -> ReaperOutcome {
        if let Some(metrics) = &self.metrics {
            let (cancelled, failed) = match &outcome {
                ReaperOutcome::Completed(report) => (report.cancelled.len(), report.failed.len()),
                _ => (0, 0),
            };
            metrics.record_reaper_run(outcome.label(), cancelled, failed);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LifecycleConfig;
    use crate::domain::order::SHOP_ORDER;
    use crate::store::{MemoryStore, OrderStore};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingScheduler {
        scheduled: Mutex<Vec<DateTime<Utc>>>,
        clears: Mutex<usize>,
    }

    impl Scheduler for RecordingScheduler {
        fn schedule_once(&self, at: DateTime<Utc>) {
            self.scheduled.lock().unwrap().push(at);
        }

        fn clear_scheduled(&self) {
            *self.clears.lock().unwrap() += 1;
        }
    }

    fn quick_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            initial_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        scheduler: Arc<RecordingScheduler>,
        reaper: UnpaidOrderReaper,
    }

    fn fixture(config: LifecycleConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let service = OrderService::builder(store.clone(), store.clone()).config(config).build();
        let scheduler = Arc::new(RecordingScheduler::default());
        let reaper = UnpaidOrderReaper::new(service, scheduler.clone()).with_retry(quick_retry());
        Fixture { store, scheduler, reaper }
    }

    async fn order_modified_at(store: &MemoryStore, at: DateTime<Utc>, checkout: bool) -> OrderId {
        let mut order = if checkout { Order::checkout(at) } else { Order::new(SHOP_ORDER, at) };
        store.save(&mut order).await.unwrap()
    }

    #[tokio::test]
    async fn test_cancels_only_strictly_older_checkout_orders() {
        let fx = fixture(LifecycleConfig { hold_stock_minutes: 60, ..Default::default() });
        let now = Utc::now();
        let cutoff = now - Duration::minutes(60);

        let stale = order_modified_at(&fx.store, cutoff - Duration::seconds(1), true).await;
        let boundary = order_modified_at(&fx.store, cutoff, true).await;
        let fresh = order_modified_at(&fx.store, now, true).await;
        let manual = order_modified_at(&fx.store, cutoff - Duration::hours(3), false).await;

        let ReaperOutcome::Completed(report) = fx.reaper.run(now).await.unwrap() else {
            panic!("reaper did not run");
        };

        assert_eq!(report.cutoff, cutoff);
        assert_eq!(report.cancelled, vec![stale]);
        assert_eq!(report.skipped, vec![manual]);
        assert!(report.failed.is_empty());

        let cancelled = fx.store.load(stale).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(cancelled.notes.iter().any(|n| n.content.ends_with(CANCEL_NOTE)));
        for id in [boundary, fresh, manual] {
            assert_eq!(fx.store.load(id).await.unwrap().status, OrderStatus::Pending);
        }

        assert_eq!(*fx.scheduler.scheduled.lock().unwrap(), vec![now + Duration::minutes(60)]);
        assert_eq!(*fx.scheduler.clears.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_disabled_without_hold_or_stock_management() {
        for config in [
            LifecycleConfig { hold_stock_minutes: 0, ..Default::default() },
            LifecycleConfig { manage_stock: false, ..Default::default() },
        ] {
            let fx = fixture(config);
            let id = order_modified_at(&fx.store, Utc::now() - Duration::days(2), true).await;

            assert_eq!(fx.reaper.run(Utc::now()).await.unwrap(), ReaperOutcome::Disabled);
            assert_eq!(fx.store.load(id).await.unwrap().status, OrderStatus::Pending);
            assert!(fx.scheduler.scheduled.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_lease_held_elsewhere() {
        let fx = fixture(LifecycleConfig::default());
        let other = Uuid::new_v4();
        assert!(fx.store.try_acquire_lease(REAPER_LEASE, other, LEASE_TTL).await.unwrap());

        let now = Utc::now();
        assert_eq!(fx.reaper.run(now).await.unwrap(), ReaperOutcome::LeaseHeld);
        assert_eq!(*fx.scheduler.scheduled.lock().unwrap(), vec![now + Duration::minutes(60)]);
        assert_eq!(*fx.scheduler.clears.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_outage_fails_pass_but_rearms() {
        let fx = fixture(LifecycleConfig::default());
        let stale = order_modified_at(&fx.store, Utc::now() - Duration::days(1), true).await;
        fx.store.fail_next_finds(1).await;

        let now = Utc::now();
        assert!(fx.reaper.run(now).await.is_err());
        assert_eq!(*fx.scheduler.scheduled.lock().unwrap(), vec![now + Duration::minutes(60)]);
        assert_eq!(fx.store.load(stale).await.unwrap().status, OrderStatus::Pending);

        // The lease was given back, so the next pass goes ahead
        let ReaperOutcome::Completed(report) = fx.reaper.run(Utc::now()).await.unwrap() else {
            panic!("reaper did not run");
        };
        assert_eq!(report.cancelled, vec![stale]);
    }

    #[tokio::test]
    async fn test_failure_on_one_order_does_not_stop_sweep() {
        let fx = fixture(LifecycleConfig::default());
        let old = Utc::now() - Duration::days(1);
        let broken = order_modified_at(&fx.store, old, true).await;
        let healthy = order_modified_at(&fx.store, old, true).await;
        fx.store.fail_saves_for(broken).await;

        let ReaperOutcome::Completed(report) = fx.reaper.run(Utc::now()).await.unwrap() else {
            panic!("reaper did not run");
        };

        assert_eq!(report.cancelled, vec![healthy]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, broken);
        assert_eq!(fx.scheduler.scheduled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lease_released_after_run() {
        let fx = fixture(LifecycleConfig::default());
        fx.reaper.run(Utc::now()).await.unwrap();

        assert!(fx.store.try_acquire_lease(REAPER_LEASE, Uuid::new_v4(), LEASE_TTL).await.unwrap());
    }

    struct AnyPending;

    impl crate::effects::UnpaidOrderPolicy for AnyPending {
        fn should_cancel(&self, order: &Order) -> bool {
            order.status == OrderStatus::Pending
        }
    }

    #[tokio::test]
    async fn test_policy_decides_which_orders_are_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let service = OrderService::builder(store.clone(), store.clone())
            .extensions(crate::effects::Extensions::default().with_unpaid_order_policy(Arc::new(AnyPending)))
            .build();
        let reaper = UnpaidOrderReaper::new(service, Arc::new(RecordingScheduler::default())).with_retry(quick_retry());

        let manual = order_modified_at(&store, Utc::now() - Duration::days(1), false).await;

        let ReaperOutcome::Completed(report) = reaper.run(Utc::now()).await.unwrap() else {
            panic!("reaper did not run");
        };
        assert_eq!(report.cancelled, vec![manual]);
    }
}

