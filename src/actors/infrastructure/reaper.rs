use actix::prelude::*;
use actix::WeakAddr;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::actors::core::{ComponentHealth, HealthCheckable, HealthStatus};
use crate::domain::order::{OrderError, OrderService};
use crate::metrics::Metrics;
use crate::reaper::{ReaperOutcome, Scheduler, UnpaidOrderReaper, REAPER_LEASE};
use super::{HealthMonitorActor, StopActor, UpdateHealth};

// ============================================================================
// Reaper Actor
// ============================================================================
//
// Hosts the unpaid order reaper and owns its one-shot timer. The reaper
// re-arms itself through `ActorScheduler`, which turns `schedule_once` and
// `clear_scheduled` into messages to this actor. At most one run is
// pending at any time.
//
// ============================================================================

#[derive(Message)]
#[rtype(result = "()")]
pub struct RunReaper;

#[derive(Message)]
#[rtype(result = "()")]
pub struct ScheduleRun {
    pub at: DateTime<Utc>,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct ClearSchedule;

/// `Scheduler` backed by the reaper actor's mailbox
pub struct ActorScheduler {
    addr: WeakAddr<ReaperActor>,
}

impl Scheduler for ActorScheduler {
    fn schedule_once(&self, at: DateTime<Utc>) {
        if let Some(addr) = self.addr.upgrade() {
            addr.do_send(ScheduleRun { at });
        }
    }

    fn clear_scheduled(&self) {
        if let Some(addr) = self.addr.upgrade() {
            addr.do_send(ClearSchedule);
        }
    }
}

pub struct ReaperActor {
    reaper: Arc<UnpaidOrderReaper>,
    health: Option<Addr<HealthMonitorActor>>,
    pending: Option<(SpawnHandle, DateTime<Utc>)>,
    last_outcome: Option<Result<ReaperOutcome, String>>,
}

impl ReaperActor {
    /// Start the actor; its first run is queued immediately
    pub fn spawn(
        service: OrderService,
        health: Option<Addr<HealthMonitorActor>>,
        metrics: Option<Arc<Metrics>>,
    ) -> Addr<Self> {
        Self::create(move |ctx| {
            let scheduler = Arc::new(ActorScheduler { addr: ctx.address().downgrade() });
            let mut reaper = UnpaidOrderReaper::new(service, scheduler);
            if let Some(metrics) = metrics {
                reaper = reaper.with_metrics(metrics);
            }

            Self {
                reaper: Arc::new(reaper),
                health,
                pending: None,
                last_outcome: None,
            }
        })
    }

    fn cancel_pending(&mut self, ctx: &mut Context<Self>) {
        if let Some((handle, _)) = self.pending.take() {
            ctx.cancel_future(handle);
        }
    }

    fn finished(&mut self, result: Result<ReaperOutcome, OrderError>) {
        match &result {
            Ok(outcome) => tracing::debug!(outcome = ?outcome, "Reaper run finished"),
            Err(e) => tracing::error!(error = %e, "Reaper run failed"),
        }
        self.last_outcome = Some(result.map_err(|e| e.to_string()));

        if let Some(health) = &self.health {
            health.do_send(UpdateHealth::from(self.check_health()));
        }
    }
}

impl Actor for ReaperActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!("ReaperActor started");
        ctx.notify(RunReaper);
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        tracing::info!("ReaperActor stopped");
    }
}

impl HealthCheckable for ReaperActor {
    fn check_health(&self) -> ComponentHealth {
        let (status, details) = match &self.last_outcome {
            None => (HealthStatus::Healthy, "waiting for first run".to_string()),
            Some(Err(e)) => (HealthStatus::Unhealthy(e.clone()), "last run failed".to_string()),
            Some(Ok(ReaperOutcome::Disabled)) => (HealthStatus::Healthy, "disabled".to_string()),
            Some(Ok(ReaperOutcome::LeaseHeld)) => (HealthStatus::Healthy, "lease held by another node".to_string()),
            Some(Ok(ReaperOutcome::Completed(report))) if !report.failed.is_empty() => (
                HealthStatus::Degraded(format!("{} orders could not be cancelled", report.failed.len())),
                format!("next run {}", report.next_run),
            ),
            Some(Ok(ReaperOutcome::Completed(report))) => (
                HealthStatus::Healthy,
                format!("cancelled {}, next run {}", report.cancelled.len(), report.next_run),
            ),
        };
        ComponentHealth::new(self.component_name(), status).with_details(details)
    }

    fn component_name(&self) -> &str {
        REAPER_LEASE
    }
}

impl Handler<RunReaper> for ReaperActor {
    type Result = ();

    fn handle(&mut self, _: RunReaper, ctx: &mut Self::Context) {
        let reaper = self.reaper.clone();

        ctx.spawn(
            async move { reaper.run(Utc::now()).await }
                .into_actor(self)
                .map(|result, act, _ctx| act.finished(result)),
        );
    }
}

impl Handler<ScheduleRun> for ReaperActor {
    type Result = ();

    fn handle(&mut self, msg: ScheduleRun, ctx: &mut Self::Context) {
        self.cancel_pending(ctx);

        let delay = (msg.at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tracing::debug!(at = %msg.at, delay_secs = delay.as_secs(), "Next reaper run scheduled");

        let handle = ctx.run_later(delay, |act, ctx| {
            act.pending = None;
            ctx.notify(RunReaper);
        });
        self.pending = Some((handle, msg.at));
    }
}

impl Handler<ClearSchedule> for ReaperActor {
    type Result = ();

    fn handle(&mut self, _: ClearSchedule, ctx: &mut Self::Context) {
        self.cancel_pending(ctx);
    }
}

impl Handler<StopActor> for ReaperActor {
    type Result = ();

    fn handle(&mut self, _: StopActor, ctx: &mut Self::Context) {
        tracing::info!("ReaperActor received stop signal");
        self.cancel_pending(ctx);
        ctx.stop();
    }
}

/// Time of the pending run, if any
#[derive(Message)]
#[rtype(result = "Option<DateTime<Utc>>")]
pub struct GetNextRun;

impl Handler<GetNextRun> for ReaperActor {
    type Result = Option<DateTime<Utc>>;

    fn handle(&mut self, _: GetNextRun, _: &mut Self::Context) -> Self::Result {
        self.pending.as_ref().map(|(_, at)| *at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::infrastructure::GetSystemHealth;
    use crate::config::LifecycleConfig;
    use crate::domain::order::{Order, OrderStatus};
    use crate::store::{MemoryStore, OrderStore};

    #[actix::test]
    async fn test_first_run_cancels_and_rearms() {
        let store = Arc::new(MemoryStore::new());
        let mut stale = Order::checkout(Utc::now() - chrono::Duration::hours(3));
        let stale_id = store.save(&mut stale).await.unwrap();

        let service = OrderService::builder(store.clone(), store.clone())
            .config(LifecycleConfig { hold_stock_minutes: 60, ..Default::default() })
            .build();
        let health = HealthMonitorActor::new(None, None).start();
        let started = Utc::now();
        let reaper = ReaperActor::spawn(service, Some(health.clone()), None);

        let mut observed = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let next_run = reaper.send(GetNextRun).await.unwrap();
            let system = health.send(GetSystemHealth).await.unwrap();
            if let (Some(next_run), Some(component)) = (next_run, system.components.get(REAPER_LEASE)) {
                observed = Some((next_run, component.clone()));
                break;
            }
        }

        let (next_run, component) = observed.expect("reaper did not re-arm");
        assert!(next_run >= started + chrono::Duration::minutes(60));
        assert!(component.status.is_healthy());
        assert_eq!(store.load(stale_id).await.unwrap().status, OrderStatus::Cancelled);
    }

    #[actix::test]
    async fn test_failed_run_stays_scheduled_and_reports_unhealthy() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_finds(1).await;

        let service = OrderService::builder(store.clone(), store.clone()).build();
        let health = HealthMonitorActor::new(None, None).start();
        let reaper = ReaperActor::spawn(service, Some(health.clone()), None);

        let mut observed = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let next_run = reaper.send(GetNextRun).await.unwrap();
            let system = health.send(GetSystemHealth).await.unwrap();
            if let (Some(next_run), Some(component)) = (next_run, system.components.get(REAPER_LEASE)) {
                observed = Some((next_run, component.clone()));
                break;
            }
        }

        let (next_run, component) = observed.expect("reaper did not re-arm after a failed run");
        assert!(next_run > Utc::now());
        assert!(!component.status.is_healthy());
    }

    #[actix::test]
    async fn test_clear_schedule_drops_pending_run() {
        let store = Arc::new(MemoryStore::new());
        let service = OrderService::builder(store.clone(), store.clone())
            .config(LifecycleConfig { hold_stock_minutes: 0, ..Default::default() })
            .build();
        let reaper = ReaperActor::spawn(service, None, None);

        reaper.send(ScheduleRun { at: Utc::now() + chrono::Duration::hours(1) }).await.unwrap();
        assert!(reaper.send(GetNextRun).await.unwrap().is_some());

        reaper.send(ClearSchedule).await.unwrap();
        assert!(reaper.send(GetNextRun).await.unwrap().is_none());
    }
}
