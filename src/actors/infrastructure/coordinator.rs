use actix::prelude::*;
use std::sync::Arc;
use std::time::Duration;

use crate::actors::core::HealthStatus;
use crate::cache::RedisCache;
use crate::domain::order::OrderService;
use crate::metrics::Metrics;
use super::{GetSystemHealth, HealthMonitorActor, ReaperActor, StopActor, UpdateHealth};

// ============================================================================
// Coordinator Actor - Orchestrates background actors
// ============================================================================
//
// Actor Hierarchy:
//   CoordinatorActor
//   ├── HealthMonitorActor
//   └── ReaperActor
//
// Order commands do not go through actors; callers use `OrderService`
// directly. The coordinator only hosts the background work.
//
// ============================================================================

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

pub struct CoordinatorActor {
    service: OrderService,
    cache: Option<Arc<RedisCache>>,
    metrics: Option<Arc<Metrics>>,
    health_monitor: Option<Addr<HealthMonitorActor>>,
    reaper: Option<Addr<ReaperActor>>,
}

impl CoordinatorActor {
    pub fn new(service: OrderService) -> Self {
        Self {
            service,
            cache: None,
            metrics: None,
            health_monitor: None,
            reaper: None,
        }
    }

    /// Probe this cache's circuit breaker for health
    pub fn with_cache(mut self, cache: Arc<RedisCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn start_child_actors(&mut self) {
        tracing::info!("Starting child actors");

        let health_monitor = HealthMonitorActor::new(self.cache.clone(), self.metrics.clone()).start();
        self.health_monitor = Some(health_monitor.clone());

        health_monitor.do_send(UpdateHealth {
            component: "order_store".to_string(),
            status: HealthStatus::Healthy,
            details: Some(format!("{} order types registered", self.service.order_types().all().len())),
        });

        let reaper = ReaperActor::spawn(self.service.clone(), Some(health_monitor), self.metrics.clone());
        self.reaper = Some(reaper);

        tracing::info!("✅ Child actors started");
    }
}

impl Actor for CoordinatorActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!("🎯 CoordinatorActor started");
        self.start_child_actors();

        ctx.run_interval(HEALTH_LOG_INTERVAL, |act, _ctx| {
            let Some(health_monitor) = act.health_monitor.clone() else {
                return;
            };
            actix::spawn(async move {
                match health_monitor.send(GetSystemHealth).await {
                    Ok(health) => match health.overall_status {
                        HealthStatus::Healthy => tracing::debug!("System health check: Healthy"),
                        HealthStatus::Degraded(ref msg) => tracing::warn!("System health check: Degraded - {}", msg),
                        HealthStatus::Unhealthy(ref msg) => tracing::error!("System health check: Unhealthy - {}", msg),
                    },
                    Err(e) => tracing::error!("Failed to get system health: {}", e),
                }
            });
        });
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        tracing::info!("🛑 CoordinatorActor stopping - initiating graceful shutdown");
        Running::Stop
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        tracing::info!("🛑 CoordinatorActor stopped");
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Message)]
#[rtype(result = "Result<(), String>")]
pub struct Shutdown;

impl Handler<Shutdown> for CoordinatorActor {
    type Result = Result<(), String>;

    fn handle(&mut self, _msg: Shutdown, ctx: &mut Self::Context) -> Self::Result {
        tracing::info!("Received shutdown signal");

        if let Some(reaper) = self.reaper.take() {
            reaper.do_send(StopActor);
        }
        if let Some(health_monitor) = self.health_monitor.take() {
            health_monitor.do_send(StopActor);
        }

        ctx.stop();
        Ok(())
    }
}

impl Handler<StopActor> for HealthMonitorActor {
    type Result = ();

    fn handle(&mut self, _: StopActor, ctx: &mut Self::Context) {
        tracing::info!("HealthMonitorActor received stop signal");
        ctx.stop();
    }
}

#[derive(Message)]
#[rtype(result = "Option<Addr<HealthMonitorActor>>")]
pub struct GetHealthMonitor;

impl Handler<GetHealthMonitor> for CoordinatorActor {
    type Result = Option<Addr<HealthMonitorActor>>;

    fn handle(&mut self, _: GetHealthMonitor, _: &mut Self::Context) -> Self::Result {
        self.health_monitor.clone()
    }
}

#[derive(Message)]
#[rtype(result = "Option<Addr<ReaperActor>>")]
pub struct GetReaper;

impl Handler<GetReaper> for CoordinatorActor {
    type Result = Option<Addr<ReaperActor>>;

    fn handle(&mut self, _: GetReaper, _: &mut Self::Context) -> Self::Result {
        self.reaper.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LifecycleConfig;
    use crate::store::MemoryStore;

    #[actix::test]
    async fn test_starts_children_and_shuts_down() {
        let store = Arc::new(MemoryStore::new());
        let service = OrderService::builder(store.clone(), store)
            .config(LifecycleConfig { hold_stock_minutes: 0, ..Default::default() })
            .build();
        let coordinator = CoordinatorActor::new(service).start();

        let health_monitor = coordinator.send(GetHealthMonitor).await.unwrap().unwrap();
        let reaper = coordinator.send(GetReaper).await.unwrap().unwrap();

        let health = health_monitor.send(GetSystemHealth).await.unwrap();
        assert!(health.components.contains_key("order_store"));

        coordinator.send(Shutdown).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!coordinator.connected());
        assert!(!reaper.connected());
        assert!(!health_monitor.connected());
    }
}
