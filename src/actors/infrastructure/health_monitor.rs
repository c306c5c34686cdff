use actix::prelude::*;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::actors::core::{ComponentHealth, HealthStatus};
use crate::cache::RedisCache;
use crate::metrics::Metrics;

// ============================================================================
// Health Monitor Actor
// ============================================================================
//
// Collects component health pushed by other actors and polls the Redis
// cache circuit breaker every 10 seconds. The overall status is the worst
// component status.
//
// ============================================================================

const CACHE_COMPONENT: &str = "redis_cache";
const CACHE_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Message)]
#[rtype(result = "()")]
pub struct UpdateHealth {
    pub component: String,
    pub status: HealthStatus,
    pub details: Option<String>,
}

impl From<ComponentHealth> for UpdateHealth {
    fn from(health: ComponentHealth) -> Self {
        Self {
            component: health.name,
            status: health.status,
            details: health.details,
        }
    }
}

#[derive(Message)]
#[rtype(result = "SystemHealth")]
pub struct GetSystemHealth;

#[derive(Debug, Clone)]
pub struct SystemHealth {
    pub overall_status: HealthStatus,
    pub components: HashMap<String, ComponentHealth>,
    pub check_time: DateTime<Utc>,
}

pub struct HealthMonitorActor {
    components: HashMap<String, ComponentHealth>,
    cache: Option<Arc<RedisCache>>,
    metrics: Option<Arc<Metrics>>,
}

impl HealthMonitorActor {
    pub fn new(cache: Option<Arc<RedisCache>>, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            components: HashMap::new(),
            cache,
            metrics,
        }
    }

    fn compute_overall_status(&self) -> HealthStatus {
        let mut unhealthy = Vec::new();
        let mut degraded = Vec::new();

        for (name, health) in &self.components {
            match &health.status {
                HealthStatus::Unhealthy(msg) => unhealthy.push(format!("{}: {}", name, msg)),
                HealthStatus::Degraded(msg) => degraded.push(format!("{}: {}", name, msg)),
                HealthStatus::Healthy => {}
            }
        }
        unhealthy.sort();
        degraded.sort();

        if !unhealthy.is_empty() {
            HealthStatus::Unhealthy(unhealthy.join(", "))
        } else if !degraded.is_empty() {
            HealthStatus::Degraded(degraded.join(", "))
        } else {
            HealthStatus::Healthy
        }
    }

    fn poll_cache(&self, ctx: &mut Context<Self>) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let metrics = self.metrics.clone();

        ctx.spawn(
            async move { cache.circuit_state().await }
                .into_actor(self)
                .map(move |state, act, _ctx| {
                    if let Some(metrics) = &metrics {
                        metrics.update_cache_circuit_state(state);
                    }
                    let health = ComponentHealth::new(CACHE_COMPONENT, HealthStatus::from_cache_circuit(state))
                        .with_details(format!("circuit {}", state.label()));
                    act.components.insert(CACHE_COMPONENT.to_string(), health);
                }),
        );
    }
}

impl Actor for HealthMonitorActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(cache_probe = self.cache.is_some(), "HealthMonitorActor started");

        if self.cache.is_some() {
            self.poll_cache(ctx);
            ctx.run_interval(CACHE_POLL_INTERVAL, |act, ctx| act.poll_cache(ctx));
        }
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        tracing::info!("HealthMonitorActor stopped");
    }
}

impl Handler<UpdateHealth> for HealthMonitorActor {
    type Result = ();

    fn handle(&mut self, msg: UpdateHealth, _: &mut Self::Context) {
        tracing::debug!(component = %msg.component, status = ?msg.status, "Updated component health");

        let mut health = ComponentHealth::new(msg.component.clone(), msg.status);
        health.details = msg.details;
        self.components.insert(msg.component, health);
    }
}

impl Handler<GetSystemHealth> for HealthMonitorActor {
    type Result = MessageResult<GetSystemHealth>;

    fn handle(&mut self, _: GetSystemHealth, _: &mut Self::Context) -> Self::Result {
        MessageResult(SystemHealth {
            overall_status: self.compute_overall_status(),
            components: self.components.clone(),
            check_time: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(component: &str, status: HealthStatus) -> UpdateHealth {
        UpdateHealth { component: component.to_string(), status, details: None }
    }

    #[actix::test]
    async fn test_overall_status_is_worst_component() {
        let monitor = HealthMonitorActor::new(None, None).start();

        monitor.send(update("unpaid_order_reaper", HealthStatus::Healthy)).await.unwrap();
        let health = monitor.send(GetSystemHealth).await.unwrap();
        assert!(health.overall_status.is_healthy());

        monitor
            .send(update(CACHE_COMPONENT, HealthStatus::from_cache_circuit(crate::utils::CircuitState::Open)))
            .await
            .unwrap();
        let health = monitor.send(GetSystemHealth).await.unwrap();
        assert!(matches!(health.overall_status, HealthStatus::Degraded(ref msg) if msg.starts_with("redis_cache")));

        monitor
            .send(update("unpaid_order_reaper", HealthStatus::Unhealthy("store unavailable".to_string())))
            .await
            .unwrap();
        let health = monitor.send(GetSystemHealth).await.unwrap();
        assert_eq!(
            health.overall_status,
            HealthStatus::Unhealthy("unpaid_order_reaper: store unavailable".to_string())
        );
        assert_eq!(health.components.len(), 2);
    }
}
