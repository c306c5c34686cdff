// Private module declaration
mod server;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, Opts, Registry,
};

use crate::utils::CircuitState;

// Re-export for public API
pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for the order lifecycle
// ============================================================================
//
// - Effect handler outcomes (applied / skipped / failed) and dispatch latency
// - Status transitions by target status
// - Refunds created
// - Unpaid order reaper runs and cancellations
// - Backorders raised by stock reduction
// - Cache circuit breaker state
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Effects
    pub effects_applied: IntCounterVec,
    pub effects_skipped: IntCounterVec,
    pub effects_failed: IntCounterVec,
    pub dispatch_duration: HistogramVec,

    // Lifecycle
    pub status_transitions: IntCounterVec,
    pub refunds_created: IntCounter,
    pub backorders: IntCounterVec,

    // Reaper
    pub reaper_runs: IntCounterVec,
    pub reaper_cancelled: IntCounter,
    pub reaper_failures: IntCounter,

    // Cache
    pub cache_circuit_state: IntGauge,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let effects_applied = IntCounterVec::new(
            Opts::new("order_effects_applied_total", "Effect handlers that ran and completed"),
            &["effect"],
        )?;
        registry.register(Box::new(effects_applied.clone()))?;

        let effects_skipped = IntCounterVec::new(
            Opts::new("order_effects_skipped_total", "Effect handlers skipped by their marker or policy"),
            &["effect", "reason"],
        )?;
        registry.register(Box::new(effects_skipped.clone()))?;

        let effects_failed = IntCounterVec::new(
            Opts::new("order_effects_failed_total", "Effect handlers that failed"),
            &["effect"],
        )?;
        registry.register(Box::new(effects_failed.clone()))?;

        let dispatch_duration = HistogramVec::new(
            HistogramOpts::new("order_event_dispatch_duration_seconds", "Time to run every handler of one event")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["event"],
        )?;
        registry.register(Box::new(dispatch_duration.clone()))?;

        let status_transitions = IntCounterVec::new(
            Opts::new("order_status_transitions_total", "Persisted order status changes"),
            &["to_status"],
        )?;
        registry.register(Box::new(status_transitions.clone()))?;

        let refunds_created = IntCounter::new("order_refunds_created_total", "Refund records created")?;
        registry.register(Box::new(refunds_created.clone()))?;

        let backorders = IntCounterVec::new(
            Opts::new("order_backorders_total", "Stock reductions that left a product below zero"),
            &["product_id"],
        )?;
        registry.register(Box::new(backorders.clone()))?;

        let reaper_runs = IntCounterVec::new(
            Opts::new("unpaid_order_reaper_runs_total", "Unpaid order reaper runs by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(reaper_runs.clone()))?;

        let reaper_cancelled = IntCounter::new(
            "unpaid_order_reaper_cancelled_total",
            "Orders cancelled by the unpaid order reaper",
        )?;
        registry.register(Box::new(reaper_cancelled.clone()))?;

        let reaper_failures = IntCounter::new(
            "unpaid_order_reaper_failures_total",
            "Orders the unpaid order reaper failed to cancel",
        )?;
        registry.register(Box::new(reaper_failures.clone()))?;

        let cache_circuit_state = IntGauge::new(
            "cache_circuit_breaker_state",
            "Cache circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(cache_circuit_state.clone()))?;

        Ok(Self {
            registry,
            effects_applied,
            effects_skipped,
            effects_failed,
            dispatch_duration,
            status_transitions,
            refunds_created,
            backorders,
            reaper_runs,
            reaper_cancelled,
            reaper_failures,
            cache_circuit_state,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_effect_applied(&self, effect: &str) {
        self.effects_applied.with_label_values(&[effect]).inc();
    }

    pub fn record_effect_skipped(&self, effect: &str, reason: &str) {
        self.effects_skipped.with_label_values(&[effect, reason]).inc();
    }

    pub fn record_effect_failed(&self, effect: &str) {
        self.effects_failed.with_label_values(&[effect]).inc();
    }

    pub fn record_dispatch(&self, event: &str, duration_secs: f64) {
        self.dispatch_duration.with_label_values(&[event]).observe(duration_secs);
    }

    pub fn record_transition(&self, to_status: &str) {
        self.status_transitions.with_label_values(&[to_status]).inc();
    }

    pub fn record_backorder(&self, product_id: i64) {
        self.backorders.with_label_values(&[&product_id.to_string()]).inc();
    }

    pub fn record_reaper_run(&self, outcome: &str, cancelled: usize, failed: usize) {
        self.reaper_runs.with_label_values(&[outcome]).inc();
        self.reaper_cancelled.inc_by(cancelled as u64);
        self.reaper_failures.inc_by(failed as u64);
    }

    pub fn update_cache_circuit_state(&self, state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        };
        self.cache_circuit_state.set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_transition("completed");
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn test_effect_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_effect_applied("reduce_stock");
        metrics.record_effect_skipped("reduce_stock", "already_applied");
        metrics.record_effect_skipped("record_sales", "already_applied");

        let gathered = metrics.registry.gather();
        let applied = gathered.iter().find(|m| m.name() == "order_effects_applied_total").unwrap();
        assert_eq!(applied.metric[0].counter.value, Some(1.0));

        let skipped = gathered.iter().find(|m| m.name() == "order_effects_skipped_total").unwrap();
        assert_eq!(skipped.metric.len(), 2);
    }

    #[test]
    fn test_reaper_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_reaper_run("completed", 3, 1);

        let gathered = metrics.registry.gather();
        let cancelled = gathered.iter().find(|m| m.name() == "unpaid_order_reaper_cancelled_total").unwrap();
        assert_eq!(cancelled.metric[0].counter.value, Some(3.0));
    }

    #[test]
    fn test_circuit_state_gauge() {
        let metrics = Metrics::new().unwrap();
        metrics.update_cache_circuit_state(CircuitState::HalfOpen);

        let gathered = metrics.registry.gather();
        let state = gathered.iter().find(|m| m.name() == "cache_circuit_breaker_state").unwrap();
        assert_eq!(state.metric[0].gauge.value, Some(2.0));
    }
}
