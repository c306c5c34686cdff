// ============================================================================
// Order Lifecycle Engine
// ============================================================================
//
// - domain/   - orders, refunds, catalog entities and OrderService
// - effects/  - idempotent side effects dispatched on lifecycle events
// - search/   - order search over meta, names and line items
// - reaper/   - cancellation of stale unpaid orders
// - store/    - OrderStore/CatalogStore traits, memory and ScyllaDB backends
// - cache/    - versioned-prefix cache over memory or Redis
// - actors/   - actix hosts for the reaper and health monitoring
//
// ============================================================================

pub mod actors;
pub mod cache;
pub mod config;
pub mod domain;
pub mod effects;
pub mod events;
pub mod metrics;
pub mod reaper;
pub mod search;
pub mod store;
pub mod utils;
