// ============================================================================
// Order Domain - Business Logic for the Order Aggregate
// ============================================================================
//
// This module contains ALL Order-specific code:
// - Value objects (OrderId, OrderStatus, totals, addresses)
// - Line items and the ledger that owns them
// - The Order aggregate
// - Order type registry and status transition policy
// - Lifecycle events and errors
// - OrderService (the query/command surface)
//
// ============================================================================

pub mod value_objects;
pub mod line_item;
pub mod aggregate;
pub mod order_types;
pub mod transitions;
pub mod events;
pub mod errors;
pub mod service;

// Re-export for convenience
pub use value_objects::*;
pub use line_item::*;
pub use aggregate::*;
pub use order_types::*;
pub use transitions::*;
pub use events::*;
pub use errors::*;
pub use service::*;
