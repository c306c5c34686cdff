// ============================================================================
// Lifecycle Event Plumbing
// ============================================================================
//
// Generic envelope shared by every event the order engine raises.
// The event payloads themselves live in src/domain/order/events.rs.
//
// ============================================================================

pub mod envelope;

pub use envelope::{DomainEvent, EventEnvelope};
