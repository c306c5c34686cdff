use serde::{Deserialize, Serialize};

use crate::events::DomainEvent;
use super::value_objects::OrderStatus;

// ============================================================================
// Order Lifecycle Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LifecycleEvent {
    StatusChanged(StatusChanged),
    PaymentComplete(PaymentComplete),
}

impl LifecycleEvent {
    pub fn key(&self) -> EventKey {
        match self {
            LifecycleEvent::StatusChanged(e) => EventKey::Status(e.to),
            LifecycleEvent::PaymentComplete(_) => EventKey::PaymentComplete,
        }
    }

    pub fn name(&self) -> String {
        self.key().to_string()
    }
}

impl DomainEvent for LifecycleEvent {
    fn event_type() -> &'static str { "OrderLifecycleEvent" }
}

/// Key effect handlers are registered under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKey {
    Status(OrderStatus),
    PaymentComplete,
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKey::Status(status) => f.write_str(status.slug()),
            EventKey::PaymentComplete => f.write_str("payment_complete"),
        }
    }
}

// ============================================================================
// Individual Event Types
// ============================================================================

/// Status Changed - raised once per persisted status transition
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatusChanged {
    pub from: OrderStatus,
    pub to: OrderStatus,
}

impl DomainEvent for StatusChanged {
    fn event_type() -> &'static str { "OrderStatusChanged" }
    fn event_version() -> i32 { 1 }
}

/// Payment Complete - a gateway confirmed payment for the order
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PaymentComplete {
    pub transaction_id: Option<String>,
}

impl DomainEvent for PaymentComplete {
    fn event_type() -> &'static str { "OrderPaymentComplete" }
    fn event_version() -> i32 { 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_keys() {
        let changed = LifecycleEvent::StatusChanged(StatusChanged {
            from: OrderStatus::Pending,
            to: OrderStatus::OnHold,
        });
        assert_eq!(changed.key(), EventKey::Status(OrderStatus::OnHold));
        assert_eq!(changed.name(), "on-hold");

        let paid = LifecycleEvent::PaymentComplete(PaymentComplete { transaction_id: None });
        assert_eq!(paid.name(), "payment_complete");
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = LifecycleEvent::StatusChanged(StatusChanged {
            from: OrderStatus::Processing,
            to: OrderStatus::Completed,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"StatusChanged\""));
        assert!(json.contains("\"to\":\"completed\""));
    }
}
