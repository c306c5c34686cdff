use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::domain::order::OrderId;

// ============================================================================
// Event Envelope
// ============================================================================
//
// Wraps a lifecycle event with the metadata the effect registry and the
// observers need: identity, the order it concerns, correlation and timing.
//
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EventEnvelope<E> {
    // Event Identity
    pub event_id: Uuid,
    pub order_id: OrderId,

    // Event Type Information
    pub event_type: String,
    pub event_version: i32,

    // Event Payload
    pub event_data: E,

    // Correlation: events raised by one call share an id
    pub correlation_id: Uuid,

    // Actor Information
    pub user_id: Option<i64>,

    // Timing
    pub timestamp: DateTime<Utc>,

    pub metadata: HashMap<String, String>,
}

impl<E: DomainEvent> EventEnvelope<E> {
    pub fn new(order_id: OrderId, event_data: E, correlation_id: Uuid) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            order_id,
            event_type: E::event_type().to_string(),
            event_version: E::event_version(),
            event_data,
            correlation_id,
            user_id: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}

impl<E> EventEnvelope<E> {
    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Implemented by every payload carried in an envelope
pub trait DomainEvent: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync {
    fn event_type() -> &'static str where Self: Sized;
    fn event_version() -> i32 where Self: Sized { 1 }
}
