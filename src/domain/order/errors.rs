use rust_decimal::Decimal;

use super::value_objects::{OrderId, OrderStatus};
use crate::store::StoreError;
use crate::utils::IsTransient;

// ============================================================================
// Order Lifecycle Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Invalid order: {0}")]
    InvalidOrder(OrderId),

    #[error("Invalid order status: {0}")]
    InvalidStatus(String),

    #[error("Unregistered order type: {0}")]
    UnknownOrderType(String),

    #[error("Status transition not allowed: {from} -> {to}")]
    IllegalTransition { from: OrderStatus, to: OrderStatus },

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Invalid refund amount: {0}")]
    InvalidRefundAmount(Decimal),

    #[error("Refund of {requested} exceeds remaining refundable amount {available}")]
    RefundExceedsRemaining { requested: Decimal, available: Decimal },
}

impl OrderError {
    /// Convert a store error raised while operating on a specific order
    pub fn from_store(order_id: OrderId, err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => OrderError::InvalidOrder(order_id),
            other => OrderError::PersistenceFailure(other.to_string()),
        }
    }
}

impl From<StoreError> for OrderError {
    fn from(err: StoreError) -> Self {
        OrderError::PersistenceFailure(err.to_string())
    }
}

impl IsTransient for OrderError {
    fn is_transient(&self) -> bool {
        matches!(self, OrderError::PersistenceFailure(_))
    }
}
