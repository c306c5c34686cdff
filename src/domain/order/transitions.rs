use serde::{Deserialize, Serialize};

use super::errors::OrderError;
use super::value_objects::OrderStatus;

// ============================================================================
// Status Transition Policy
// ============================================================================
//
// Permissive: any status may follow any other (legacy behavior).
// Strict: only the edges in `allowed_targets` are accepted.
//
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionPolicy {
    #[default]
    Permissive,
    Strict,
}

impl TransitionPolicy {
    pub fn check(&self, from: OrderStatus, to: OrderStatus) -> Result<(), OrderError> {
        match self {
            TransitionPolicy::Permissive => Ok(()),
            TransitionPolicy::Strict if from == to || allowed_targets(from).contains(&to) => Ok(()),
            TransitionPolicy::Strict => Err(OrderError::IllegalTransition { from, to }),
        }
    }
}

pub fn allowed_targets(from: OrderStatus) -> &'static [OrderStatus] {
    use OrderStatus::*;

    match from {
        Pending => &[Processing, OnHold, Completed, Cancelled, Failed],
        Processing => &[Completed, OnHold, Cancelled, Refunded, Failed],
        OnHold => &[Pending, Processing, Completed, Cancelled, Refunded, Failed],
        Completed => &[Refunded],
        Failed => &[Pending, Processing, OnHold, Completed, Cancelled],
        Cancelled => &[Pending, Processing, OnHold, Completed],
        Refunded => &[],
    }
}
