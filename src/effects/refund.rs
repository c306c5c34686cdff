use async_trait::async_trait;

use crate::domain::order::{LifecycleEvent, Order};
use super::{EffectContext, EffectError, EffectHandler, EffectMarker, EffectPlan, MarkerUpdate};

/// Refunds the unrefunded remainder when an order is marked refunded
pub struct SettleRefund;

#[async_trait]
impl EffectHandler for SettleRefund {
    fn name(&self) -> &'static str {
        "settle_refund"
    }

    // Repeat runs find nothing left to refund
    fn plan(&self, _order: &Order, _event: &LifecycleEvent, _ctx: &EffectContext) -> EffectPlan {
        EffectPlan::Run { on_success: MarkerUpdate::Keep }
    }

    async fn execute(&self, order: &mut Order, _event: &LifecycleEvent, ctx: &EffectContext) -> Result<(), EffectError> {
        if let Some(outcome) = ctx.refunds.settle_remaining(order).await? {
            tracing::info!(
                order_id = %order.id,
                refund_id = %outcome.refund.id,
                amount = %outcome.refund.totals.total,
                "Remaining balance refunded"
            );
        }
        Ok(())
    }

    fn marker(&self) -> Option<EffectMarker> {
        None
    }
}
