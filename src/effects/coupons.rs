use async_trait::async_trait;

use crate::domain::order::{EventKey, LifecycleEvent, Order, OrderStatus};
use crate::store::MetaTarget;
use super::{
    claim_then, release_then, EffectContext, EffectError, EffectHandler, EffectMarker, EffectPlan, MarkerUpdate,
    SkipReason,
};

/// Counts coupon use when an order is placed and gives it back on cancellation.
///
/// | recorded | cancelled | action              |
/// |----------|-----------|---------------------|
/// | yes      | yes       | decrement, clear    |
/// | no       | no        | increment, set      |
/// | yes      | no        | nothing             |
/// | no       | yes       | nothing             |
pub struct CouponUsage;

fn is_cancellation(event: &LifecycleEvent) -> bool {
    event.key() == EventKey::Status(OrderStatus::Cancelled)
}

/// Order meta set while one code's use is counted
fn counted_key(code: &str) -> String {
    format!("_coupon_usage_counted_{}", code.trim().to_lowercase())
}

fn is_counted(order: &Order, code: &str) -> bool {
    order.get_meta(&counted_key(code)).is_some()
}

#[async_trait]
impl EffectHandler for CouponUsage {
    fn name(&self) -> &'static str {
        "coupon_usage"
    }

    fn plan(&self, order: &Order, event: &LifecycleEvent, _ctx: &EffectContext) -> EffectPlan {
        let recorded = EffectMarker::RecordedCouponUsageCounts.is_set(order);
        match (recorded, is_cancellation(event)) {
            (true, true) => EffectPlan::Run { on_success: MarkerUpdate::Clear },
            (false, false) => EffectPlan::Run { on_success: MarkerUpdate::Set },
            (true, false) => EffectPlan::Skip(SkipReason::AlreadyApplied),
            // An interrupted count still gets given back
            (false, true) if order.coupon_codes.iter().any(|code| is_counted(order, code)) => {
                EffectPlan::Run { on_success: MarkerUpdate::Clear }
            }
            (false, true) => EffectPlan::Skip(SkipReason::NotRecorded),
        }
    }

    async fn execute(&self, order: &mut Order, event: &LifecycleEvent, ctx: &EffectContext) -> Result<(), EffectError> {
        let increase = !is_cancellation(event);
        let identity = order.customer_ref();
        let target = MetaTarget::Order(order.id);

        for code in order.coupon_codes.clone() {
            // Counted codes are done on the way up and the only ones to undo on the way down
            if is_counted(order, &code) == increase {
                continue;
            }

            let key = counted_key(&code);
            let update = || ctx.catalog.update_coupon_usage(&code, identity.as_ref(), increase);
            let usage = if increase {
                claim_then(ctx, order, target, &key, "1", update).await?
            } else {
                release_then(ctx, order, target, &key, "1", update).await?
            };

            match usage {
                Some(count) => {
                    tracing::debug!(order_id = %order.id, coupon = %code, usage_count = count, "Coupon usage updated");
                }
                None => {
                    tracing::warn!(order_id = %order.id, coupon = %code, "Unknown coupon code on order");
                }
            }
        }
        Ok(())
    }

    fn marker(&self) -> Option<EffectMarker> {
        Some(EffectMarker::RecordedCouponUsageCounts)
    }
}
