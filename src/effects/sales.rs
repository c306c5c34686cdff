use async_trait::async_trait;

use crate::domain::order::{LifecycleEvent, Order};
use crate::store::MetaTarget;
use super::{claim_then, EffectContext, EffectError, EffectHandler, EffectMarker, EffectPlan};

/// Item meta set once a line's quantity is in the sales counter
pub const SALES_RECORDED_META: &str = "_sales_recorded";

/// Adds each product line's quantity to the product's sales counter
pub struct RecordSales;

#[async_trait]
impl EffectHandler for RecordSales {
    fn name(&self) -> &'static str {
        "record_sales"
    }

    fn plan(&self, order: &Order, _event: &LifecycleEvent, _ctx: &EffectContext) -> EffectPlan {
        EffectPlan::once(order, EffectMarker::RecordedSales)
    }

    async fn execute(&self, order: &mut Order, _event: &LifecycleEvent, ctx: &EffectContext) -> Result<(), EffectError> {
        let lines: Vec<_> = order
            .items
            .products()
            .filter(|item| order.items.get_meta(item.id, SALES_RECORDED_META).is_none())
            .filter_map(|item| item.product_id().map(|product_id| (item.id, product_id, item.quantity)))
            .collect();

        for (item_id, product_id, quantity) in lines {
            // Deleted products are skipped
            if ctx.catalog.product(product_id).await?.is_none() {
                tracing::debug!(order_id = %order.id, product_id = %product_id, "Product gone, sales not recorded");
                continue;
            }
            claim_then(ctx, order, MetaTarget::LineItem(item_id), SALES_RECORDED_META, &quantity.to_string(), || {
                ctx.catalog.record_sales(product_id, quantity)
            })
            .await?;
        }
        Ok(())
    }

    fn marker(&self) -> Option<EffectMarker> {
        Some(EffectMarker::RecordedSales)
    }
}
