use async_trait::async_trait;
use chrono::Utc;

use crate::domain::order::{ItemId, LifecycleEvent, LineItem, Order, ProductId};
use crate::store::MetaTarget;
use super::{
    claim_then, release_then, EffectContext, EffectError, EffectHandler, EffectMarker, EffectPlan, MarkerUpdate,
    SkipReason,
};

/// Item meta holding how much stock an item took
pub const REDUCED_STOCK_META: &str = "_reduced_stock";

const STOCK_MANAGEMENT: &str = "stock management";

/// Product lines whose product manages stock, with the quantity each one moves
async fn stock_lines(
    order: &Order,
    ctx: &EffectContext,
    quantity: impl Fn(ItemId, &LineItem) -> Option<i64>,
) -> Result<Vec<(ItemId, ProductId, String, i64)>, EffectError> {
    let mut lines = Vec::new();
    for item in order.items.products() {
        let Some(product_id) = item.product_id() else { continue };
        let Some(qty) = quantity(item.id, item).filter(|qty| *qty > 0) else { continue };

        match ctx.catalog.product(product_id).await? {
            Some(product) if product.manage_stock => {
                lines.push((item.id, product_id, product.formatted_name(), qty));
            }
            _ => continue,
        }
    }
    Ok(lines)
}

// ============================================================================
// Reduce on payment
// ============================================================================

pub struct ReduceStock;

#[async_trait]
impl EffectHandler for ReduceStock {
    fn name(&self) -> &'static str {
        "reduce_stock"
    }

    fn plan(&self, order: &Order, _event: &LifecycleEvent, ctx: &EffectContext) -> EffectPlan {
        if !ctx.config.manage_stock {
            return EffectPlan::Skip(SkipReason::PolicyDisabled(STOCK_MANAGEMENT));
        }
        if !ctx.extensions.stock.reduction_due(order) {
            return EffectPlan::Skip(SkipReason::AlreadyApplied);
        }
        EffectPlan::Run { on_success: MarkerUpdate::Set }
    }

    async fn execute(&self, order: &mut Order, _event: &LifecycleEvent, ctx: &EffectContext) -> Result<(), EffectError> {
        let policy = ctx.extensions.stock.clone();
        let snapshot = order.clone();
        // Lines that already hold reduced stock were taken by an earlier attempt
        let lines = stock_lines(order, ctx, |id, item| {
            if snapshot.items.get_meta(id, REDUCED_STOCK_META).is_some() {
                return None;
            }
            Some(policy.quantity_to_reduce(&snapshot, item))
        })
        .await?;

        let mut changes = Vec::with_capacity(lines.len());
        for (item_id, product_id, name, qty) in lines {
            let target = MetaTarget::LineItem(item_id);
            let change = claim_then(ctx, order, target, REDUCED_STOCK_META, &qty.to_string(), || {
                ctx.catalog.adjust_stock(product_id, -qty)
            })
            .await?;
            changes.push(format!("{} {}→{}", name, change.before, change.after));

            if change.after < 0 {
                if let Some(product) = ctx.catalog.product(product_id).await? {
                    tracing::info!(order_id = %order.id, product_id = %product_id, stock = change.after, "Product on backorder");
                    ctx.extensions.notify(|o| o.backorder(order, &product, -change.after));
                }
                if let Some(metrics) = &ctx.metrics {
                    metrics.record_backorder(product_id.0);
                }
            }
        }

        if !changes.is_empty() {
            order.add_note(format!("Stock levels reduced: {}", changes.join(", ")), Utc::now());
        }
        Ok(())
    }

    fn marker(&self) -> Option<EffectMarker> {
        Some(EffectMarker::OrderStockReduced)
    }
}

// ============================================================================
// Restore on cancellation
// ============================================================================

pub struct RestoreStock;

#[async_trait]
impl EffectHandler for RestoreStock {
    fn name(&self) -> &'static str {
        "restore_stock"
    }

    fn plan(&self, order: &Order, _event: &LifecycleEvent, ctx: &EffectContext) -> EffectPlan {
        if !ctx.config.manage_stock {
            return EffectPlan::Skip(SkipReason::PolicyDisabled(STOCK_MANAGEMENT));
        }
        let holds_stock = order
            .items
            .item_ids()
            .into_iter()
            .any(|id| order.items.get_meta(id, REDUCED_STOCK_META).is_some());
        if !EffectMarker::OrderStockReduced.is_set(order) && !holds_stock {
            return EffectPlan::Skip(SkipReason::NotRecorded);
        }
        EffectPlan::Run { on_success: MarkerUpdate::Clear }
    }

    async fn execute(&self, order: &mut Order, _event: &LifecycleEvent, ctx: &EffectContext) -> Result<(), EffectError> {
        let items = order.items.clone();
        let lines = stock_lines(order, ctx, |id, _| {
            items.get_meta(id, REDUCED_STOCK_META).and_then(|raw| raw.parse().ok())
        })
        .await?;

        let mut changes = Vec::with_capacity(lines.len());
        for (item_id, product_id, name, qty) in lines {
            let target = MetaTarget::LineItem(item_id);
            let change = release_then(ctx, order, target, REDUCED_STOCK_META, &qty.to_string(), || {
                ctx.catalog.adjust_stock(product_id, qty)
            })
            .await?;
            changes.push(format!("{} {}→{}", name, change.before, change.after));
        }

        if !changes.is_empty() {
            order.add_note(format!("Stock levels increased: {}", changes.join(", ")), Utc::now());
        }
        Ok(())
    }

    fn marker(&self) -> Option<EffectMarker> {
        Some(EffectMarker::OrderStockReduced)
    }
}
