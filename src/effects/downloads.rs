use async_trait::async_trait;
use chrono::Utc;

use crate::domain::catalog::DownloadPermission;
use crate::domain::order::{EventKey, LifecycleEvent, Order, OrderStatus};
use super::{EffectContext, EffectError, EffectHandler, EffectMarker, EffectPlan, SkipReason};

/// Grants download permissions for every downloadable product on the order
pub struct GrantDownloads;

#[async_trait]
impl EffectHandler for GrantDownloads {
    fn name(&self) -> &'static str {
        "grant_downloads"
    }

    fn plan(&self, order: &Order, event: &LifecycleEvent, ctx: &EffectContext) -> EffectPlan {
        if event.key() == EventKey::Status(OrderStatus::Processing) && !ctx.config.grant_download_access_after_payment {
            return EffectPlan::Skip(SkipReason::PolicyDisabled("download access after payment"));
        }
        EffectPlan::once(order, EffectMarker::DownloadPermissionsGranted)
    }

    async fn execute(&self, order: &mut Order, _event: &LifecycleEvent, ctx: &EffectContext) -> Result<(), EffectError> {
        let now = Utc::now();
        let granted_from = order.completed_at.unwrap_or(now);
        let user_email = order.billing_email().map(str::to_string);
        let mut granted = 0;

        for item in order.items.products() {
            let Some(product_id) = item.product_id() else { continue };
            let Some(product) = ctx.catalog.product(product_id).await? else { continue };
            if !product.downloadable {
                continue;
            }

            for asset in &product.downloads {
                let permission = DownloadPermission {
                    download_id: asset.download_id.clone(),
                    product_id,
                    order_id: order.id,
                    user_id: order.customer_id,
                    user_email: user_email.clone(),
                    downloads_remaining: product.downloads_remaining_for(item.quantity),
                    access_granted: now,
                    access_expires: product.access_expires_from(granted_from),
                };
                if ctx.catalog.grant_download(permission).await? {
                    granted += 1;
                }
            }
        }

        tracing::debug!(order_id = %order.id, granted = granted, "Download permissions granted");
        Ok(())
    }

    fn marker(&self) -> Option<EffectMarker> {
        Some(EffectMarker::DownloadPermissionsGranted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LifecycleConfig;
    use crate::domain::catalog::{DownloadAsset, Product};
    use crate::domain::order::{LineItem, ProductId};
    use crate::effects::testing::*;
    use crate::effects::{EffectOutcome, EffectRegistry, OrderLocks};
    use crate::store::{CatalogStore, OrderStore};
    use chrono::Duration;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn ebook() -> Product {
        let mut product = Product::new(ProductId(3), "Ebook").with_download(DownloadAsset {
            download_id: "pdf".to_string(),
            name: "Ebook PDF".to_string(),
            file: "https://files.example.com/ebook.pdf".to_string(),
        });
        product.download_limit = Some(2);
        product.download_expiry_days = Some(7);
        product
    }

    async fn paid_order(fx: &Fixture) -> Order {
        fx.store.save_product(&ebook()).await.unwrap();
        let mut order = Order::checkout(Utc::now());
        order.customer_id = Some(5);
        order.set_meta("_billing_email", "reader@example.com");
        order.add_item(LineItem::product(ProductId(3), "Ebook", 3, Decimal::TEN));
        fx.store.save(&mut order).await.unwrap();
        order
    }

    #[tokio::test]
    async fn test_grants_once_per_asset() {
        let fx = fixture(LifecycleConfig::default());
        let mut order = paid_order(&fx).await;
        let completed = Utc::now() - Duration::days(1);
        order.completed_at = Some(completed);
        fx.store.save(&mut order).await.unwrap();

        let registry = EffectRegistry::with_default_handlers(fx.context.clone(), OrderLocks::new());
        let envelope = status_event(order.id, OrderStatus::Processing, OrderStatus::Completed);
        registry.dispatch(&envelope).await;
        registry.dispatch(&envelope).await;

        let permissions = fx.store.download_permissions(order.id).await.unwrap();
        assert_eq!(permissions.len(), 1);
        assert_eq!(permissions[0].downloads_remaining, Some(6));
        assert_eq!(permissions[0].user_id, Some(5));
        assert_eq!(permissions[0].user_email.as_deref(), Some("reader@example.com"));
        assert_eq!(permissions[0].access_expires, Some(completed + Duration::days(7)));
    }

    #[tokio::test]
    async fn test_processing_skipped_when_access_waits_for_completion() {
        let config = LifecycleConfig {
            grant_download_access_after_payment: false,
            ..Default::default()
        };
        let fx = fixture(config);
        let order = paid_order(&fx).await;

        let mut registry = EffectRegistry::new(fx.context.clone(), OrderLocks::new());
        registry.register(EventKey::Status(OrderStatus::Processing), Arc::new(GrantDownloads));
        registry.register(EventKey::Status(OrderStatus::Completed), Arc::new(GrantDownloads));

        let report = registry
            .dispatch(&status_event(order.id, OrderStatus::Pending, OrderStatus::Processing))
            .await;
        assert!(matches!(
            report.outcome("grant_downloads"),
            Some(EffectOutcome::Skipped(SkipReason::PolicyDisabled(_)))
        ));
        let stored = fx.store.load(order.id).await.unwrap();
        assert!(!EffectMarker::DownloadPermissionsGranted.is_set(&stored));

        registry
            .dispatch(&status_event(order.id, OrderStatus::Processing, OrderStatus::Completed))
            .await;
        assert_eq!(fx.store.download_permissions(order.id).await.unwrap().len(), 1);
    }
}
