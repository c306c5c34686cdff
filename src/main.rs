use actix::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use order_lifecycle::actors::{CoordinatorActor, Shutdown};
use order_lifecycle::cache::{RedisCache, VersionedCache};
use order_lifecycle::config::{AppConfig, LifecycleConfig};
use order_lifecycle::domain::catalog::Product;
use order_lifecycle::domain::order::{LineItem, Order, OrderService, ProductId};
use order_lifecycle::domain::refund::RefundRequest;
use order_lifecycle::metrics::{self, Metrics};
use order_lifecycle::store::{CatalogStore, MemoryStore, ScyllaStore};

#[actix::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default filter
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,order_lifecycle=debug"))
        )
        .init();

    tracing::info!("🚀 Starting order lifecycle service");

    let config = AppConfig::from_env()?;

    // === 1. Storage ===
    let store = Arc::new(ScyllaStore::connect(&config.scylla_nodes, &config.scylla_keyspace).await?);

    // === 2. Metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    let metrics_registry = Arc::new(metrics.registry().clone());
    let metrics_port = config.metrics_port;
    actix::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_registry, metrics_port).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    // === 3. Cache (Redis when configured) ===
    let redis = match &config.redis_url {
        Some(url) => Some(Arc::new(RedisCache::connect(url).await?)),
        None => None,
    };
    let cache = match &redis {
        Some(redis) => VersionedCache::new(redis.clone()),
        None => {
            tracing::info!("REDIS_URL not set, using in-process cache");
            VersionedCache::in_memory()
        }
    };

    // === 4. Order service ===
    let service = OrderService::builder(store.clone(), store.clone())
        .config(config.lifecycle.clone())
        .cache(cache)
        .metrics(metrics.clone())
        .build();

    // === 5. Background actors ===
    let mut coordinator = CoordinatorActor::new(service.clone()).with_metrics(metrics.clone());
    if let Some(redis) = redis {
        coordinator = coordinator.with_cache(redis);
    }
    let coordinator = coordinator.start();

    // === 6. Demo: pay, refund part, then mark refunded ===
    if config.run_demo {
        run_demo(config.lifecycle.clone()).await?;
    }

    tracing::info!("⏳ Running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    coordinator
        .send(Shutdown)
        .await?
        .map_err(|e| anyhow::anyhow!(e))?;
    tracing::info!("👋 Shutdown complete");

    Ok(())
}

/// Runs against its own in-memory store so no real order or product is touched
async fn run_demo(lifecycle: LifecycleConfig) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let service = OrderService::builder(store.clone(), store.clone()).config(lifecycle).build();

    let desk = ProductId(1);
    store.save_product(&Product::new(desk, "Standing desk").with_stock(10)).await?;

    let mut order = Order::checkout(chrono::Utc::now());
    order.add_item(LineItem::product(desk, "Standing desk", 1, Decimal::new(100, 0)));
    order.calculate_totals();
    let order = service.create_order(order).await?;
    tracing::info!("✅ Order created: {}", order.id);

    let paid = service.payment_complete(order.id, Some("demo-txn-1")).await?;
    tracing::info!("💳 Payment recorded: {:?}", paid);

    let partial = service
        .create_refund(RefundRequest::new(order.id, Decimal::new(30, 0)).with_reason("Scratched top"))
        .await?;
    tracing::info!("↩️  Refunded {} (remaining {})", -partial.refund.totals.total, partial.remaining);

    let update = service.update_status(order.id, "refunded", "Customer returned the desk").await?;
    if let Some(report) = &update.effects {
        tracing::info!("⚙️  Effects applied: {:?}", report.applied());
    }

    let total = service.total_refunded(order.id).await?;
    tracing::info!("🎉 Demo complete: order {} refunded {} in total", order.id, total);
    Ok(())
}
