use async_trait::async_trait;
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::response::query_result::QueryResult;
use scylla::serialize::value::SerializeValue;
use scylla::value::{CqlValue, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{CatalogStore, OrderFilter, OrderStore, Page, SearchClause, StoreError};
use crate::domain::catalog::{Coupon, DownloadPermission, Product, StockChange};
use crate::domain::order::{CustomerRef, ItemId, Order, OrderId, ProductId};
use crate::search::like::LikePattern;

// ============================================================================
// ScyllaDB Store
// ============================================================================
//
// Orders, products and coupons are stored as JSON documents next to the
// columns queries need. Counters (ids, stock, sales, coupon usage) are
// updated with lightweight transactions in a compare-and-set loop so
// concurrent writers never lose an increment.
//
// ============================================================================

const CAS_ATTEMPTS: u32 = 16;

const ORDER_SEQUENCE: &str = "order_id";
const ITEM_SEQUENCE: &str = "order_item_id";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS orders (
        id bigint PRIMARY KEY,
        order_type text,
        status text,
        parent_id bigint,
        created_at timestamp,
        modified_at timestamp,
        payload text
    )",
    "CREATE TABLE IF NOT EXISTS line_item_index (
        item_id bigint PRIMARY KEY,
        order_id bigint
    )",
    "CREATE TABLE IF NOT EXISTS products (
        id bigint PRIMARY KEY,
        payload text
    )",
    "CREATE TABLE IF NOT EXISTS coupons (
        code text PRIMARY KEY,
        payload text
    )",
    "CREATE TABLE IF NOT EXISTS download_permissions (
        order_id bigint,
        download_id text,
        product_id bigint,
        payload text,
        PRIMARY KEY (order_id, download_id, product_id)
    )",
    "CREATE TABLE IF NOT EXISTS id_sequences (
        name text PRIMARY KEY,
        value bigint
    )",
    "CREATE TABLE IF NOT EXISTS leases (
        name text PRIMARY KEY,
        holder uuid
    )",
];

fn unavailable<E: std::fmt::Display>(err: E) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// Read the `[applied]` column of a lightweight-transaction result
fn applied(result: QueryResult) -> Result<bool, StoreError> {
    let rows = result.into_rows_result().map_err(unavailable)?;
    let row: Row = rows.first_row().map_err(unavailable)?;
    Ok(matches!(row.columns.first(), Some(Some(CqlValue::Boolean(true)))))
}

pub struct ScyllaStore {
    session: Arc<Session>,
}

impl ScyllaStore {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Connect, create the keyspace and tables when missing, and switch to the keyspace
    pub async fn connect(nodes: &[String], keyspace: &str) -> anyhow::Result<Self> {
        tracing::info!(nodes = ?nodes, keyspace = %keyspace, "Connecting to ScyllaDB");

        let session: Session = SessionBuilder::new().known_nodes(nodes).build().await?;

        session
            .query_unpaged(
                format!(
                    "CREATE KEYSPACE IF NOT EXISTS {} WITH REPLICATION = \
                     {{'class': 'SimpleStrategy', 'replication_factor': 1}}",
                    keyspace
                ),
                &[],
            )
            .await?;
        session.use_keyspace(keyspace, false).await?;

        for statement in SCHEMA {
            session.query_unpaged(*statement, &[]).await?;
        }

        Ok(Self::new(Arc::new(session)))
    }

    pub fn session(&self) -> Arc<Session> {
        self.session.clone()
    }

    async fn next_id(&self, sequence: &str) -> Result<i64, StoreError> {
        for _ in 0..CAS_ATTEMPTS {
            let current = self
                .session
                .query_unpaged("SELECT value FROM id_sequences WHERE name = ?", (sequence,))
                .await
                .map_err(unavailable)?
                .into_rows_result()
                .map_err(unavailable)?
                .maybe_first_row::<(i64,)>()
                .map_err(unavailable)?
                .map(|(value,)| value);

            let result = match current {
                None => self
                    .session
                    .query_unpaged(
                        "INSERT INTO id_sequences (name, value) VALUES (?, ?) IF NOT EXISTS",
                        (sequence, 1_i64),
                    )
                    .await
                    .map_err(unavailable)?,
                Some(value) => self
                    .session
                    .query_unpaged(
                        "UPDATE id_sequences SET value = ? WHERE name = ? IF value = ?",
                        (value + 1, sequence, value),
                    )
                    .await
                    .map_err(unavailable)?,
            };

            if applied(result)? {
                return Ok(current.unwrap_or(0) + 1);
            }
        }

        Err(StoreError::Conflict(format!("id sequence {} is contended", sequence)))
    }

    async fn read_document<K, T>(&self, table: &str, key_column: &str, key: K) -> Result<Option<(String, T)>, StoreError>
    where
        K: SerializeValue + Send + Sync,
        T: DeserializeOwned + Send,
    {
        let payload = self
            .session
            .query_unpaged(format!("SELECT payload FROM {} WHERE {} = ?", table, key_column), (key,))
            .await
            .map_err(unavailable)?
            .into_rows_result()
            .map_err(unavailable)?
            .maybe_first_row::<(String,)>()
            .map_err(unavailable)?;

        match payload {
            Some((raw,)) => {
                let document = serde_json::from_str(&raw)?;
                Ok(Some((raw, document)))
            }
            None => Ok(None),
        }
    }

    /// Read-modify-write a JSON document guarded by `IF payload = <previous>`
    async fn compare_and_set<K, T, R, F>(
        &self,
        table: &str,
        key_column: &str,
        key: K,
        mut mutate: F,
    ) -> Result<Option<R>, StoreError>
    where
        K: SerializeValue + Clone + Send + Sync,
        T: Serialize + DeserializeOwned + Send,
        R: Send,
        F: FnMut(&mut T) -> R + Send,
    {
        let update = format!("UPDATE {} SET payload = ? WHERE {} = ? IF payload = ?", table, key_column);

        for _ in 0..CAS_ATTEMPTS {
            let Some((previous, mut document)) = self.read_document::<K, T>(table, key_column, key.clone()).await?
            else {
                return Ok(None);
            };

            let outcome = mutate(&mut document);
            let next = serde_json::to_string(&document)?;

            let result = self
                .session
                .query_unpaged(update.as_str(), (next, key.clone(), previous))
                .await
                .map_err(unavailable)?;
            if applied(result)? {
                return Ok(Some(outcome));
            }
        }

        Err(StoreError::Conflict(format!("{} row is contended", table)))
    }

    async fn all_orders(&self) -> Result<Vec<Order>, StoreError> {
        let rows_result = self
            .session
            .query_unpaged("SELECT payload FROM orders", &[])
            .await
            .map_err(unavailable)?
            .into_rows_result()
            .map_err(unavailable)?;

        let mut orders = Vec::new();
        for row in rows_result.rows::<(String,)>().map_err(unavailable)? {
            let (payload,) = row.map_err(unavailable)?;
            orders.push(serde_json::from_str(&payload)?);
        }
        Ok(orders)
    }
}

#[async_trait]
impl OrderStore for ScyllaStore {
    async fn find(&self, filter: &OrderFilter) -> Result<Page<Order>, StoreError> {
        let matching = self
            .all_orders()
            .await?
            .into_iter()
            .filter(|order| filter.matches(order))
            .collect();
        Ok(filter.paginate(matching))
    }

    async fn load(&self, id: OrderId) -> Result<Order, StoreError> {
        self.read_document::<i64, Order>("orders", "id", id.0)
            .await?
            .map(|(_, order)| order)
            .ok_or_else(|| StoreError::order_not_found(id))
    }

    async fn save(&self, order: &mut Order) -> Result<OrderId, StoreError> {
        if !order.id.is_saved() {
            order.id = OrderId(self.next_id(ORDER_SEQUENCE).await?);
        }

        let mut fresh_ids = Vec::new();
        while fresh_ids.len() < order.items.iter().filter(|item| !item.id.is_saved()).count() {
            fresh_ids.push(ItemId(self.next_id(ITEM_SEQUENCE).await?));
        }
        let mut fresh_ids = fresh_ids.into_iter();
        order.items.assign_ids(|| fresh_ids.next().unwrap_or(ItemId::UNSAVED));

        for item_id in order.items.item_ids() {
            self.session
                .query_unpaged(
                    "INSERT INTO line_item_index (item_id, order_id) VALUES (?, ?)",
                    (item_id.0, order.id.0),
                )
                .await
                .map_err(unavailable)?;
        }

        let payload = serde_json::to_string(&*order)?;
        self.session
            .query_unpaged(
                "INSERT INTO orders (id, order_type, status, parent_id, created_at, modified_at, payload)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                (
                    order.id.0,
                    &order.order_type,
                    order.status.slug(),
                    order.parent_id.map(|parent| parent.0),
                    order.created_at,
                    order.modified_at,
                    payload,
                ),
            )
            .await
            .map_err(unavailable)?;

        tracing::debug!(order_id = %order.id, status = %order.status, "Order saved");
        Ok(order.id)
    }

    async fn exists(&self, id: OrderId) -> Result<bool, StoreError> {
        let row = self
            .session
            .query_unpaged("SELECT id FROM orders WHERE id = ?", (id.0,))
            .await
            .map_err(unavailable)?
            .into_rows_result()
            .map_err(unavailable)?
            .maybe_first_row::<(i64,)>()
            .map_err(unavailable)?;
        Ok(row.is_some())
    }

    async fn order_for_item(&self, item: ItemId) -> Result<Option<OrderId>, StoreError> {
        let row = self
            .session
            .query_unpaged("SELECT order_id FROM line_item_index WHERE item_id = ?", (item.0,))
            .await
            .map_err(unavailable)?
            .into_rows_result()
            .map_err(unavailable)?
            .maybe_first_row::<(i64,)>()
            .map_err(unavailable)?;
        Ok(row.map(|(order_id,)| OrderId(order_id)))
    }

    async fn ids_matching(
        &self,
        clause: &SearchClause,
        pattern: &LikePattern,
        order_types: &[String],
    ) -> Result<Vec<OrderId>, StoreError> {
        Ok(self
            .all_orders()
            .await?
            .into_iter()
            .filter(|order| order_types.is_empty() || order_types.contains(&order.order_type))
            .filter(|order| clause.matches(order, pattern))
            .map(|order| order.id)
            .collect())
    }

    async fn try_acquire_lease(&self, name: &str, holder: Uuid, ttl: Duration) -> Result<bool, StoreError> {
        let ttl_secs = ttl.as_secs().clamp(1, i32::MAX as u64) as i32;

        let inserted = self
            .session
            .query_unpaged(
                "INSERT INTO leases (name, holder) VALUES (?, ?) IF NOT EXISTS USING TTL ?",
                (name, holder, ttl_secs),
            )
            .await
            .map_err(unavailable)?;
        if applied(inserted)? {
            return Ok(true);
        }

        // Already ours: extend it
        let renewed = self
            .session
            .query_unpaged(
                "UPDATE leases USING TTL ? SET holder = ? WHERE name = ? IF holder = ?",
                (ttl_secs, holder, name, holder),
            )
            .await
            .map_err(unavailable)?;
        applied(renewed)
    }

    async fn release_lease(&self, name: &str, holder: Uuid) -> Result<(), StoreError> {
        self.session
            .query_unpaged("DELETE FROM leases WHERE name = ? IF holder = ?", (name, holder))
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for ScyllaStore {
    async fn product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self
            .read_document::<i64, Product>("products", "id", id.0)
            .await?
            .map(|(_, product)| product))
    }

    async fn save_product(&self, product: &Product) -> Result<(), StoreError> {
        self.session
            .query_unpaged(
                "INSERT INTO products (id, payload) VALUES (?, ?)",
                (product.id.0, serde_json::to_string(product)?),
            )
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn adjust_stock(&self, id: ProductId, delta: i64) -> Result<StockChange, StoreError> {
        self.compare_and_set("products", "id", id.0, |product: &mut Product| {
            let before = product.stock_quantity;
            product.stock_quantity += delta;
            StockChange { product_id: id, before, after: product.stock_quantity }
        })
        .await?
        .ok_or_else(|| StoreError::product_not_found(id))
    }

    async fn record_sales(&self, id: ProductId, quantity: i64) -> Result<i64, StoreError> {
        self.compare_and_set("products", "id", id.0, |product: &mut Product| {
            product.total_sales += quantity;
            product.total_sales
        })
        .await?
        .ok_or_else(|| StoreError::product_not_found(id))
    }

    async fn coupon(&self, code: &str) -> Result<Option<Coupon>, StoreError> {
        Ok(self
            .read_document::<String, Coupon>("coupons", "code", code.trim().to_lowercase())
            .await?
            .map(|(_, coupon)| coupon))
    }

    async fn save_coupon(&self, coupon: &Coupon) -> Result<(), StoreError> {
        self.session
            .query_unpaged(
                "INSERT INTO coupons (code, payload) VALUES (?, ?)",
                (coupon.code.trim().to_lowercase(), serde_json::to_string(coupon)?),
            )
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn update_coupon_usage(
        &self,
        code: &str,
        identity: Option<&CustomerRef>,
        increase: bool,
    ) -> Result<Option<i64>, StoreError> {
        let identity = identity.cloned();
        self.compare_and_set("coupons", "code", code.trim().to_lowercase(), |coupon: &mut Coupon| {
            if increase {
                coupon.increase_usage(identity.as_ref());
            } else {
                coupon.decrease_usage(identity.as_ref());
            }
            coupon.usage_count
        })
        .await
    }

    async fn grant_download(&self, permission: DownloadPermission) -> Result<bool, StoreError> {
        let result = self
            .session
            .query_unpaged(
                "INSERT INTO download_permissions (order_id, download_id, product_id, payload)
                 VALUES (?, ?, ?, ?) IF NOT EXISTS",
                (
                    permission.order_id.0,
                    &permission.download_id,
                    permission.product_id.0,
                    serde_json::to_string(&permission)?,
                ),
            )
            .await
            .map_err(unavailable)?;
        applied(result)
    }

    async fn download_permissions(&self, order_id: OrderId) -> Result<Vec<DownloadPermission>, StoreError> {
        let rows_result = self
            .session
            .query_unpaged("SELECT payload FROM download_permissions WHERE order_id = ?", (order_id.0,))
            .await
            .map_err(unavailable)?
            .into_rows_result()
            .map_err(unavailable)?;

        let mut permissions = Vec::new();
        for row in rows_result.rows::<(String,)>().map_err(unavailable)? {
            let (payload,) = row.map_err(unavailable)?;
            permissions.push(serde_json::from_str(&payload)?);
        }
        Ok(permissions)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
