use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::order::{CustomerRef, OrderId, ProductId};

// ============================================================================
// Catalog Records Touched by Order Effects
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadAsset {
    pub download_id: String,
    pub name: String,
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub sku: Option<String>,

    // Inventory
    pub manage_stock: bool,
    pub stock_quantity: i64,
    pub backorders_allowed: bool,
    pub total_sales: i64,

    // Delivery
    pub is_virtual: bool,
    pub downloadable: bool,
    #[serde(default)]
    pub downloads: Vec<DownloadAsset>,
    /// Downloads per purchased unit; None or <= 0 means unlimited
    pub download_limit: Option<i64>,
    /// Days of access after completion; None or <= 0 means no expiry
    pub download_expiry_days: Option<i64>,
}

impl Product {
    pub fn new(id: ProductId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            sku: None,
            manage_stock: false,
            stock_quantity: 0,
            backorders_allowed: false,
            total_sales: 0,
            is_virtual: false,
            downloadable: false,
            downloads: Vec::new(),
            download_limit: None,
            download_expiry_days: None,
        }
    }

    pub fn with_stock(mut self, quantity: i64) -> Self {
        self.manage_stock = true;
        self.stock_quantity = quantity;
        self
    }

    pub fn with_download(mut self, asset: DownloadAsset) -> Self {
        self.downloadable = true;
        self.is_virtual = true;
        self.downloads.push(asset);
        self
    }

    /// Name plus SKU, or the id when there is no SKU
    pub fn formatted_name(&self) -> String {
        match &self.sku {
            Some(sku) if !sku.is_empty() => format!("{} ({})", self.name, sku),
            _ => format!("{} (#{})", self.name, self.id),
        }
    }

    /// Whether buying this product needs no fulfilment beyond payment
    pub fn is_virtual_download(&self) -> bool {
        self.is_virtual && self.downloadable
    }

    pub fn downloads_remaining_for(&self, quantity: i64) -> Option<i64> {
        match self.download_limit {
            Some(limit) if limit > 0 => Some(limit * quantity.max(1)),
            _ => None,
        }
    }

    pub fn access_expires_from(&self, granted_from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.download_expiry_days {
            Some(days) if days > 0 => Some(granted_from + Duration::days(days)),
            _ => None,
        }
    }
}

/// Before/after stock levels for one atomic adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockChange {
    pub product_id: ProductId,
    pub before: i64,
    pub after: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub code: String,
    pub usage_count: i64,
    #[serde(default)]
    pub used_by: Vec<String>,
}

impl Coupon {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            usage_count: 0,
            used_by: Vec::new(),
        }
    }

    pub fn increase_usage(&mut self, identity: Option<&CustomerRef>) {
        self.usage_count += 1;
        if let Some(identity) = identity {
            self.used_by.push(identity.to_string());
        }
    }

    /// Never drops below zero; removes one matching `used_by` entry
    pub fn decrease_usage(&mut self, identity: Option<&CustomerRef>) {
        self.usage_count = (self.usage_count - 1).max(0);
        if let Some(identity) = identity {
            let identity = identity.to_string();
            if let Some(pos) = self.used_by.iter().position(|used| *used == identity) {
                self.used_by.remove(pos);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadPermission {
    pub download_id: String,
    pub product_id: ProductId,
    pub order_id: OrderId,
    pub user_id: Option<i64>,
    pub user_email: Option<String>,
    pub downloads_remaining: Option<i64>,
    pub access_granted: DateTime<Utc>,
    pub access_expires: Option<DateTime<Utc>>,
}

impl DownloadPermission {
    pub fn key(&self) -> (String, ProductId, OrderId) {
        (self.download_id.clone(), self.product_id, self.order_id)
    }
}
