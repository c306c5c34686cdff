use std::collections::BTreeMap;

// ============================================================================
// Order Type Registry
// ============================================================================
//
// Built once at start-up, then shared read-only behind an Arc and passed to
// whatever builds order queries.
//
// ============================================================================

pub const SHOP_ORDER: &str = "shop_order";
pub const SHOP_ORDER_REFUND: &str = "shop_order_refund";

/// Concrete aggregate shape behind an order type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Order,
    Refund,
}

/// Subsystems that can include or exclude an order type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderTypeCapability {
    Counts,
    Views,
    Reports,
    SalesReports,
    Webhooks,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTypeSpec {
    pub kind: OrderKind,
    pub in_counts: bool,
    pub in_views: bool,
    pub in_reports: bool,
    pub in_sales_reports: bool,
    pub in_webhooks: bool,
}

impl OrderTypeSpec {
    pub fn order() -> Self {
        Self {
            kind: OrderKind::Order,
            in_counts: true,
            in_views: true,
            in_reports: true,
            in_sales_reports: true,
            in_webhooks: true,
        }
    }

    pub fn refund() -> Self {
        Self {
            kind: OrderKind::Refund,
            in_counts: false,
            in_views: false,
            in_reports: true,
            in_sales_reports: false,
            in_webhooks: false,
        }
    }

    pub fn has(&self, capability: OrderTypeCapability) -> bool {
        match capability {
            OrderTypeCapability::Counts => self.in_counts,
            OrderTypeCapability::Views => self.in_views,
            OrderTypeCapability::Reports => self.in_reports,
            OrderTypeCapability::SalesReports => self.in_sales_reports,
            OrderTypeCapability::Webhooks => self.in_webhooks,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrderTypeRegistry {
    types: BTreeMap<String, OrderTypeSpec>,
}

impl OrderTypeRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the standard order and refund types
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(SHOP_ORDER, OrderTypeSpec::order());
        registry.register(SHOP_ORDER_REFUND, OrderTypeSpec::refund());
        registry
    }

    /// Returns false, leaving the existing entry untouched, if the name is taken
    pub fn register(&mut self, name: impl Into<String>, spec: OrderTypeSpec) -> bool {
        let name = name.into();
        if name.is_empty() || self.types.contains_key(&name) {
            tracing::debug!(order_type = %name, "Order type already registered or invalid");
            return false;
        }
        self.types.insert(name, spec);
        true
    }

    pub fn get(&self, name: &str) -> Option<&OrderTypeSpec> {
        self.types.get(name)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn kind_of(&self, name: &str) -> Option<OrderKind> {
        self.types.get(name).map(|spec| spec.kind)
    }

    pub fn all(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }

    pub fn with_capability(&self, capability: OrderTypeCapability) -> Vec<String> {
        self.types
            .iter()
            .filter(|(_, spec)| spec.has(capability))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn of_kind(&self, kind: OrderKind) -> Vec<String> {
        self.types
            .iter()
            .filter(|(_, spec)| spec.kind == kind)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Type name used when creating refunds
    pub fn refund_type(&self) -> &str {
        self.types
            .iter()
            .find(|(_, spec)| spec.kind == OrderKind::Refund)
            .map(|(name, _)| name.as_str())
            .unwrap_or(SHOP_ORDER_REFUND)
    }
}
