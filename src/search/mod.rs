use futures_util::future::try_join_all;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::SearchConfig;
use crate::domain::order::{OrderError, OrderId, OrderTypeCapability, OrderTypeRegistry};
use crate::store::{OrderStore, SearchClause};

pub mod like;

pub use like::{escape_like, LikePattern};

// ============================================================================
// Order Search
// ============================================================================
//
// A term is matched as `%term%` against:
// - the configured order meta fields
// - billing and shipping "first last" names
// - line item names
//
// An all-digit term also matches the order with that id, and then only the
// meta fields are searched besides it.
//
// ============================================================================

/// Clauses evaluated for a term
pub fn build_clauses(config: &SearchConfig, numeric: bool) -> Vec<SearchClause> {
    let mut clauses = Vec::new();
    if !config.fields.is_empty() {
        clauses.push(SearchClause::MetaLike { keys: config.fields.clone() });
    }
    if numeric {
        return clauses;
    }

    for prefix in ["_billing", "_shipping"] {
        clauses.push(SearchClause::FullNameLike {
            first_key: format!("{}_first_name", prefix),
            last_key: format!("{}_last_name", prefix),
        });
    }
    clauses.push(SearchClause::ItemNameLike);
    clauses
}

fn is_numeric(term: &str) -> bool {
    !term.is_empty() && term.bytes().all(|b| b.is_ascii_digit())
}

#[derive(Clone)]
pub struct OrderSearch {
    orders: Arc<dyn OrderStore>,
    order_types: Arc<OrderTypeRegistry>,
    config: SearchConfig,
}

impl OrderSearch {
    pub fn new(orders: Arc<dyn OrderStore>, order_types: Arc<OrderTypeRegistry>, config: SearchConfig) -> Self {
        Self { orders, order_types, config }
    }

    pub async fn search(&self, term: &str) -> Result<BTreeSet<OrderId>, OrderError> {
        let term = term.trim();
        if term.is_empty() {
            return Ok(BTreeSet::new());
        }

        let numeric = is_numeric(term);
        let mut ids = BTreeSet::new();

        if numeric {
            if let Ok(id) = term.parse::<i64>() {
                let id = OrderId(id);
                if id.is_saved() && self.orders.exists(id).await? {
                    ids.insert(id);
                }
            }
        }

        let pattern = LikePattern::containing(term, self.config.escape_wildcards, self.config.case_insensitive);
        let order_types = self.order_types.with_capability(OrderTypeCapability::Views);
        let clauses = build_clauses(&self.config, numeric);

        let matches = try_join_all(
            clauses
                .iter()
                .map(|clause| self.orders.ids_matching(clause, &pattern, &order_types)),
        )
        .await?;
        ids.extend(matches.into_iter().flatten());

        tracing::debug!(term = %term, pattern = %pattern.as_str(), results = ids.len(), "Order search");
        Ok(ids)
    }
}
