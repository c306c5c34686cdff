use anyhow::Context;
use std::str::FromStr;

use crate::domain::order::TransitionPolicy;

// ============================================================================
// Configuration
// ============================================================================
//
// `AppConfig::from_env` reads the process environment (after loading `.env`
// when present). `LifecycleConfig` carries the store policy knobs and is
// built directly in tests.
//
// ============================================================================

pub const DEFAULT_SEARCH_FIELDS: [&str; 4] = [
    "_billing_address_index",
    "_shipping_address_index",
    "_billing_last_name",
    "_billing_email",
];

#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    /// Order meta keys matched against the search term
    pub fields: Vec<String>,
    /// Treat `%` and `_` in the term literally
    pub escape_wildcards: bool,
    pub case_insensitive: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            fields: DEFAULT_SEARCH_FIELDS.iter().map(|f| f.to_string()).collect(),
            escape_wildcards: false,
            case_insensitive: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleConfig {
    pub manage_stock: bool,
    /// Minutes an unpaid checkout order holds stock; 0 disables the reaper
    pub hold_stock_minutes: u64,
    /// Grant downloads on `processing`, not only on `completed`
    pub grant_download_access_after_payment: bool,
    pub transition_policy: TransitionPolicy,
    pub search: SearchConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            manage_stock: true,
            hold_stock_minutes: 60,
            grant_download_access_after_payment: true,
            transition_policy: TransitionPolicy::Permissive,
            search: SearchConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub scylla_nodes: Vec<String>,
    pub scylla_keyspace: String,
    /// Memory cache when unset
    pub redis_url: Option<String>,
    pub metrics_port: u16,
    /// Walk a sample order through payment and refund on startup, in a
    /// throwaway in-memory store
    pub run_demo: bool,
    pub lifecycle: LifecycleConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = LifecycleConfig::default();

        let scylla_nodes = lookup("SCYLLA_NODES")
            .map(|nodes| split_list(&nodes))
            .filter(|nodes| !nodes.is_empty())
            .unwrap_or_else(|| vec!["127.0.0.1:9042".to_string()]);

        let search_fields = lookup("ORDER_SEARCH_FIELDS")
            .map(|fields| split_list(&fields))
            .filter(|fields| !fields.is_empty())
            .unwrap_or(defaults.search.fields);

        let strict = parse_flag(&lookup, "STRICT_STATUS_TRANSITIONS", false)?;

        Ok(Self {
            scylla_nodes,
            scylla_keyspace: lookup("SCYLLA_KEYSPACE").unwrap_or_else(|| "orders_ks".to_string()),
            redis_url: lookup("REDIS_URL").filter(|url| !url.trim().is_empty()),
            metrics_port: parse_var(&lookup, "METRICS_PORT", 9090)?,
            run_demo: parse_flag(&lookup, "RUN_DEMO", false)?,
            lifecycle: LifecycleConfig {
                manage_stock: parse_flag(&lookup, "MANAGE_STOCK", defaults.manage_stock)?,
                hold_stock_minutes: parse_var(&lookup, "HOLD_STOCK_MINUTES", defaults.hold_stock_minutes)?,
                grant_download_access_after_payment: parse_flag(
                    &lookup,
                    "DOWNLOADS_GRANT_ACCESS_AFTER_PAYMENT",
                    defaults.grant_download_access_after_payment,
                )?,
                transition_policy: if strict { TransitionPolicy::Strict } else { TransitionPolicy::Permissive },
                search: SearchConfig {
                    fields: search_fields,
                    escape_wildcards: parse_flag(&lookup, "ORDER_SEARCH_ESCAPE_WILDCARDS", false)?,
                    case_insensitive: true,
                },
            },
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

/// Accepts true/false, yes/no, on/off and 1/0
fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> anyhow::Result<bool> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => anyhow::bail!("invalid value for {}: {:?}", key, raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let config = AppConfig::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.scylla_nodes, vec!["127.0.0.1:9042"]);
        assert_eq!(config.scylla_keyspace, "orders_ks");
        assert_eq!(config.redis_url, None);
        assert_eq!(config.metrics_port, 9090);
        assert!(!config.run_demo);
        assert_eq!(config.lifecycle, LifecycleConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("SCYLLA_NODES", "10.0.0.1:9042, 10.0.0.2:9042"),
            ("HOLD_STOCK_MINUTES", "15"),
            ("MANAGE_STOCK", "no"),
            ("STRICT_STATUS_TRANSITIONS", "yes"),
            ("ORDER_SEARCH_FIELDS", "_billing_email,_billing_phone"),
            ("ORDER_SEARCH_ESCAPE_WILDCARDS", "true"),
            ("RUN_DEMO", "on"),
        ]))
        .unwrap();

        assert_eq!(config.scylla_nodes.len(), 2);
        assert_eq!(config.lifecycle.hold_stock_minutes, 15);
        assert!(!config.lifecycle.manage_stock);
        assert_eq!(config.lifecycle.transition_policy, TransitionPolicy::Strict);
        assert_eq!(config.lifecycle.search.fields, vec!["_billing_email", "_billing_phone"]);
        assert!(config.lifecycle.search.escape_wildcards);
        assert!(config.run_demo);
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let result = AppConfig::from_lookup(lookup_from(&[("METRICS_PORT", "ninety")]));
        assert!(result.is_err());
    }
}
