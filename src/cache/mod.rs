use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

pub mod redis_cache;

pub use redis_cache::RedisCache;

// ============================================================================
// Versioned-Prefix Cache
// ============================================================================
//
// Every namespace has a version counter stored under `<ns>:version`. Keys are
// written as `<ns>:v<version>:<key>`, so bumping the counter orphans every
// key of the namespace at once. Readers always fetch the current version
// before building a key.
//
// ============================================================================

pub const ORDERS_NAMESPACE: &str = "orders";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Cache circuit open")]
    CircuitOpen,

    #[error("Cached value could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Minimal key/value contract of the backing cache
#[async_trait]
pub trait CacheService: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Atomic increment; a missing key counts from zero
    async fn incr(&self, key: &str) -> Result<i64, CacheError>;
}

#[derive(Clone)]
pub struct VersionedCache {
    backend: Arc<dyn CacheService>,
    ttl: Option<Duration>,
}

impl VersionedCache {
    pub fn new(backend: Arc<dyn CacheService>) -> Self {
        Self { backend, ttl: Some(Duration::from_secs(3600)) }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCache::new()))
    }

    fn version_key(namespace: &str) -> String {
        format!("{}:version", namespace)
    }

    pub async fn version(&self, namespace: &str) -> Result<i64, CacheError> {
        let raw = self.backend.get(&Self::version_key(namespace)).await?;
        Ok(raw.and_then(|value| value.parse().ok()).unwrap_or(0))
    }

    async fn versioned_key(&self, key: &str, namespace: &str) -> Result<String, CacheError> {
        let version = self.version(namespace).await?;
        Ok(format!("{}:v{}:{}", namespace, version, key))
    }

    pub async fn get(&self, key: &str, namespace: &str) -> Result<Option<String>, CacheError> {
        let full_key = self.versioned_key(key, namespace).await?;
        self.backend.get(&full_key).await
    }

    pub async fn set(&self, key: &str, value: &str, namespace: &str) -> Result<(), CacheError> {
        let full_key = self.versioned_key(key, namespace).await?;
        self.backend.set(&full_key, value, self.ttl).await
    }

    /// Invalidate every key of the namespace
    pub async fn bump_prefix(&self, namespace: &str) -> Result<i64, CacheError> {
        let version = self.backend.incr(&Self::version_key(namespace)).await?;
        tracing::debug!(namespace = %namespace, version = version, "Cache namespace bumped");
        Ok(version)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str, namespace: &str) -> Result<Option<T>, CacheError> {
        match self.get(key, namespace).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize + Sync>(&self, key: &str, value: &T, namespace: &str) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw, namespace).await
    }
}

// ============================================================================
// In-Process Backend
// ============================================================================

#[derive(Debug, Default, Clone)]
pub struct MemoryCache {
    map: Arc<RwLock<BTreeMap<String, (String, Option<Instant>)>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheService for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let read_guard = match self.map.read() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };
        Ok(read_guard.get(key).and_then(|(value, expires)| match expires {
            Some(at) if *at <= Instant::now() => None,
            _ => Some(value.clone()),
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        match self.map.write() {
            Ok(mut guard) => guard.insert(key.to_string(), (value.to_string(), expires)),
            Err(poison) => poison.into_inner().insert(key.to_string(), (value.to_string(), expires)),
        };
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        let mut guard = match self.map.write() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };
        let entry = guard.entry(key.to_string()).or_insert_with(|| ("0".to_string(), None));
        let next = entry.0.parse::<i64>().unwrap_or(0) + 1;
        entry.0 = next.to_string();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bump_prefix_invalidates_namespace() {
        let cache = VersionedCache::in_memory();

        cache.set("count:pending", "4", ORDERS_NAMESPACE).await.unwrap();
        cache.set("other", "x", "reports").await.unwrap();
        assert_eq!(cache.get("count:pending", ORDERS_NAMESPACE).await.unwrap().as_deref(), Some("4"));

        cache.bump_prefix(ORDERS_NAMESPACE).await.unwrap();

        assert_eq!(cache.get("count:pending", ORDERS_NAMESPACE).await.unwrap(), None);
        assert_eq!(cache.get("other", "reports").await.unwrap().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_json_values() {
        let cache = VersionedCache::in_memory();
        cache.set_json("refunded:7", &vec![1, 2, 3], ORDERS_NAMESPACE).await.unwrap();

        let cached: Option<Vec<i32>> = cache.get_json("refunded:7", ORDERS_NAMESPACE).await.unwrap();
        assert_eq!(cached, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_memory_entries_expire() {
        let backend = MemoryCache::new();
        backend.set("k", "v", Some(Duration::from_millis(10))).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_counts_from_zero() {
        let backend = MemoryCache::new();
        assert_eq!(backend.incr("v").await.unwrap(), 1);
        assert_eq!(backend.incr("v").await.unwrap(), 2);
    }
}
