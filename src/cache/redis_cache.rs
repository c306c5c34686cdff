use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use std::time::Duration;

use super::{CacheError, CacheService};
use crate::utils::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};

// ============================================================================
// Redis Cache Backend
// ============================================================================
//
// Every command goes through a circuit breaker: once Redis keeps failing,
// calls fail fast with `CacheError::CircuitOpen` and callers fall back to
// computing values from the store.
//
// ============================================================================

pub struct RedisCache {
    connection: MultiplexedConnection,
    circuit_breaker: CircuitBreaker,
}

impl RedisCache {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;

        tracing::info!(url = %url, "Connected to Redis cache");

        let circuit_breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            success_threshold: 2,
        });

        Ok(Self { connection, circuit_breaker })
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state().await
    }
}

fn map_breaker_error(err: CircuitBreakerError<RedisError>) -> CacheError {
    match err {
        CircuitBreakerError::CircuitOpen => CacheError::CircuitOpen,
        CircuitBreakerError::OperationFailed(e) => CacheError::Backend(e.to_string()),
    }
}

#[async_trait]
impl CacheService for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection.clone();
        self.circuit_breaker
            .call(async move { conn.get::<_, Option<String>>(key).await })
            .await
            .map_err(map_breaker_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        self.circuit_breaker
            .call(async move {
                match ttl {
                    Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await,
                    None => conn.set::<_, _, ()>(key, value).await,
                }
            })
            .await
            .map_err(map_breaker_error)
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.connection.clone();
        self.circuit_breaker
            .call(async move { conn.incr::<_, _, i64>(key, 1).await })
            .await
            .map_err(map_breaker_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::ErrorKind;

    #[test]
    fn test_breaker_errors_map_to_cache_errors() {
        assert!(matches!(
            map_breaker_error(CircuitBreakerError::CircuitOpen),
            CacheError::CircuitOpen
        ));

        let io = RedisError::from((ErrorKind::IoError, "connection reset"));
        assert!(matches!(
            map_breaker_error(CircuitBreakerError::OperationFailed(io)),
            CacheError::Backend(_)
        ));
    }
}
