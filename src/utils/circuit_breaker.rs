use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

// ============================================================================
// Circuit Breaker
// ============================================================================
//
// Wraps calls to an optional backend (the Redis cache) so an outage turns
// into fast `CircuitOpen` errors instead of a timeout per request.
//
//   Closed   --failure_threshold consecutive failures-->  Open
//   Open     --cooldown elapsed, next call admitted---->  HalfOpen
//   HalfOpen --success_threshold successes------------->  Closed
//   HalfOpen --any failure----------------------------->  Open
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn label(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe call is let through
    pub cooldown: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn closed() -> Self {
        Self { state: CircuitState::Closed, failures: 0, successes: 0, opened_at: None }
    }

    fn admit(&mut self, cooldown: Duration) -> bool {
        if self.state != CircuitState::Open {
            return true;
        }
        match self.opened_at {
            Some(at) if at.elapsed() < cooldown => false,
            _ => {
                tracing::info!("Circuit breaker half-open, probing backend");
                self.state = CircuitState::HalfOpen;
                self.successes = 0;
                true
            }
        }
    }

    fn succeeded(&mut self, config: &CircuitBreakerConfig) {
        match self.state {
            CircuitState::HalfOpen => {
                self.successes += 1;
                if self.successes >= config.success_threshold {
                    tracing::info!(successes = self.successes, "Circuit breaker closed");
                    *self = Breaker::closed();
                }
            }
            _ => self.failures = 0,
        }
    }

    fn failed(&mut self, config: &CircuitBreakerConfig) {
        self.failures += 1;
        let trip = match self.state {
            CircuitState::Closed => self.failures >= config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if trip {
            tracing::warn!(failures = self.failures, "Circuit breaker opened");
            self.state = CircuitState::Open;
            self.successes = 0;
            self.opened_at = Some(Instant::now());
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Mutex<Breaker>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { inner: Arc::new(Mutex::new(Breaker::closed())), config }
    }

    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.inner.lock().await.admit(self.config.cooldown) {
            return Err(CircuitBreakerError::CircuitOpen);
        }

        let result = operation.await;

        let mut breaker = self.inner.lock().await;
        match result {
            Ok(value) => {
                breaker.succeeded(&self.config);
                Ok(value)
            }
            Err(e) => {
                breaker.failed(&self.config);
                Err(CircuitBreakerError::OperationFailed(e))
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }
}

#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    CircuitOpen,
    OperationFailed(E),
}

impl<E: fmt::Display> fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen => write!(f, "circuit breaker is open"),
            CircuitBreakerError::OperationFailed(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error> std::error::Error for CircuitBreakerError<E> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: u32, cooldown_ms: u64, successes: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: failures,
            cooldown: Duration::from_millis(cooldown_ms),
            success_threshold: successes,
        })
    }

    async fn fail(cb: &CircuitBreaker) {
        let _ = cb.call(async { Err::<(), _>("redis down") }).await;
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures() {
        let cb = breaker(3, 60_000, 1);

        fail(&cb).await;
        fail(&cb).await;
        // A success in between resets the streak
        cb.call(async { Ok::<_, &str>(()) }).await.unwrap();
        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Closed);

        fail(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Open);

        let blocked = cb.call(async { Ok::<_, &str>(()) }).await;
        assert!(matches!(blocked, Err(CircuitBreakerError::CircuitOpen)));
    }

    #[tokio::test]
    async fn test_probe_after_cooldown_closes_circuit() {
        let cb = breaker(1, 20, 2);
        fail(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;

        cb.call(async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        cb.call(async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens() {
        let cb = breaker(1, 20, 2);
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        fail(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(matches!(
            cb.call(async { Ok::<_, &str>(()) }).await,
            Err(CircuitBreakerError::CircuitOpen)
        ));
    }
}
