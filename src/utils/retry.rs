use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

// ============================================================================
// Transient Failure Retry
// ============================================================================
//
// Store writes can fail for reasons that go away on their own (timeouts,
// unavailable replicas). Those errors report `is_transient() == true` and
// are retried with exponential backoff; anything else is returned at once.
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.multiplier).min(self.max_delay)
    }
}

#[derive(Debug)]
pub enum RetryResult<T, E> {
    Success(T),
    /// Still transient after the last attempt
    Failed(E),
    /// Not worth retrying
    PermanentFailure(E),
}

pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

/// Run `operation` until it succeeds, fails permanently, or runs out of attempts.
/// The closure receives the 1-based attempt number.
pub async fn retry_on_transient<F, Fut, T, E>(config: RetryConfig, mut operation: F) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display + IsTransient,
{
    let mut delay = config.initial_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return RetryResult::Success(value);
            }
            Err(error) => error,
        };

        if !error.is_transient() {
            tracing::debug!(attempt, error = %error, "Permanent failure, not retrying");
            return RetryResult::PermanentFailure(error);
        }
        if attempt >= config.max_attempts {
            tracing::error!(attempt, error = %error, "Operation failed after all retries");
            return RetryResult::Failed(error);
        }

        tracing::warn!(
            attempt,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "Transient failure, retrying after delay"
        );
        sleep(delay).await;
        delay = config.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum WriteError {
        Timeout,
        Rejected,
    }

    impl Display for WriteError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                WriteError::Timeout => write!(f, "write timed out"),
                WriteError::Rejected => write!(f, "write rejected"),
            }
        }
    }

    impl IsTransient for WriteError {
        fn is_transient(&self) -> bool {
            matches!(self, WriteError::Timeout)
        }
    }

    fn quick() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);

        let result = retry_on_transient(quick(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 { Err(WriteError::Timeout) } else { Ok(attempt) }
            }
        })
        .await;

        assert!(matches!(result, RetryResult::Success(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);

        let result = retry_on_transient(quick(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(WriteError::Timeout) }
        })
        .await;

        assert!(matches!(result, RetryResult::Failed(WriteError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let calls = AtomicU32::new(0);

        let result = retry_on_transient(quick(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(WriteError::Rejected) }
        })
        .await;

        assert!(matches!(result, RetryResult::PermanentFailure(WriteError::Rejected)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_is_capped() {
        let config = quick();
        assert_eq!(config.next_delay(Duration::from_millis(1)), Duration::from_millis(2));
        assert_eq!(config.next_delay(Duration::from_millis(3)), Duration::from_millis(4));
    }
}
