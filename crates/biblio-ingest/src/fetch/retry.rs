//! Exponential backoff with jitter for fetch operations

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use super::FetchError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_JITTER: f64 = 0.25;

/// Final error after the policy gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryError {
    pub attempts: u32,
    pub last: FetchError,
}

#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fractional spread applied to each delay, `0.0..=1.0`
    pub jitter: f64,
    retryable: fn(&FetchError) -> bool,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_ATTEMPTS,
            Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        )
        .with_jitter(DEFAULT_JITTER)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: 0.0,
            retryable: FetchError::is_transient,
        }
    }

    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_retryable(mut self, predicate: fn(&FetchError) -> bool) -> Self {
        self.retryable = predicate;
        self
    }

    pub fn is_retryable(&self, error: &FetchError) -> bool {
        (self.retryable)(error)
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor).min(self.max_delay)
    }

    /// Run `operation` until success, a non-retryable error, or the attempt
    /// budget is spent. A server-provided retry-after wins over a shorter backoff.
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.max_attempts && self.is_retryable(&error) => {
                    let mut delay = self.jittered(self.backoff(attempt));
                    if let Some(requested) = error.retry_after() {
                        delay = delay.max(requested);
                    }
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient fetch failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return Err(RetryError {
                        attempts: attempt,
                        last: error,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(4, Duration::from_millis(100), Duration::from_millis(250))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(250));
        assert_eq!(p.backoff(40), Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let p = policy().with_jitter(0.5);
        for _ in 0..100 {
            let d = p.jittered(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_with_backoff() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let started = Instant::now();

        let result = policy()
            .run("fetch", move || async move {
                if calls_ref.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FetchError::Timeout)
                } else {
                    Ok("record")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "record");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(310));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_fails_immediately() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;

        let result: Result<(), _> = policy()
            .run("fetch", move || async move {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::InvalidIdentifier("abc".into()))
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(err.last, FetchError::InvalidIdentifier("abc".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts() {
        let result: Result<(), _> = policy()
            .run("fetch", || async { Err(FetchError::Status { status: 503, message: "busy".into() }) })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 4);
        assert!(err.last.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_overrides_short_backoff() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let started = Instant::now();

        policy()
            .run("fetch", move || async move {
                if calls_ref.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(FetchError::RateLimited {
                        retry_after: Some(Duration::from_secs(2)),
                    })
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_millis(2010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate() {
        let p = policy().with_retryable(|_| false);
        let result: Result<(), _> = p.run("fetch", || async { Err(FetchError::Timeout) }).await;
        assert_eq!(result.unwrap_err().attempts, 1);
    }
}
