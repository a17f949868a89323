//! Request-budgeted, retrying front end for a [`RecordSource`].

use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::debug;

use super::{FetchError, RawRecord, RecordSource, RetryError, RetryPolicy, SearchPage};
use crate::error::{IngestError, IngestResult};

/// E-utilities quota without an API key
pub const ANONYMOUS_REQUESTS_PER_SECOND: u32 = 3;
/// E-utilities quota with an API key
pub const KEYED_REQUESTS_PER_SECOND: u32 = 10;

/// Every attempt (including retries) takes one token from a shared bucket
/// before it reaches the source.
pub struct RateLimitedFetchClient {
    source: Arc<dyn RecordSource>,
    limiter: DefaultDirectRateLimiter,
    policy: RetryPolicy,
}

impl RateLimitedFetchClient {
    pub fn new(source: Arc<dyn RecordSource>, requests_per_second: NonZeroU32, policy: RetryPolicy) -> Self {
        Self {
            source,
            limiter: RateLimiter::direct(Quota::per_second(requests_per_second)),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn fetch(&self, identifier: &str) -> IngestResult<RawRecord> {
        let source = self.source.as_ref();
        self.call("fetch_record", identifier, move || source.fetch_record(identifier))
            .await
    }

    pub async fn fetch_reference_ids(&self, identifier: &str) -> IngestResult<Vec<String>> {
        let source = self.source.as_ref();
        self.call("fetch_reference_ids", identifier, move || {
            source.fetch_reference_ids(identifier)
        })
        .await
    }

    pub async fn fetch_fulltext(&self, pmc_id: &str) -> IngestResult<RawRecord> {
        let source = self.source.as_ref();
        self.call("fetch_fulltext", pmc_id, move || source.fetch_fulltext(pmc_id))
            .await
    }

    pub async fn search(&self, term: &str, offset: u64, limit: u32) -> IngestResult<SearchPage> {
        let source = self.source.as_ref();
        self.call("search", term, move || source.search(term, offset, limit))
            .await
    }

    async fn call<T, F, Fut>(&self, operation: &str, identifier: &str, mut request: F) -> IngestResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let limiter = &self.limiter;
        let result = self
            .policy
            .run(operation, || {
                let attempt = request();
                async move {
                    limiter.until_ready().await;
                    attempt.await
                }
            })
            .await;

        result.map_err(|RetryError { attempts, last }| {
            debug!(operation, identifier, attempts, error = %last, "Fetch failed");
            if last.is_transient() {
                IngestError::TransientFetch {
                    identifier: identifier.to_string(),
                    attempts,
                    source: last,
                }
            } else {
                IngestError::PermanentFetch {
                    identifier: identifier.to_string(),
                    source: last,
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    /// Fails the first `failures` fetches with the given error.
    struct FlakySource {
        failures: u32,
        error: FetchError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RecordSource for FlakySource {
        async fn search(&self, _term: &str, _offset: u64, _limit: u32) -> Result<SearchPage, FetchError> {
            Ok(SearchPage::default())
        }

        async fn fetch_record(&self, identifier: &str) -> Result<RawRecord, FetchError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(self.error.clone());
            }
            Ok(RawRecord {
                identifier: identifier.to_string(),
                payload: "<PubmedArticleSet/>".to_string(),
            })
        }

        async fn fetch_reference_ids(&self, _identifier: &str) -> Result<Vec<String>, FetchError> {
            Ok(vec!["1".to_string()])
        }
    }

    fn client(source: Arc<FlakySource>, rps: u32) -> RateLimitedFetchClient {
        RateLimitedFetchClient::new(
            source,
            NonZeroU32::new(rps).unwrap(),
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
        )
    }

    #[tokio::test]
    async fn test_transient_failures_recover() {
        let source = Arc::new(FlakySource {
            failures: 2,
            error: FetchError::Status { status: 503, message: "unavailable".into() },
            calls: AtomicU32::new(0),
        });
        let record = client(source.clone(), 100).fetch("123").await.unwrap();
        assert_eq!(record.identifier, "123");
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_transient_fetch_errors() {
        let source = Arc::new(FlakySource {
            failures: 10,
            error: FetchError::Timeout,
            calls: AtomicU32::new(0),
        });
        let err = client(source, 100).fetch("123").await.unwrap_err();
        assert!(matches!(err, IngestError::TransientFetch { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_permanent_failures_are_not_retried() {
        let source = Arc::new(FlakySource {
            failures: 10,
            error: FetchError::InvalidIdentifier("abc".into()),
            calls: AtomicU32::new(0),
        });
        let err = client(source.clone(), 100).fetch("abc").await.unwrap_err();
        assert!(matches!(err, IngestError::PermanentFetch { .. }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_budget_is_enforced() {
        let source = Arc::new(FlakySource {
            failures: 0,
            error: FetchError::Timeout,
            calls: AtomicU32::new(0),
        });
        let client = client(source, 20);

        // 20 tokens of burst, then one token every 50ms
        let started = Instant::now();
        for i in 0..30 {
            client.fetch(&i.to_string()).await.unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(400));
    }
}
