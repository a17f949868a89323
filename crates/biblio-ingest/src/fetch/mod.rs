//! Outbound lookups against the external record source.
//!
//! [`RecordSource`] is the transport seam; [`RateLimitedFetchClient`] wraps any
//! source with the request budget and the [`RetryPolicy`].

pub mod client;
pub mod eutils;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use client::{RateLimitedFetchClient, ANONYMOUS_REQUESTS_PER_SECOND, KEYED_REQUESTS_PER_SECOND};
pub use eutils::{EutilsConfig, EutilsSource};
pub use retry::{RetryError, RetryPolicy};

/// A fetched record before mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub identifier: String,
    pub payload: String,
}

/// One page of search hits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    pub total: u64,
    pub identifiers: Vec<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("upstream returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("undecodable response: {0}")]
    Decode(String),
}

impl FetchError {
    /// Timeouts, connection failures, 5xx and 429 are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Connect(_) | FetchError::RateLimited { .. } => true,
            FetchError::Status { status, .. } => *status >= 500,
            FetchError::InvalidIdentifier(_) | FetchError::NotFound(_) | FetchError::Decode(_) => false,
        }
    }

    /// Server-requested wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classify an HTTP status code; `None` for success.
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Option<Self> {
        match status {
            200..=299 => None,
            429 => Some(FetchError::RateLimited { retry_after }),
            404 => Some(FetchError::NotFound(message.into())),
            _ => Some(FetchError::Status {
                status,
                message: message.into(),
            }),
        }
    }
}

/// Transport to a bibliographic record source.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Page through identifiers matching a query term.
    async fn search(&self, term: &str, offset: u64, limit: u32) -> Result<SearchPage, FetchError>;

    /// Fetch one record by identifier.
    async fn fetch_record(&self, identifier: &str) -> Result<RawRecord, FetchError>;

    /// Identifiers cited by the record, for sources that expose citation links
    /// separately from the record body.
    async fn fetch_reference_ids(&self, identifier: &str) -> Result<Vec<String>, FetchError>;

    /// Full-text article by PubMed Central id. Sources without full text
    /// report every id as not found.
    async fn fetch_fulltext(&self, pmc_id: &str) -> Result<RawRecord, FetchError> {
        Err(FetchError::NotFound(format!("no full text source for {}", pmc_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Timeout.is_transient());
        assert!(FetchError::Connect("refused".into()).is_transient());
        assert!(FetchError::RateLimited { retry_after: None }.is_transient());
        assert!(FetchError::Status { status: 503, message: String::new() }.is_transient());
        assert!(!FetchError::Status { status: 400, message: String::new() }.is_transient());
        assert!(!FetchError::InvalidIdentifier("x".into()).is_transient());
        assert!(!FetchError::Decode("bad json".into()).is_transient());
    }

    #[test]
    fn test_from_status() {
        assert_eq!(FetchError::from_status(200, "", None), None);
        assert!(matches!(
            FetchError::from_status(429, "", Some(Duration::from_secs(2))),
            Some(FetchError::RateLimited { retry_after: Some(d) }) if d == Duration::from_secs(2)
        ));
        assert!(matches!(FetchError::from_status(404, "gone", None), Some(FetchError::NotFound(_))));
        assert!(matches!(
            FetchError::from_status(502, "bad gateway", None),
            Some(FetchError::Status { status: 502, .. })
        ));
    }
}
