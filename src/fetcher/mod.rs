//! Search API contract and implementations
//!
//! The core only talks to [`SearchApi`]: one paged "search over a time
//! range" operation plus the error signals it must tell apart. The
//! Vision One HTTP client in [`vision_one`] is one implementation; tests
//! plug in an in-process mock.

use crate::RawRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub mod pagination;
pub mod retry_formatter;
pub mod vision_one;

pub use pagination::Paginator;

/// Fetcher errors, classified by how the caller must react
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetcherError {
    /// Credentials rejected; fatal for the whole run
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Server-side rate limit rejection; retryable
    #[error("rate limit exceeded")]
    RateLimited {
        /// Delay requested by the server, if it sent one
        retry_after: Option<Duration>,
    },

    /// Network failure, timeout or 5xx; retryable
    #[error("transient request error: {0}")]
    Transient(String),

    /// Response body could not be decoded; retryable a bounded number of times
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Request refused for a reason retrying cannot fix (4xx other than auth/429)
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl FetcherError {
    /// Whether another attempt at the same page may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetcherError::RateLimited { .. } | FetcherError::Transient(_) | FetcherError::Malformed(_)
        )
    }

    /// Whether the failure affects every window, not just the current one
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, FetcherError::Authentication(_))
    }
}

/// Result type for fetcher operations
pub type FetcherResult<T> = Result<T, FetcherError>;

/// One page request over `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Optional search filter expression
    pub query_filter: Option<String>,
    /// Inclusive lower time bound
    pub start: DateTime<Utc>,
    /// Exclusive upper time bound
    pub end: DateTime<Utc>,
    /// Maximum records to return
    pub top: u32,
    /// Continuation token from the previous page; `None` for the first page
    pub page_token: Option<String>,
}

/// One page of search results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    /// Records in API order
    pub records: Vec<RawRecord>,
    /// Token for the next page; `None` when the range is exhausted
    pub next_page_token: Option<String>,
}

/// Remote search endpoint
#[async_trait]
pub trait SearchApi: Send + Sync {
    /// Fetch one page of records matching the request
    async fn search(&self, request: &SearchRequest) -> FetcherResult<SearchPage>;

    /// Endpoint description used in logs
    fn endpoint(&self) -> &str;
}
