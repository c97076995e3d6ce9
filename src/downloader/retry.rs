//! Explicit retry state machine for page requests
//!
//! A page request is attempted, classified into an [`AttemptOutcome`], and
//! the [`RetryPolicy`] decides whether to wait and try again or give up.
//! Nothing here sleeps; the caller owns the waiting so it can be cut short
//! by a stop request.

use std::time::Duration;

use crate::downloader::config::{
    backoff_between, ExportConfig, INITIAL_BACKOFF_MS, MALFORMED_MAX_RETRIES, MAX_BACKOFF_MS,
    MAX_RETRIES,
};
use crate::fetcher::{FetcherError, SearchPage};

/// Tagged result of one request attempt
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The page arrived
    Success(SearchPage),
    /// Worth another attempt after a backoff
    Retryable(FetcherError),
    /// Retrying cannot help
    Fatal(FetcherError),
}

impl From<Result<SearchPage, FetcherError>> for AttemptOutcome {
    fn from(result: Result<SearchPage, FetcherError>) -> Self {
        match result {
            Ok(page) => AttemptOutcome::Success(page),
            Err(e) if e.is_retryable() => AttemptOutcome::Retryable(e),
            Err(e) => AttemptOutcome::Fatal(e),
        }
    }
}

/// What to do after a retryable failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then attempt the same page again
    RetryAfter(Duration),
    /// Retry budget exhausted for this kind of failure
    GiveUp,
}

/// Bounded exponential backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    malformed_max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    /// Create a policy allowing `max_retries` retries (so `max_retries + 1` attempts)
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            malformed_max_retries: MALFORMED_MAX_RETRIES.min(max_retries),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    /// Policy built from the run configuration
    pub fn from_config(config: &ExportConfig) -> Self {
        Self::new(config.max_retries, config.initial_backoff, config.max_backoff)
    }

    /// Retries allowed for ordinary retryable failures
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total attempts a page may receive
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Backoff before retry number `retry` (0-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        backoff_between(retry, self.initial_backoff, self.max_backoff)
    }

    /// Decide after the `retries_done + 1`-th failed attempt
    ///
    /// Malformed responses get a smaller budget; server rate-limit
    /// rejections wait at least as long as the server asked.
    pub fn decide(&self, retries_done: u32, error: &FetcherError) -> RetryDecision {
        let budget = match error {
            FetcherError::Malformed(_) => self.malformed_max_retries,
            _ => self.max_retries,
        };
        if retries_done >= budget {
            return RetryDecision::GiveUp;
        }

        let mut delay = self.backoff(retries_done);
        if let FetcherError::RateLimited {
            retry_after: Some(retry_after),
        } = error
        {
            delay = delay.max(*retry_after);
        }
        RetryDecision::RetryAfter(delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            MAX_RETRIES,
            Duration::from_millis(INITIAL_BACKOFF_MS),
            Duration::from_millis(MAX_BACKOFF_MS),
        )
    }
}
