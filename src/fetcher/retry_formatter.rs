//! Retry message formatting for page requests.
//!
//! Keeps retry and failure log lines consistent across windows: attempt
//! counters, the wait before the next attempt, the window being paged and,
//! on final failure, actionable suggestions.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::FetcherError;
use crate::TimeWindow;

/// Classification of retry errors for user messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryErrorType {
    /// Network failure, timeout or server error
    Transient,
    /// Server-side rate limit rejection (HTTP 429)
    RateLimit,
    /// Response body could not be decoded
    Malformed,
    /// Credentials rejected (401/403)
    AuthFailed,
    /// Request refused (other 4xx)
    Rejected,
}

impl RetryErrorType {
    /// Classify a fetcher error.
    pub fn from_error(error: &FetcherError) -> Self {
        match error {
            FetcherError::Transient(_) => Self::Transient,
            FetcherError::RateLimited { .. } => Self::RateLimit,
            FetcherError::Malformed(_) => Self::Malformed,
            FetcherError::Authentication(_) => Self::AuthFailed,
            FetcherError::Rejected(_) => Self::Rejected,
        }
    }

    /// User-friendly description string used inside retry log messages.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Transient => "transient request error",
            Self::RateLimit => "rate limit exceeded",
            Self::Malformed => "malformed response",
            Self::AuthFailed => "authentication failed",
            Self::Rejected => "request rejected",
        }
    }

    /// Suggested remediation presented with actionable guidance after failures.
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::Transient => "Check network connectivity; the API may be degraded, try again later",
            Self::RateLimit => "Lower --per-second/--per-minute/--per-hour or use fewer --workers",
            Self::Malformed => "The API returned an unexpected body; verify --api-base-url",
            Self::AuthFailed => "Verify the API token (V1_API_TOKEN) and its role permissions",
            Self::Rejected => "Check the --query filter syntax and the requested date range",
        }
    }
}

/// Context for formatting retry messages.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempt that just failed (1-based)
    pub attempt: u32,
    /// Maximum number of attempts configured
    pub max_attempts: u32,
    /// Type of error that triggered retry
    pub error_type: RetryErrorType,
    /// Backoff duration until next attempt
    pub backoff_duration: Duration,
    /// Window being paged
    pub window: TimeWindow,
    /// Page number within the window (1-based)
    pub page: u64,
    /// Original error message for details
    pub error_message: String,
    /// Endpoint that failed
    pub endpoint: String,
}

impl RetryContext {
    /// Build a context from the failing error.
    pub fn new(
        attempt: u32,
        max_attempts: u32,
        error: &FetcherError,
        backoff_duration: Duration,
        window: TimeWindow,
        page: u64,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            attempt,
            max_attempts,
            error_type: RetryErrorType::from_error(error),
            backoff_duration,
            window,
            page,
            error_message: error.to_string(),
            endpoint: endpoint.into(),
        }
    }

    /// Format standardized retry message with attempt counters and context.
    pub fn format_retry(&self) -> String {
        format!(
            "Retrying (attempt {}/{}) after {} - waiting {:.1} seconds... (window {}, page {}) {}",
            self.attempt + 1,
            self.max_attempts,
            self.error_type.description(),
            self.backoff_duration.as_secs_f64(),
            self.window.index,
            self.page,
            format_range(self.window.start, self.window.end)
        )
    }

    /// Format final failure summary with actionable suggestions.
    pub fn format_failure(&self) -> String {
        let mut lines = vec![
            format!(
                "[FAILED] Window {} failed after {} attempts",
                self.window.index, self.attempt
            ),
            format!("  Last error: {}", self.error_message),
            format!(
                "  Window range: {}",
                format_range(self.window.start, self.window.end)
            ),
            format!("  Page: {}", self.page),
            format!("  Endpoint: {}", self.endpoint),
            "  Suggestions:".to_string(),
        ];
        for suggestion in self.format_suggestions() {
            lines.push(format!("    - {suggestion}"));
        }
        lines.join("\n")
    }

    /// Derive suggestions tailored to the current retry context.
    pub fn format_suggestions(&self) -> Vec<String> {
        let mut suggestions = vec![self.error_type.suggestion().to_string()];
        if matches!(
            self.error_type,
            RetryErrorType::Transient | RetryErrorType::RateLimit
        ) {
            suggestions.push(format!(
                "Try increasing --max-retries (current: {})",
                self.max_attempts.saturating_sub(1)
            ));
        }
        suggestions.push("Re-run the same command to resume from the checkpoint".to_string());
        suggestions
    }
}

fn format_range(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!(
        "{} to {}",
        start.format("%Y-%m-%d %H:%M:%S"),
        end.format("%Y-%m-%d %H:%M:%S")
    )
}
