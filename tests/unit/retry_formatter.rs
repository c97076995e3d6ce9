use chrono::{TimeZone, Utc};
use std::time::Duration;

use detection_exporter::fetcher::retry_formatter::{RetryContext, RetryErrorType};
use detection_exporter::fetcher::FetcherError;
use detection_exporter::TimeWindow;

fn sample_context(error: FetcherError) -> RetryContext {
    RetryContext::new(
        2,
        5,
        &error,
        Duration::from_secs(4),
        TimeWindow::new(
            1,
            Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
        ),
        7,
        "/v3.0/search/detections",
    )
}

#[test]
fn format_retry_captures_attempt_and_wait() {
    let ctx = sample_context(FetcherError::RateLimited { retry_after: None });
    let message = ctx.format_retry();
    assert!(message.contains("attempt 3/5"));
    assert!(message.contains("rate limit exceeded"));
    assert!(message.contains("4.0 seconds"));
    assert!(message.contains("window 1, page 7"));
    assert!(message.contains("2024-01-08 00:00:00 to 2024-01-15 00:00:00"));
}

#[test]
fn format_failure_lists_suggestions() {
    let ctx = sample_context(FetcherError::Transient("HTTP 502 Bad Gateway".into()));
    let output = ctx.format_failure();
    assert!(output.contains("[FAILED] Window 1 failed after 2 attempts"));
    assert!(output.contains("502 Bad Gateway"));
    assert!(output.contains("Check network connectivity"));
    assert!(output.contains("--max-retries (current: 4)"));
    assert!(output.contains("resume from the checkpoint"));
}

#[test]
fn error_types_follow_fetcher_errors() {
    let cases = [
        (FetcherError::Authentication("401".into()), RetryErrorType::AuthFailed),
        (FetcherError::RateLimited { retry_after: Some(Duration::from_secs(1)) }, RetryErrorType::RateLimit),
        (FetcherError::Transient("timeout".into()), RetryErrorType::Transient),
        (FetcherError::Malformed("eof".into()), RetryErrorType::Malformed),
        (FetcherError::Rejected("400".into()), RetryErrorType::Rejected),
    ];
    for (error, expected) in cases {
        assert_eq!(RetryErrorType::from_error(&error), expected);
    }
}

#[test]
fn auth_failure_points_at_the_token() {
    let ctx = sample_context(FetcherError::Authentication("HTTP 401".into()));
    let suggestions = ctx.format_suggestions();
    assert!(suggestions[0].contains("V1_API_TOKEN"));
    assert!(!suggestions.iter().any(|s| s.contains("--max-retries")));
}
