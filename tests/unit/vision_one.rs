use detection_exporter::fetcher::vision_one::{
    classify_status, extract_skip_token, parse_retry_after, parse_search_page, ApiConfig,
};
use detection_exporter::fetcher::FetcherError;
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::StatusCode;
use std::time::Duration;

#[test]
fn page_keeps_item_key_order() {
    let body = r#"{"items":[{"z":1,"a":2,"m":{"y":true,"b":null}}],"totalCount":1}"#;
    let page = parse_search_page(body).unwrap();
    let keys: Vec<&str> = page.records[0].keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["z", "a", "m"]);
    assert_eq!(page.next_page_token, None);
}

#[test]
fn next_link_without_token_is_malformed() {
    let body = r#"{"items":[],"nextLink":"https://api.example/v3.0/search/detections?top=5"}"#;
    assert!(matches!(parse_search_page(body), Err(FetcherError::Malformed(_))));
}

#[test]
fn relative_next_link_is_accepted() {
    assert_eq!(
        extract_skip_token("/v3.0/search/detections?skipToken=abc123&top=10"),
        Some("abc123".to_string())
    );
    assert_eq!(extract_skip_token("/v3.0/search/detections?skipToken="), None);
}

#[test]
fn forbidden_is_an_authentication_failure() {
    let err = classify_status(StatusCode::FORBIDDEN, None, "{\"error\":\"AccessDenied\"}");
    assert!(matches!(err, FetcherError::Authentication(_)));
    assert!(err.is_run_fatal());
    assert!(err.to_string().contains("AccessDenied"));
}

#[test]
fn request_timeout_status_is_transient() {
    let err = classify_status(StatusCode::REQUEST_TIMEOUT, None, "");
    assert!(matches!(err, FetcherError::Transient(_)));
    let err = classify_status(StatusCode::NOT_FOUND, None, "");
    assert!(matches!(err, FetcherError::Rejected(_)));
    assert!(!err.is_retryable());
}

#[test]
fn retry_after_only_honours_seconds() {
    let mut headers = HeaderMap::new();
    assert_eq!(parse_retry_after(&headers), None);
    headers.insert(RETRY_AFTER, HeaderValue::from_static(" 12 "));
    assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));
    headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
    assert_eq!(parse_retry_after(&headers), None);
}

#[test]
fn config_rejects_bad_tokens_and_urls() {
    assert!(ApiConfig::new("  ").validate().is_err());
    assert!(ApiConfig::new("your_token_here").validate().is_err());
    assert!(ApiConfig::new("tok").with_base_url("not a url").validate().is_err());
    assert!(ApiConfig::new("tok").validate().is_ok());
    assert!(!format!("{:?}", ApiConfig::new("sekrit")).contains("sekrit"));
}
