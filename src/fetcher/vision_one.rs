//! Trend Vision One detection search client
//!
//! Implements [`SearchApi`] over `GET /v3.0/search/detections`. One call is
//! one attempt: retries, backoff and rate limiting belong to the paginator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{FetcherError, FetcherResult, SearchApi, SearchPage, SearchRequest};
use crate::downloader::config::DEFAULT_REQUEST_TIMEOUT_SECS;
use crate::metrics::SearchRequestMetrics;
use crate::RawRecord;

/// Default API host
pub const DEFAULT_API_BASE_URL: &str = "https://api.xdr.trendmicro.com";

/// Path of the detection search endpoint
pub const SEARCH_DETECTIONS_PATH: &str = "/v3.0/search/detections";

/// Header carrying the search filter expression
pub const QUERY_HEADER: &str = "TMV1-Query";

/// Token values that mean "not configured"
pub const PLACEHOLDER_TOKENS: &[&str] = &["YOUR_API_KEY", "your_token_here"];

/// Wire format of `startDateTime` / `endDateTime`
const DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Same, for bounds with a sub-second part
const DATE_TIME_MILLIS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Client configuration
#[derive(Clone)]
pub struct ApiConfig {
    /// API host, without the endpoint path
    pub base_url: String,
    /// Bearer token
    pub token: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl ApiConfig {
    /// Configuration with the default host and timeout
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            token: token.into(),
            timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    /// Override the API host
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Override the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reject an empty or placeholder token
    pub fn validate(&self) -> Result<(), String> {
        let token = self.token.trim();
        if token.is_empty() {
            return Err("API token is empty".to_string());
        }
        if PLACEHOLDER_TOKENS.contains(&token) {
            return Err("API token is still the placeholder value; set V1_API_TOKEN".to_string());
        }
        Url::parse(&self.base_url)
            .map_err(|e| format!("invalid API base URL '{}': {e}", self.base_url))?;
        Ok(())
    }
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct DetectionsResponse {
    #[serde(default)]
    items: Vec<RawRecord>,
    #[serde(rename = "nextLink", default)]
    next_link: Option<String>,
}

/// HTTP client for the detection search endpoint
#[derive(Debug, Clone)]
pub struct VisionOneClient {
    client: Client,
    endpoint: String,
    token: String,
}

impl VisionOneClient {
    /// Build a client; fails on an invalid configuration
    pub fn new(config: ApiConfig) -> FetcherResult<Self> {
        config.validate().map_err(FetcherError::Rejected)?;

        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("detection-exporter/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetcherError::Transient(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}{SEARCH_DETECTIONS_PATH}",
                config.base_url.trim_end_matches('/')
            ),
            token: config.token,
        })
    }

    fn query_params(request: &SearchRequest) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("startDateTime", format_date_time(request.start)),
            ("endDateTime", format_date_time(request.end)),
            ("top", request.top.to_string()),
            ("mode", "detection".to_string()),
        ];
        if let Some(token) = &request.page_token {
            params.push(("skipToken", token.clone()));
        }
        params
    }
}

#[async_trait]
impl SearchApi for VisionOneClient {
    async fn search(&self, request: &SearchRequest) -> FetcherResult<SearchPage> {
        let metrics = SearchRequestMetrics::start(SEARCH_DETECTIONS_PATH);

        let mut builder = self
            .client
            .get(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .query(&Self::query_params(request));
        if let Some(filter) = &request.query_filter {
            builder = builder.header(QUERY_HEADER, filter);
        }

        let response = match builder.send().await {
            Ok(resp) => resp,
            Err(e) => {
                metrics.record_network_error();
                return Err(FetcherError::Transient(describe_reqwest_error(&e)));
            }
        };

        let status = response.status();
        metrics.record_complete(status.as_u16());

        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    debug!(
                        correlation_id = %metrics.correlation_id(),
                        status = %status,
                        error = %e,
                        "Failed to read error response body"
                    );
                    String::new()
                }
            };
            return Err(classify_status(status, retry_after, &body));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetcherError::Transient(describe_reqwest_error(&e)))?;
        let page = parse_search_page(&body)?;

        debug!(
            correlation_id = %metrics.correlation_id(),
            records = page.records.len(),
            has_next = page.next_page_token.is_some(),
            "Search page received"
        );
        Ok(page)
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Render a time bound for the query string
///
/// Millisecond bounds must reach the server intact: the paginator filters
/// records against the same bounds, so a truncated end would drop records
/// that belong to this window and that no other window requests.
pub fn format_date_time(at: DateTime<Utc>) -> String {
    if at.timestamp_subsec_millis() == 0 {
        at.format(DATE_TIME_FORMAT).to_string()
    } else {
        at.format(DATE_TIME_MILLIS_FORMAT).to_string()
    }
}

/// Decode a response body into a page
pub fn parse_search_page(body: &str) -> FetcherResult<SearchPage> {
    let response: DetectionsResponse = serde_json::from_str(body)
        .map_err(|e| FetcherError::Malformed(format!("Failed to deserialize response: {e}")))?;

    let next_page_token = match response.next_link.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(link) => Some(extract_skip_token(link).ok_or_else(|| {
            FetcherError::Malformed(format!("nextLink without skipToken: {link}"))
        })?),
    };

    Ok(SearchPage {
        records: response.items,
        next_page_token,
    })
}

/// Pull the `skipToken` query parameter out of a `nextLink` URL
pub fn extract_skip_token(next_link: &str) -> Option<String> {
    if let Ok(url) = Url::parse(next_link) {
        return url
            .query_pairs()
            .find(|(key, _)| key == "skipToken")
            .map(|(_, value)| value.into_owned())
            .filter(|token| !token.is_empty());
    }
    // Relative links: take the raw value after the parameter name
    let (_, rest) = next_link.split_once("skipToken=")?;
    let token = rest.split('&').next().unwrap_or_default();
    (!token.is_empty()).then(|| token.to_string())
}

/// Map a non-success status to a fetcher error
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> FetcherError {
    let detail = format!("HTTP {status}: {}", truncate(body, 512));
    match status.as_u16() {
        401 | 403 => FetcherError::Authentication(detail),
        429 => FetcherError::RateLimited { retry_after },
        408 => FetcherError::Transient(detail),
        _ if status.is_server_error() => FetcherError::Transient(detail),
        _ => FetcherError::Rejected(detail),
    }
}

/// `Retry-After` in delta-seconds form
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn describe_reqwest_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("request timed out: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
