//! Observability metrics for the detection exporter
//!
//! Tracks search request outcomes, server-side 429 rejections, retry
//! behaviour, time spent waiting on the rate limiter and record throughput.
//!
//! ## Architecture
//!
//! - Uses the `metrics` facade, so recording is a no-op until a recorder is installed
//! - Optional Prometheus exporter serving a scrape endpoint (`--metrics-addr`)

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Global metrics registry initialization flag
static METRICS_INITIALIZED: Lazy<Mutex<bool>> = Lazy::new(|| Mutex::new(false));

/// Correlation ID generator for request tracing
static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Initialize metrics with a Prometheus scrape endpoint on `addr`
///
/// Idempotent: later calls are ignored.
pub async fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let mut initialized = METRICS_INITIALIZED.lock().await;
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        "search_requests_total",
        Unit::Count,
        "Total number of search requests sent"
    );
    describe_histogram!(
        "search_request_duration_seconds",
        Unit::Seconds,
        "Search request duration in seconds"
    );
    describe_counter!(
        "search_429_errors_total",
        Unit::Count,
        "Total number of rate limit rejections received"
    );
    describe_counter!(
        "search_retries_total",
        Unit::Count,
        "Total number of page retries"
    );
    describe_histogram!(
        "rate_limit_wait_seconds",
        Unit::Seconds,
        "Time spent waiting for a rate limiter slot"
    );
    describe_counter!(
        "records_written_total",
        Unit::Count,
        "Records accepted by the CSV sink"
    );
    describe_counter!(
        "windows_completed_total",
        Unit::Count,
        "Windows that finished (completed or capped)"
    );
    describe_counter!(
        "windows_failed_total",
        Unit::Count,
        "Windows that aborted"
    );

    *initialized = true;
    info!(%addr, "Metrics exporter listening");
    Ok(())
}

/// Generate a new correlation ID for request tracing
pub fn generate_correlation_id() -> String {
    let id = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("req-{id:08x}")
}

/// Timing and outcome of one search request
pub struct SearchRequestMetrics {
    endpoint: String,
    start_time: Instant,
    correlation_id: String,
}

impl SearchRequestMetrics {
    /// Start recording a request
    pub fn start(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        let correlation_id = generate_correlation_id();
        debug!(correlation_id = %correlation_id, endpoint = %endpoint, "Sending search request");
        Self {
            endpoint,
            start_time: Instant::now(),
            correlation_id,
        }
    }

    /// Record a response with an HTTP status
    pub fn record_complete(&self, status_code: u16) {
        self.record(status_code.to_string());

        if status_code == 429 {
            counter!("search_429_errors_total", "endpoint" => self.endpoint.clone()).increment(1);
            warn!(
                correlation_id = %self.correlation_id,
                endpoint = %self.endpoint,
                "Rate limit rejection (429) recorded"
            );
        }
    }

    /// Record a request that never produced a status (timeout, connection reset)
    pub fn record_network_error(&self) {
        self.record("network_error".to_string());
        warn!(
            correlation_id = %self.correlation_id,
            endpoint = %self.endpoint,
            duration_ms = self.start_time.elapsed().as_millis(),
            "Network error recorded"
        );
    }

    fn record(&self, status: String) {
        let duration = self.start_time.elapsed();
        counter!(
            "search_requests_total",
            "endpoint" => self.endpoint.clone(),
            "status" => status.clone(),
        )
        .increment(1);
        histogram!("search_request_duration_seconds", "endpoint" => self.endpoint.clone())
            .record(duration.as_secs_f64());
        debug!(
            correlation_id = %self.correlation_id,
            status = %status,
            duration_ms = duration.as_millis(),
            "Search request completed"
        );
    }

    /// Correlation ID of this request
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

/// Record a page retry and the backoff before it
pub fn record_retry(window_index: usize, attempt: u32, backoff: Duration) {
    counter!("search_retries_total", "window" => window_index.to_string()).increment(1);
    debug!(
        window = window_index,
        attempt,
        backoff_ms = backoff.as_millis(),
        "Retry recorded"
    );
}

/// Record rows accepted by the sink
pub fn record_records_written(count: u64) {
    counter!("records_written_total").increment(count);
}

/// Rate limiter wait-time helper
#[derive(Debug, Default)]
pub struct RateLimiterMetrics {
    start_time: Option<Instant>,
}

impl RateLimiterMetrics {
    /// Create a new helper
    pub fn new() -> Self {
        Self { start_time: None }
    }

    /// Start measuring queue wait time
    pub fn start_acquire(&mut self) {
        self.start_time = Some(Instant::now());
    }

    /// Record that a slot was granted
    pub fn record_acquired(&mut self) {
        if let Some(start) = self.start_time.take() {
            let wait = start.elapsed();
            histogram!("rate_limit_wait_seconds").record(wait.as_secs_f64());
            if wait.as_millis() > 100 {
                debug!(wait_ms = wait.as_millis(), "Rate limiter slot acquired after wait");
            }
        }
    }
}

/// Per-window lifecycle metrics
pub struct WindowMetrics {
    window_index: usize,
    start_time: Instant,
}

impl WindowMetrics {
    /// Start tracking a window
    pub fn start(window_index: usize) -> Self {
        Self {
            window_index,
            start_time: Instant::now(),
        }
    }

    /// Window finished (completed or capped by the record budget)
    pub fn record_success(&self, records: u64, capped: bool) {
        counter!(
            "windows_completed_total",
            "capped" => capped.to_string(),
        )
        .increment(1);
        info!(
            window = self.window_index,
            records,
            capped,
            duration_secs = self.start_time.elapsed().as_secs(),
            "Window finished"
        );
    }

    /// Window aborted
    pub fn record_failure(&self, error: &str) {
        counter!("windows_failed_total").increment(1);
        error!(
            window = self.window_index,
            error = %error,
            duration_secs = self.start_time.elapsed().as_secs(),
            "Window failed"
        );
    }
}

/// Check if the metrics exporter has been installed
pub async fn is_initialized() -> bool {
    *METRICS_INITIALIZED.lock().await
}
