//! Export configuration constants and validated run settings

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Maximum number of retries for a failed page request.
/// 5 retries with exponential backoff rides out transient outages
/// (max total wait ~1 minute) without looping on persistent failures.
pub const MAX_RETRIES: u32 = 5;

/// Retries allowed for an undecodable response before the window gives up.
pub const MALFORMED_MAX_RETRIES: u32 = 2;

/// Initial backoff delay in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 1000; // 1 second

/// Maximum backoff delay in milliseconds.
/// Caps exponential growth (retry 5 = 32s capped to 30s).
pub const MAX_BACKOFF_MS: u64 = 30000; // 30 seconds

/// Largest page the search endpoint accepts.
pub const MAX_PAGE_SIZE: u32 = 5000;

/// Default page size (the endpoint maximum keeps request counts low).
pub const DEFAULT_PAGE_SIZE: u32 = 5000;

/// Default cap on records exported by one run.
pub const DEFAULT_MAX_RESULTS: u64 = 20_000;

/// Default number of concurrent windows.
pub const DEFAULT_WORKERS: usize = 4;

/// Maximum allowed worker count to prevent self-inflicted rate limiting.
pub const MAX_WORKERS: usize = 32;

/// Default ceiling on requests in any trailing second.
pub const DEFAULT_PER_SECOND: u32 = 5;

/// Default ceiling on requests in any trailing minute.
pub const DEFAULT_PER_MINUTE: u32 = 200;

/// Default ceiling on requests in any trailing hour.
pub const DEFAULT_PER_HOUR: u32 = 5000;

/// Default delay between consecutive window launches.
pub const DEFAULT_LAUNCH_STAGGER_MS: u64 = 50;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default record field used for ordering the output.
pub const DEFAULT_TIMESTAMP_FIELD: &str = "eventTime";

/// Calculate exponential backoff delay with the default bounds
pub fn calculate_backoff(retry_count: u32) -> Duration {
    backoff_between(
        retry_count,
        Duration::from_millis(INITIAL_BACKOFF_MS),
        Duration::from_millis(MAX_BACKOFF_MS),
    )
}

/// Exponential backoff `initial * 2^retry_count`, capped at `max`
pub fn backoff_between(retry_count: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 2u64.saturating_pow(retry_count);
    let delay_ms = (initial.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(delay_ms).min(max)
}

/// Three simultaneous request ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCeilings {
    /// Requests allowed in any trailing 1 second
    pub per_second: u32,
    /// Requests allowed in any trailing 60 seconds
    pub per_minute: u32,
    /// Requests allowed in any trailing 3600 seconds
    pub per_hour: u32,
}

impl Default for RateCeilings {
    fn default() -> Self {
        Self {
            per_second: DEFAULT_PER_SECOND,
            per_minute: DEFAULT_PER_MINUTE,
            per_hour: DEFAULT_PER_HOUR,
        }
    }
}

/// How an existing checkpoint is treated at start-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumeMode {
    /// Resume from the checkpoint if one exists
    #[default]
    On,
    /// Delete checkpoint and spool, then start fresh
    Reset,
}

impl FromStr for ResumeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "on" => Ok(ResumeMode::On),
            "reset" => Ok(ResumeMode::Reset),
            _ => Err(format!("Invalid resume mode: {s}. Valid options: on, reset")),
        }
    }
}

/// Validated inputs for one export run
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Inclusive start of the exported range
    pub global_start: DateTime<Utc>,
    /// Exclusive end of the exported range
    pub global_end: DateTime<Utc>,
    /// Cap on records across all windows (`None` = unlimited)
    pub max_results: Option<u64>,
    /// Records requested per page
    pub page_size: u32,
    /// Number of windows / concurrent workers
    pub worker_count: usize,
    /// Request ceilings shared by all workers
    pub rate: RateCeilings,
    /// Per-request timeout handed to the HTTP client
    pub request_timeout: Duration,
    /// Optional search filter expression
    pub query_filter: Option<String>,
    /// Final CSV path
    pub output_path: PathBuf,
    /// Checkpoint file path
    pub checkpoint_path: PathBuf,
    /// Record field holding the event time
    pub timestamp_field: String,
    /// Retries per page before a window gives up
    pub max_retries: u32,
    /// First backoff delay
    pub initial_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Delay between window launches
    pub launch_stagger: Duration,
    /// Checkpoint handling at start-up
    pub resume: ResumeMode,
}

impl ExportConfig {
    /// Create a config for `[global_start, global_end)` with default settings
    pub fn new(global_start: DateTime<Utc>, global_end: DateTime<Utc>, output_path: PathBuf) -> Self {
        let checkpoint_path = default_checkpoint_path(&output_path);
        Self {
            global_start,
            global_end,
            max_results: Some(DEFAULT_MAX_RESULTS),
            page_size: DEFAULT_PAGE_SIZE,
            worker_count: DEFAULT_WORKERS,
            rate: RateCeilings::default(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            query_filter: None,
            output_path,
            checkpoint_path,
            timestamp_field: DEFAULT_TIMESTAMP_FIELD.to_string(),
            max_retries: MAX_RETRIES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            launch_stagger: Duration::from_millis(DEFAULT_LAUNCH_STAGGER_MS),
            resume: ResumeMode::On,
        }
    }

    /// Reject out-of-range values before any window is scheduled
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker count must be at least 1".to_string());
        }
        if self.worker_count > MAX_WORKERS {
            return Err(format!(
                "worker count {} exceeds maximum of {MAX_WORKERS}",
                self.worker_count
            ));
        }
        if self.global_end <= self.global_start {
            return Err(format!(
                "end ({}) must be after start ({})",
                self.global_end, self.global_start
            ));
        }
        let span_ms = (self.global_end - self.global_start).num_milliseconds();
        if span_ms < self.worker_count as i64 {
            return Err(format!(
                "range of {span_ms}ms is too short to split across {} workers",
                self.worker_count
            ));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}, got {}",
                self.page_size
            ));
        }
        if self.max_results == Some(0) {
            return Err("max results must be at least 1".to_string());
        }
        if self.rate.per_second == 0 || self.rate.per_minute == 0 || self.rate.per_hour == 0 {
            return Err(format!(
                "rate ceilings must be positive, got {}/s {}/min {}/h",
                self.rate.per_second, self.rate.per_minute, self.rate.per_hour
            ));
        }
        if self.request_timeout.is_zero() {
            return Err("request timeout must be positive".to_string());
        }
        if self.timestamp_field.trim().is_empty() {
            return Err("timestamp field cannot be empty".to_string());
        }
        if self.max_backoff < self.initial_backoff {
            return Err("max backoff must not be shorter than the initial backoff".to_string());
        }
        if self.output_path == self.checkpoint_path {
            return Err("output and checkpoint paths must differ".to_string());
        }
        Ok(())
    }
}

/// `detections.csv` → `detections.checkpoint.json`, next to the output
pub fn default_checkpoint_path(output_path: &Path) -> PathBuf {
    let stem = output_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".to_string());
    output_path.with_file_name(format!("{stem}.checkpoint.json"))
}
