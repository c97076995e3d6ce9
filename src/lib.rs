//! # Detection Exporter Library
//!
//! Retrieves time-ranged detection records from a paginated, rate-limited
//! search API and writes them to one ordered, schema-flattened CSV file.
//! Interrupted runs resume from a checkpoint without re-fetching or
//! duplicating records.
//!
//! ## Features
//!
//! - **Windowed Concurrency**: The requested time range is split into one
//!   contiguous window per worker, each paged independently
//! - **Three Rate Ceilings**: Per-second, per-minute and per-hour sliding
//!   windows enforced together across all workers
//! - **Resume Capability**: Per-window page cursors checkpointed atomically
//!   after every page
//! - **Flat CSV Output**: Nested JSON records flattened into dot-path
//!   columns, merged into one header and sorted by event time
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use chrono::{TimeZone, Utc};
//! use detection_exporter::downloader::{ExportConfig, RunController};
//! use detection_exporter::fetcher::vision_one::{ApiConfig, VisionOneClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let api = VisionOneClient::new(ApiConfig::new("token"))?;
//! let config = ExportConfig::new(
//!     Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap(),
//!     Utc.with_ymd_and_hms(2024, 11, 1, 0, 0, 0).unwrap(),
//!     "detections.csv".into(),
//! );
//!
//! let result = RunController::new(config, Arc::new(api)).run().await?;
//! println!("{} records written", result.total_written);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`downloader`] - Rate limiting, window scheduling and run orchestration
//! - [`fetcher`] - Search API contract, HTTP client and per-window pagination
//! - [`output`] - Record flattening and the ordered CSV sink
//! - [`resume`] - Checkpoint persistence and process locking
//! - [`shutdown`] - Global stop coordination (Ctrl+C, auth failure)
//! - [`metrics`] - Request, retry and throughput metrics

#![warn(missing_docs)]
#![warn(clippy::all)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// CLI command implementations
pub mod cli;

/// Rate limiting, scheduling and run orchestration
pub mod downloader;

/// Search API access and pagination
pub mod fetcher;

/// Metrics collection
pub mod metrics;

/// Flattening and CSV output
pub mod output;

/// Checkpoint persistence for interrupted runs
pub mod resume;

/// Stop coordination shared across window workers
pub mod shutdown;

/// One event record exactly as returned by the search API.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Contiguous sub-range `[start, end)` of the requested interval, owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Position of the window in the partition (0-based)
    pub index: usize,
    /// Inclusive lower bound
    pub start: DateTime<Utc>,
    /// Exclusive upper bound
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Create a window
    pub fn new(index: usize, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { index, start, end }
    }

    /// Start bound in Unix milliseconds
    pub fn start_millis(&self) -> i64 {
        self.start.timestamp_millis()
    }

    /// End bound in Unix milliseconds
    pub fn end_millis(&self) -> i64 {
        self.end.timestamp_millis()
    }

    /// Whether a Unix-millisecond timestamp falls inside `[start, end)`
    pub fn contains_millis(&self, timestamp: i64) -> bool {
        timestamp >= self.start_millis() && timestamp < self.end_millis()
    }

    /// Validate window bounds
    pub fn validate(&self) -> Result<(), String> {
        if self.end <= self.start {
            return Err(format!(
                "Window {} end ({}) must be after start ({})",
                self.index, self.end, self.start
            ));
        }
        Ok(())
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "window {} [{} .. {})",
            self.index,
            self.start.format("%Y-%m-%dT%H:%M:%SZ"),
            self.end.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}
