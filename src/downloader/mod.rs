//! Export orchestration
//!
//! This module drives a complete export run: the requested time range is
//! split into windows, each window is paged by its own task, and the rows
//! end up in one ordered CSV file.
//!
//! # Overview
//!
//! 1. **Configuration**: [`config::ExportConfig`] holds the validated run settings
//! 2. **Planning**: [`scheduler::plan_windows`] partitions the range
//! 3. **Scheduling**: [`scheduler::WindowScheduler`] launches one paginator per window
//! 4. **Rate Limiting**: every request passes [`rate_limit::RateLimiter`]
//! 5. **Retries**: failures are driven by [`retry::RetryPolicy`]
//! 6. **Lifecycle**: [`executor::RunController`] ties checkpoint, sink and scheduler together
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use chrono::{TimeZone, Utc};
//! use detection_exporter::downloader::{ExportConfig, RunController};
//! use detection_exporter::fetcher::vision_one::{ApiConfig, VisionOneClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ExportConfig::new(
//!     Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap(),
//!     Utc.with_ymd_and_hms(2024, 10, 31, 0, 0, 0).unwrap(),
//!     "detections.csv".into(),
//! );
//! let client = VisionOneClient::new(ApiConfig::new("token"))?;
//! let result = RunController::new(config, Arc::new(client)).run().await?;
//! println!("wrote {} rows", result.total_written);
//! # Ok(())
//! # }
//! ```
//!
//! # Error Handling
//!
//! Run-level failures are [`ExportError`]s. Per-window failures do not
//! abort the run; they show up as `Failed` entries in the
//! [`job::RunResult`].

pub mod config;
pub mod executor;
pub mod job;
pub mod progress;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;

pub use config::{ExportConfig, RateCeilings, ResumeMode};
pub use executor::RunController;
pub use job::{RunResult, WindowReport, WindowStatus};
pub use rate_limit::RateLimiter;
pub use retry::{AttemptOutcome, RetryDecision, RetryPolicy};
pub use scheduler::{plan_windows, LaunchPolicy, RecordBudget, WindowScheduler};

use crate::output::OutputError;
use crate::resume::ResumeError;

/// Run-level export errors
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// Invalid settings, or a checkpoint that belongs to another run
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The API rejected the credentials
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The checkpoint file exists but cannot be used
    #[error("checkpoint corrupted: {0}")]
    CheckpointCorruption(String),

    /// Checkpoint IO error
    #[error("resume error: {0}")]
    Resume(ResumeError),

    /// Output error
    #[error("output error: {0}")]
    Output(#[from] OutputError),
}

impl From<ResumeError> for ExportError {
    fn from(err: ResumeError) -> Self {
        match err {
            e if e.is_mismatch() => ExportError::Configuration(e.to_string()),
            e @ ResumeError::Lock(_) => ExportError::Configuration(e.to_string()),
            e @ (ResumeError::Corrupted(_)
            | ResumeError::SchemaVersionMismatch { .. }
            | ResumeError::StateTooLarge { .. }) => ExportError::CheckpointCorruption(e.to_string()),
            e => ExportError::Resume(e),
        }
    }
}
