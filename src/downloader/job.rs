//! Window and run outcome structures

use serde::{Serialize, Serializer};
use std::path::PathBuf;
use std::time::Duration;

use crate::resume::PageCursor;
use crate::TimeWindow;

/// Terminal state of one window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    /// Every page of the window was fetched and written
    Completed,
    /// Stopped because the run-wide record budget ran out
    Capped,
    /// Aborted after retries were exhausted or a non-retryable error
    Failed,
    /// Stopped early by an interrupt or another window's fatal error
    Interrupted,
}

impl WindowStatus {
    /// Whether the window counts towards a successful run
    pub fn is_success(&self) -> bool {
        matches!(self, WindowStatus::Completed | WindowStatus::Capped)
    }
}

impl std::fmt::Display for WindowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            WindowStatus::Completed => "completed",
            WindowStatus::Capped => "capped",
            WindowStatus::Failed => "failed",
            WindowStatus::Interrupted => "interrupted",
        };
        f.write_str(label)
    }
}

/// Outcome of one window in this run
#[derive(Debug, Clone, Serialize)]
pub struct WindowReport {
    /// The window
    pub window: TimeWindow,
    /// Terminal state
    pub status: WindowStatus,
    /// Rows from this window held by the sink, across runs
    pub records_fetched: u64,
    /// Rows accepted during this run
    pub records_this_run: u64,
    /// Pages fetched during this run
    pub pages_this_run: u64,
    /// Failed request attempts
    pub errors: u32,
    /// Last cursor persisted to the checkpoint (the safe resume point)
    pub last_cursor: PageCursor,
    /// Error that ended the window, if any
    pub error: Option<String>,
}

impl WindowReport {
    /// Report for a window starting at `cursor`; status is set when it ends
    pub fn new(window: TimeWindow, cursor: PageCursor) -> Self {
        Self {
            window,
            status: WindowStatus::Interrupted,
            records_fetched: cursor.records_fetched,
            records_this_run: 0,
            pages_this_run: 0,
            errors: 0,
            last_cursor: cursor,
            error: None,
        }
    }

    /// Report for a window whose task died without reporting
    pub fn failed(window: TimeWindow, cursor: PageCursor, error: impl Into<String>) -> Self {
        let mut report = Self::new(window, cursor);
        report.status = WindowStatus::Failed;
        report.error = Some(error.into());
        report
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    /// Rows in the output file
    pub total_written: u64,
    /// Rows added by this run
    pub new_records: u64,
    /// Failed request attempts across all windows
    pub total_errors: u64,
    /// Per-window outcomes, ordered by index
    pub windows: Vec<WindowReport>,
    /// Wall-clock duration of the run
    #[serde(rename = "elapsed_secs", serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    /// Final CSV path
    pub output_path: PathBuf,
    /// The checkpoint was already complete; nothing was fetched or written
    pub already_complete: bool,
}

impl RunResult {
    /// Every window completed or was capped by the budget
    pub fn is_success(&self) -> bool {
        self.windows.iter().all(|w| w.status.is_success())
    }

    /// Windows that aborted
    pub fn failed_windows(&self) -> impl Iterator<Item = &WindowReport> {
        self.windows
            .iter()
            .filter(|w| w.status == WindowStatus::Failed)
    }

    /// Whether any window stopped at the record limit with work left
    pub fn was_capped(&self) -> bool {
        self.windows
            .iter()
            .any(|w| w.status == WindowStatus::Capped)
    }

    /// Whether any window was stopped by an interrupt
    pub fn was_interrupted(&self) -> bool {
        self.windows
            .iter()
            .any(|w| w.status == WindowStatus::Interrupted)
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}
