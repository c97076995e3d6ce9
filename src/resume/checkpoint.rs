//! Checkpoint types for resume capability
//!
//! A checkpoint records, per window, the last page that was durably handed
//! to the sink. Resuming restarts each window from its saved continuation
//! token, so no acknowledged page is requested twice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::ResumeError;
use crate::TimeWindow;

/// Current checkpoint schema version
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Position of one window within its paged result set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    /// Window this cursor belongs to
    pub window_index: usize,
    /// Token of the next page to request; `None` means start from the first page
    pub next_page_token: Option<String>,
    /// Records from this window accepted by the sink so far
    pub records_fetched: u64,
    /// Pages from this window accepted by the sink so far
    pub pages_completed: u64,
    /// Whether the window has been fully paged
    pub finished: bool,
}

impl PageCursor {
    /// Cursor of a window that has not fetched anything yet
    pub fn start(window_index: usize) -> Self {
        Self {
            window_index,
            next_page_token: None,
            records_fetched: 0,
            pages_completed: 0,
            finished: false,
        }
    }
}

/// Persisted slot for one window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCheckpoint {
    /// Window index
    pub window_index: usize,
    /// Inclusive lower bound of the window
    pub start: DateTime<Utc>,
    /// Exclusive upper bound of the window
    pub end: DateTime<Utc>,
    /// Token of the next page to request
    pub next_page_token: Option<String>,
    /// Records written from this window
    pub records_fetched: u64,
    /// Pages written from this window
    pub pages_completed: u64,
    /// Window fully paged
    pub finished: bool,
}

impl WindowCheckpoint {
    fn fresh(window: &TimeWindow) -> Self {
        Self {
            window_index: window.index,
            start: window.start,
            end: window.end,
            next_page_token: None,
            records_fetched: 0,
            pages_completed: 0,
            finished: false,
        }
    }

    /// The window this slot describes
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.window_index, self.start, self.end)
    }

    /// Current cursor of the window
    pub fn cursor(&self) -> PageCursor {
        PageCursor {
            window_index: self.window_index,
            next_page_token: self.next_page_token.clone(),
            records_fetched: self.records_fetched,
            pages_completed: self.pages_completed,
            finished: self.finished,
        }
    }
}

/// Whole-run checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Schema version of the file
    pub schema_version: String,
    /// Inclusive start of the exported range
    pub global_start: DateTime<Utc>,
    /// Exclusive end of the exported range
    pub global_end: DateTime<Utc>,
    /// Number of windows the range was split into
    pub worker_count: usize,
    /// One slot per window, ordered by index
    pub windows: Vec<WindowCheckpoint>,
    /// Records written across all windows
    pub total_written: u64,
    /// Every window finished and the output was finalized
    pub completed: bool,
    /// Creation time (Unix milliseconds)
    pub created_at: i64,
    /// Last update time (Unix milliseconds)
    pub updated_at: i64,
}

impl Checkpoint {
    /// Fresh checkpoint for a planned set of windows
    pub fn new(global_start: DateTime<Utc>, global_end: DateTime<Utc>, windows: &[TimeWindow]) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            global_start,
            global_end,
            worker_count: windows.len(),
            windows: windows.iter().map(WindowCheckpoint::fresh).collect(),
            total_written: 0,
            completed: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check schema version
    pub fn validate_schema_version(&self) -> Result<(), ResumeError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(ResumeError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION.to_string(),
                found: self.schema_version.clone(),
            });
        }
        Ok(())
    }

    /// Check internal consistency of a loaded file
    pub fn validate_structure(&self) -> Result<(), ResumeError> {
        if self.windows.len() != self.worker_count {
            return Err(ResumeError::Corrupted(format!(
                "worker_count is {} but {} window slots are present",
                self.worker_count,
                self.windows.len()
            )));
        }
        for (position, slot) in self.windows.iter().enumerate() {
            if slot.window_index != position {
                return Err(ResumeError::Corrupted(format!(
                    "window slot {position} carries index {}",
                    slot.window_index
                )));
            }
        }
        let sum: u64 = self.windows.iter().map(|w| w.records_fetched).sum();
        if sum != self.total_written {
            return Err(ResumeError::Corrupted(format!(
                "total_written is {} but window counts sum to {sum}",
                self.total_written
            )));
        }
        Ok(())
    }

    /// Check that this checkpoint belongs to the run about to start
    pub fn validate_against(
        &self,
        global_start: DateTime<Utc>,
        global_end: DateTime<Utc>,
        windows: &[TimeWindow],
    ) -> Result<(), ResumeError> {
        if self.windows.len() != windows.len() {
            return Err(ResumeError::WindowCountMismatch {
                expected: windows.len(),
                found: self.windows.len(),
            });
        }
        if self.global_start != global_start || self.global_end != global_end {
            return Err(ResumeError::RangeMismatch(format!(
                "checkpoint covers [{} .. {}), run requests [{} .. {})",
                self.global_start, self.global_end, global_start, global_end
            )));
        }
        for (slot, window) in self.windows.iter().zip(windows) {
            if slot.start != window.start || slot.end != window.end {
                return Err(ResumeError::RangeMismatch(format!(
                    "checkpoint window {} is [{} .. {}), run plans [{} .. {})",
                    slot.window_index, slot.start, slot.end, window.start, window.end
                )));
            }
        }
        Ok(())
    }

    /// Overwrite one window slot with a newer cursor
    pub fn apply(&mut self, cursor: &PageCursor) -> Result<(), ResumeError> {
        let slot = self
            .windows
            .get_mut(cursor.window_index)
            .ok_or(ResumeError::UnknownWindow(cursor.window_index))?;
        slot.next_page_token = cursor.next_page_token.clone();
        slot.records_fetched = cursor.records_fetched;
        slot.pages_completed = cursor.pages_completed;
        slot.finished = cursor.finished;

        self.total_written = self.windows.iter().map(|w| w.records_fetched).sum();
        self.updated_at = Utc::now().timestamp_millis();
        Ok(())
    }

    /// Cursor of one window, if the index exists
    pub fn cursor(&self, window_index: usize) -> Option<PageCursor> {
        self.windows.get(window_index).map(WindowCheckpoint::cursor)
    }

    /// Windows that still have pages to fetch
    pub fn unfinished_windows(&self) -> impl Iterator<Item = &WindowCheckpoint> {
        self.windows.iter().filter(|w| !w.finished)
    }
}
