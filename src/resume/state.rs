//! Checkpoint persistence
//!
//! [`CheckpointStore`] is the single writer of the checkpoint file. Every
//! save replaces the whole file atomically (temp file in the same
//! directory, fsync, rename, fsync directory) while holding the store's
//! mutex, so concurrent saves from different windows never lose each
//! other's slots.

use super::checkpoint::{Checkpoint, PageCursor};
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::TimeWindow;

/// Maximum allowed checkpoint file size (10 MB) to prevent memory exhaustion
pub const MAX_STATE_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Errors related to checkpoint state
#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    /// Schema version mismatch
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Expected schema version
        expected: String,
        /// Found schema version
        found: String,
    },

    /// Checkpoint was written for a different number of windows
    #[error("checkpoint has {found} windows but the run plans {expected}")]
    WindowCountMismatch {
        /// Windows planned by the current run
        expected: usize,
        /// Windows found in the checkpoint
        found: usize,
    },

    /// Checkpoint was written for a different time range
    #[error("checkpoint range mismatch: {0}")]
    RangeMismatch(String),

    /// File exists but cannot be understood
    #[error("checkpoint corrupted: {0}")]
    Corrupted(String),

    /// State file too large
    #[error("state file too large: {size} bytes (max: {max} bytes)")]
    StateTooLarge {
        /// Actual file size
        size: u64,
        /// Maximum allowed size
        max: u64,
    },

    /// Cursor for a window the checkpoint does not know
    #[error("unknown window index {0}")]
    UnknownWindow(usize),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Lock error
    #[error("lock error: {0}")]
    Lock(String),
}

impl ResumeError {
    /// Whether the checkpoint does not belong to the requested run
    pub fn is_mismatch(&self) -> bool {
        matches!(
            self,
            ResumeError::WindowCountMismatch { .. } | ResumeError::RangeMismatch(_)
        )
    }
}

/// Read and parse a checkpoint file
///
/// Returns `Ok(None)` if the file does not exist. An unparseable file is an
/// error, never silently discarded.
pub fn load_checkpoint(path: &Path) -> Result<Option<Checkpoint>, ResumeError> {
    debug!(path = %path.display(), "Loading checkpoint");

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ResumeError::Io(e.to_string())),
    };
    if metadata.len() > MAX_STATE_FILE_SIZE {
        return Err(ResumeError::StateTooLarge {
            size: metadata.len(),
            max: MAX_STATE_FILE_SIZE,
        });
    }

    let contents = std::fs::read_to_string(path).map_err(|e| ResumeError::Io(e.to_string()))?;
    let checkpoint: Checkpoint = serde_json::from_str(&contents).map_err(|e| {
        warn!(path = %path.display(), error = %e, "Failed to parse checkpoint");
        ResumeError::Corrupted(e.to_string())
    })?;

    checkpoint.validate_schema_version()?;
    checkpoint.validate_structure()?;

    info!(
        path = %path.display(),
        windows = checkpoint.windows.len(),
        total_written = checkpoint.total_written,
        completed = checkpoint.completed,
        "Checkpoint loaded"
    );
    Ok(Some(checkpoint))
}

/// Replace `path` with `bytes` atomically and durably
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent_dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent_dir)?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)?;
    temp_file.write_all(bytes)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path).map_err(|e| e.error)?;

    // Make the rename itself durable
    if let Ok(dir) = std::fs::File::open(parent_dir) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Owner of the checkpoint file for one run
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    state: Mutex<Checkpoint>,
}

impl CheckpointStore {
    /// Load the checkpoint for this run, or create and persist a fresh one
    ///
    /// A checkpoint written for a different range or window count is
    /// rejected rather than overwritten.
    pub fn open(
        path: impl Into<PathBuf>,
        global_start: DateTime<Utc>,
        global_end: DateTime<Utc>,
        windows: &[TimeWindow],
    ) -> Result<Self, ResumeError> {
        let path = path.into();
        let checkpoint = match load_checkpoint(&path)? {
            Some(existing) => {
                existing.validate_against(global_start, global_end, windows)?;
                info!(
                    path = %path.display(),
                    unfinished = existing.unfinished_windows().count(),
                    "Resuming from checkpoint"
                );
                existing
            }
            None => {
                let fresh = Checkpoint::new(global_start, global_end, windows);
                persist(&path, &fresh)?;
                info!(path = %path.display(), windows = windows.len(), "Created checkpoint");
                fresh
            }
        };

        Ok(Self {
            path,
            state: Mutex::new(checkpoint),
        })
    }

    /// Path of the checkpoint file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current in-memory checkpoint
    pub async fn snapshot(&self) -> Checkpoint {
        self.state.lock().await.clone()
    }

    /// Record a window's new cursor and persist the whole checkpoint
    pub async fn save(&self, cursor: &PageCursor) -> Result<(), ResumeError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.apply(cursor)?;
        persist(&self.path, &next)?;
        *state = next;

        debug!(
            window = cursor.window_index,
            pages = cursor.pages_completed,
            records = cursor.records_fetched,
            finished = cursor.finished,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Persist `completed = true`
    pub async fn mark_completed(&self) -> Result<(), ResumeError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.completed = true;
        next.updated_at = Utc::now().timestamp_millis();
        persist(&self.path, &next)?;
        *state = next;
        info!(path = %self.path.display(), "Checkpoint marked completed");
        Ok(())
    }

    /// Delete a checkpoint file if present
    pub fn remove(path: &Path) -> Result<(), ResumeError> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                info!(path = %path.display(), "Removed checkpoint");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ResumeError::Io(e.to_string())),
        }
    }
}

fn persist(path: &Path, checkpoint: &Checkpoint) -> Result<(), ResumeError> {
    let json = serde_json::to_vec_pretty(checkpoint)
        .map_err(|e| ResumeError::Serialization(e.to_string()))?;
    write_atomically(path, &json)
        .map_err(|e| ResumeError::Io(format!("Failed to persist checkpoint: {e}")))
}
