//! Advisory process lock for a checkpoint
//!
//! Two processes driving the same checkpoint would interleave their saves
//! and spool appends. [`RunLock`] takes an exclusive `fd-lock` on a sibling
//! `.lock` file for the lifetime of the run.

use super::state::ResumeError;
use fd_lock::RwLock;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive lock held while a run owns a checkpoint
pub struct RunLock {
    // The OS lock lives as long as this handle stays open.
    _lock: RwLock<File>,
    path: PathBuf,
}

impl RunLock {
    /// Lock file path for a checkpoint path
    pub fn lock_path(checkpoint_path: &Path) -> PathBuf {
        checkpoint_path.with_extension("lock")
    }

    /// Try to take the lock without blocking
    ///
    /// Fails immediately with [`ResumeError::Lock`] if another process holds it.
    pub fn try_acquire(checkpoint_path: &Path) -> Result<Self, ResumeError> {
        if let Some(parent) = checkpoint_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| ResumeError::Io(e.to_string()))?;
            }
        }

        let path = Self::lock_path(checkpoint_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ResumeError::Lock(format!("Failed to open lock file: {e}")))?;

        let mut lock = RwLock::new(file);
        {
            let mut guard = lock.try_write().map_err(|e| {
                ResumeError::Lock(format!(
                    "{} is held by another export process: {e}",
                    path.display()
                ))
            })?;
            let _ = guard.set_len(0);
            let _ = writeln!(*guard, "{}", std::process::id());
            // Keep the OS lock after the guard goes away; it is released on close.
            std::mem::forget(guard);
        }

        debug!(path = %path.display(), "Acquired run lock");
        Ok(Self { _lock: lock, path })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock").field("path", &self.path).finish()
    }
}
