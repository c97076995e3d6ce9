//! Resume capability for export runs
//!
//! Provides checkpoint persistence with atomic writes, schema versioning and
//! an advisory process lock.

pub mod checkpoint;
pub mod lock;
pub mod state;

pub use checkpoint::{Checkpoint, PageCursor, WindowCheckpoint, SCHEMA_VERSION};
pub use lock::RunLock;
pub use state::{load_checkpoint, CheckpointStore, ResumeError, MAX_STATE_FILE_SIZE};
