//! Stop coordination utilities.
//!
//! Provides a lightweight [`StopSignal`] shared by every window worker so a
//! Ctrl+C or an authentication failure stops all windows after their
//! current page, without corrupting the checkpoint or the row spool.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared handle to a stop signal.
pub type SharedStop = Arc<StopSignal>;

/// Why the run was asked to stop early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Operator interrupt (Ctrl+C)
    Interrupted,
    /// The API rejected our credentials; every window is affected
    AuthenticationFailed,
}

impl StopReason {
    fn to_code(self) -> u8 {
        match self {
            StopReason::Interrupted => 1,
            StopReason::AuthenticationFailed => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(StopReason::Interrupted),
            2 => Some(StopReason::AuthenticationFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Interrupted => write!(f, "interrupted"),
            StopReason::AuthenticationFailed => write!(f, "authentication failed"),
        }
    }
}

/// Coordinates an early stop across async tasks. The first reason wins.
#[derive(Debug, Default)]
pub struct StopSignal {
    reason: AtomicU8,
    notify: Notify,
}

impl StopSignal {
    /// Create a new signal.
    pub fn new() -> Self {
        Self {
            reason: AtomicU8::new(0),
            notify: Notify::new(),
        }
    }

    /// Create a new shared signal wrapped in [`Arc`].
    pub fn shared() -> SharedStop {
        Arc::new(Self::new())
    }

    /// Request a stop. Notifies all waiters exactly once; later reasons are ignored.
    pub fn request_stop(&self, reason: StopReason) {
        if self
            .reason
            .compare_exchange(0, reason.to_code(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.notify.notify_waiters();
        }
    }

    /// Whether a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.reason.load(Ordering::SeqCst) != 0
    }

    /// The reason of the first stop request, if any.
    pub fn reason(&self) -> Option<StopReason> {
        StopReason::from_code(self.reason.load(Ordering::SeqCst))
    }

    /// Wait until a stop is requested. Returns immediately if already set.
    pub async fn wait_for_stop(&self) {
        let notified = self.notify.notified();
        if self.is_stop_requested() {
            return;
        }
        notified.await;
    }
}
