//! Window planning and worker scheduling
//!
//! The requested range is split into one contiguous window per worker.
//! Each unfinished window gets its own task running a [`Paginator`]; tasks
//! are launched with a small stagger so the first requests do not arrive
//! as a burst.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::config::DEFAULT_LAUNCH_STAGGER_MS;
use super::job::{WindowReport, WindowStatus};
use super::progress::ProgressReporter;
use crate::fetcher::Paginator;
use crate::resume::PageCursor;
use crate::shutdown::SharedStop;
use crate::TimeWindow;

/// Split `[start, end)` into `n` contiguous windows of equal length
///
/// Window length is a whole number of seconds whenever the range is at
/// least `n` seconds long, so interior bounds keep the sub-second part of
/// `start`. Shorter ranges fall back to millisecond steps. The last window
/// absorbs the remainder and always ends exactly at `end`.
pub fn plan_windows(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    n: usize,
) -> Result<Vec<TimeWindow>, String> {
    if n == 0 {
        return Err("window count must be at least 1".to_string());
    }
    if end <= start {
        return Err(format!("end ({end}) must be after start ({start})"));
    }
    let span_ms = (end - start).num_milliseconds();
    if span_ms < n as i64 {
        return Err(format!(
            "range of {span_ms}ms cannot be split into {n} windows"
        ));
    }

    let mut step = span_ms / n as i64;
    if step >= 1000 {
        step -= step % 1000;
    }
    let windows = (0..n)
        .map(|i| {
            let window_start = start + chrono::Duration::milliseconds(step * i as i64);
            let window_end = if i + 1 == n {
                end
            } else {
                start + chrono::Duration::milliseconds(step * (i as i64 + 1))
            };
            TimeWindow::new(i, window_start, window_end)
        })
        .collect();
    Ok(windows)
}

/// Delay between consecutive window launches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchPolicy {
    /// Gap between one launch and the next
    pub stagger: Duration,
}

impl LaunchPolicy {
    /// Policy with the given stagger
    pub fn new(stagger: Duration) -> Self {
        Self { stagger }
    }

    /// Wait before the `launch`-th task (0-based); the first starts immediately
    pub fn delay_before(&self, launch: usize) -> Duration {
        if launch == 0 {
            Duration::ZERO
        } else {
            self.stagger
        }
    }
}

impl Default for LaunchPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_LAUNCH_STAGGER_MS))
    }
}

/// Run-wide cap on records, shared by every window
#[derive(Debug)]
pub struct RecordBudget {
    limit: Option<u64>,
    used: AtomicU64,
}

impl RecordBudget {
    /// Budget of `limit` records (`None` = unlimited), `already_used` of them spent
    pub fn new(limit: Option<u64>, already_used: u64) -> Self {
        Self {
            limit,
            used: AtomicU64::new(already_used),
        }
    }

    /// Records still available; `None` when unlimited
    pub fn remaining(&self) -> Option<u64> {
        self.limit
            .map(|limit| limit.saturating_sub(self.used.load(Ordering::SeqCst)))
    }

    /// Whether no record may be claimed any more
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == Some(0)
    }

    /// Claim up to `wanted` records; returns how many were granted
    pub fn claim(&self, wanted: u64) -> u64 {
        let Some(limit) = self.limit else {
            self.used.fetch_add(wanted, Ordering::SeqCst);
            return wanted;
        };
        let mut current = self.used.load(Ordering::SeqCst);
        loop {
            let granted = wanted.min(limit.saturating_sub(current));
            if granted == 0 {
                return 0;
            }
            match self.used.compare_exchange(
                current,
                current + granted,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return granted,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return claimed records that were not used (e.g. duplicates)
    pub fn release(&self, count: u64) {
        if count == 0 {
            return;
        }
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(count))
            });
    }

    /// Records claimed so far
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }
}

enum Slot {
    Done(WindowReport),
    Running {
        window: TimeWindow,
        cursor: PageCursor,
        handle: JoinHandle<WindowReport>,
    },
}

/// Launches one paginator task per window and collects their reports
pub struct WindowScheduler {
    paginator: Paginator,
    launch: LaunchPolicy,
    stop: SharedStop,
    progress: Arc<ProgressReporter>,
}

impl WindowScheduler {
    /// Create a scheduler
    pub fn new(
        paginator: Paginator,
        launch: LaunchPolicy,
        stop: SharedStop,
        progress: Arc<ProgressReporter>,
    ) -> Self {
        Self {
            paginator,
            launch,
            stop,
            progress,
        }
    }

    /// Run every window to a terminal state; reports come back ordered by index
    ///
    /// Windows already finished in the checkpoint are reported `Completed`
    /// without a request. A task that panics is reported as a failed window.
    pub async fn run(&self, plan: Vec<(TimeWindow, PageCursor)>) -> Vec<WindowReport> {
        let mut slots = Vec::with_capacity(plan.len());
        let mut launched = 0usize;

        for (window, cursor) in plan {
            if cursor.finished {
                debug!(window = window.index, "Window already finished, skipping");
                let mut report = WindowReport::new(window, cursor);
                report.status = WindowStatus::Completed;
                self.progress.window_finished();
                slots.push(Slot::Done(report));
                continue;
            }

            let delay = self.launch.delay_before(launched);
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.stop.wait_for_stop() => {}
                }
            }
            if self.stop.is_stop_requested() {
                debug!(window = window.index, "Stop requested before launch");
                self.progress.window_finished();
                slots.push(Slot::Done(WindowReport::new(window, cursor)));
                continue;
            }

            let paginator = self.paginator.clone();
            let task_cursor = cursor.clone();
            let handle = tokio::spawn(async move { paginator.run(window, task_cursor).await });
            info!(window = window.index, start = %window.start, end = %window.end, "Launched window");
            launched += 1;
            slots.push(Slot::Running {
                window,
                cursor,
                handle,
            });
        }

        let mut reports = Vec::with_capacity(slots.len());
        for slot in slots {
            let report = match slot {
                Slot::Done(report) => report,
                Slot::Running {
                    window,
                    cursor,
                    handle,
                } => match handle.await {
                    Ok(report) => report,
                    Err(join_error) => {
                        error!(window = window.index, error = %join_error, "Window task died");
                        self.progress.window_finished();
                        WindowReport::failed(
                            window,
                            cursor,
                            format!("window task failed: {join_error}"),
                        )
                    }
                },
            };
            reports.push(report);
        }
        reports
    }
}
