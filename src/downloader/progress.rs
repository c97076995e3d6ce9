//! Progress tracking for long-running exports.
//!
//! Windows report every written page to a shared [`ProgressReporter`],
//! which emits a periodic `[PROGRESS]` log line with records written,
//! windows finished, throughput and an estimate of the time remaining.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::info;

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(60);
const MIN_EXPORT_DURATION: Duration = Duration::from_secs(30);

/// Progress state of one run.
#[derive(Debug, Clone)]
pub struct ProgressState {
    /// Records written during this run.
    pub records_written: u64,
    /// Records the run may still write, when the budget is bounded.
    pub total_expected: Option<u64>,
    /// Number of windows in the run.
    pub windows_total: usize,
    /// Windows that reached a terminal state.
    pub windows_finished: usize,
    /// When the run started.
    pub start_time: Instant,
    /// Last time progress was reported.
    pub last_update: Instant,
    /// Minimum interval between time-based updates.
    pub update_interval: Duration,
    /// Current throughput (records per second).
    pub current_rate: f64,
    /// Last reported completion percentage.
    pub last_reported_percentage: f64,
    /// Minimum percentage delta required to emit a new update.
    pub min_percentage_step: f64,
}

impl ProgressState {
    /// Create a state with default intervals.
    pub fn new(total_expected: Option<u64>, windows_total: usize) -> Self {
        let now = Instant::now();
        Self {
            records_written: 0,
            total_expected,
            windows_total,
            windows_finished: 0,
            start_time: now,
            last_update: now,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            current_rate: 0.0,
            last_reported_percentage: 0.0,
            min_percentage_step: 10.0,
        }
    }

    /// Count newly written records.
    pub fn update(&mut self, new_records: u64) {
        self.records_written = self.records_written.saturating_add(new_records);
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.current_rate = self.records_written as f64 / elapsed;
        }
    }

    /// Count a window that reached a terminal state.
    pub fn window_finished(&mut self) {
        self.windows_finished = (self.windows_finished + 1).min(self.windows_total);
    }

    /// Whether an update should be emitted based on time or percentage.
    pub fn should_emit_update(&self) -> bool {
        if self.records_written == 0 {
            return false;
        }

        let percentage_jump = self
            .percentage()
            .map(|pct| pct - self.last_reported_percentage >= self.min_percentage_step)
            .unwrap_or(false);
        if percentage_jump {
            return true;
        }

        self.start_time.elapsed() >= MIN_EXPORT_DURATION
            && self.last_update.elapsed() >= self.update_interval
    }

    /// Call after emitting a progress log to reset timers and cached percentage.
    pub fn mark_emitted(&mut self) {
        self.last_update = Instant::now();
        if let Some(pct) = self.percentage() {
            self.last_reported_percentage = pct;
        }
    }

    /// Completion percentage (0-100) against the record budget, else by windows.
    pub fn percentage(&self) -> Option<f64> {
        match self.total_expected {
            Some(0) => Some(100.0),
            Some(total) => Some((self.records_written as f64 / total as f64 * 100.0).min(100.0)),
            None if self.windows_total > 0 => {
                Some(self.windows_finished as f64 / self.windows_total as f64 * 100.0)
            }
            None => None,
        }
    }

    /// Estimate remaining time from the current rate (bounded budgets only).
    pub fn estimate_remaining(&self) -> Option<Duration> {
        let total = self.total_expected?;
        if self.current_rate <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(self.records_written);
        (remaining > 0).then(|| Duration::from_secs_f64(remaining as f64 / self.current_rate))
    }

    /// Human-readable progress string for logging.
    pub fn format_progress(&self) -> String {
        let mut parts = vec![format!("[PROGRESS] Wrote {} records", self.records_written)];

        if let Some(pct) = self.percentage() {
            parts.push(format!("- {pct:.1}% complete"));
        }
        parts.push(format!(
            "({}/{} windows done)",
            self.windows_finished, self.windows_total
        ));
        if self.current_rate > 0.0 {
            parts.push(format!("at {:.0} records/sec", self.current_rate));
        }
        if let Some(remaining) = self.estimate_remaining() {
            parts.push(format!("- ~{} remaining", format_duration(remaining)));
        }

        parts.join(" ")
    }
}

/// Shared progress sink for all windows of a run.
#[derive(Debug)]
pub struct ProgressReporter {
    state: Mutex<ProgressState>,
}

impl ProgressReporter {
    /// Create a reporter.
    pub fn new(total_expected: Option<u64>, windows_total: usize) -> Self {
        Self {
            state: Mutex::new(ProgressState::new(total_expected, windows_total)),
        }
    }

    /// Record a written page; may emit a progress line.
    pub fn record_page(&self, records: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.update(records);
            if state.should_emit_update() {
                info!(
                    records_written = state.records_written,
                    windows_finished = state.windows_finished,
                    "{}",
                    state.format_progress()
                );
                state.mark_emitted();
            }
        }
    }

    /// Record a window reaching a terminal state.
    pub fn window_finished(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.window_finished();
        }
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> Option<ProgressState> {
        self.state.lock().ok().map(|s| s.clone())
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{:.1}h", secs as f64 / 3600.0)
    }
}
