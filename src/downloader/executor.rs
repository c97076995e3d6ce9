//! Run controller: one export run from configuration to final CSV

use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::downloader::config::{ExportConfig, ResumeMode};
use crate::downloader::job::{RunResult, WindowReport, WindowStatus};
use crate::downloader::progress::ProgressReporter;
use crate::downloader::rate_limit::RateLimiter;
use crate::downloader::retry::RetryPolicy;
use crate::downloader::scheduler::{plan_windows, LaunchPolicy, RecordBudget, WindowScheduler};
use crate::downloader::ExportError;
use crate::fetcher::pagination::PageSettings;
use crate::fetcher::{Paginator, SearchApi};
use crate::output::{spool_path_for, CsvSink};
use crate::resume::{CheckpointStore, RunLock};
use crate::shutdown::{SharedStop, StopReason, StopSignal};

/// Drives one export run
pub struct RunController {
    config: ExportConfig,
    api: Arc<dyn SearchApi>,
    stop: SharedStop,
}

impl RunController {
    /// Create a controller with its own stop signal
    pub fn new(config: ExportConfig, api: Arc<dyn SearchApi>) -> Self {
        Self {
            config,
            api,
            stop: StopSignal::shared(),
        }
    }

    /// Attach a shared stop handle (e.g. wired to Ctrl+C)
    pub fn with_stop(mut self, stop: SharedStop) -> Self {
        self.stop = stop;
        self
    }

    /// Stop handle of this run
    pub fn stop_handle(&self) -> SharedStop {
        self.stop.clone()
    }

    /// Execute the run
    ///
    /// Returns `Ok` for full success and for partial success (failed or
    /// interrupted windows are listed in the result). Invalid settings, an
    /// unusable checkpoint and rejected credentials are errors.
    pub async fn run(&self) -> Result<RunResult, ExportError> {
        let started = Instant::now();
        let config = &self.config;
        config.validate().map_err(ExportError::Configuration)?;

        let checkpoint_path = config.checkpoint_path.clone();
        let spool_path = spool_path_for(&checkpoint_path);

        let _lock = RunLock::try_acquire(&checkpoint_path)?;

        if config.resume == ResumeMode::Reset {
            info!(path = %checkpoint_path.display(), "Resume reset requested, discarding checkpoint");
            CheckpointStore::remove(&checkpoint_path)?;
            remove_spool(&spool_path)?;
        }

        let windows = plan_windows(config.global_start, config.global_end, config.worker_count)
            .map_err(ExportError::Configuration)?;
        let store = Arc::new(CheckpointStore::open(
            &checkpoint_path,
            config.global_start,
            config.global_end,
            &windows,
        )?);

        let checkpoint = store.snapshot().await;
        if checkpoint.completed {
            info!(
                total_written = checkpoint.total_written,
                "Checkpoint already completed, nothing to fetch"
            );
            let reports = checkpoint
                .windows
                .iter()
                .map(|w| {
                    let mut report = WindowReport::new(w.window(), w.cursor());
                    report.status = WindowStatus::Completed;
                    report
                })
                .collect();
            return Ok(RunResult {
                total_written: checkpoint.total_written,
                new_records: 0,
                total_errors: 0,
                windows: reports,
                elapsed: started.elapsed(),
                output_path: config.output_path.clone(),
                already_complete: true,
            });
        }

        let sink = Arc::new(CsvSink::open(&config.output_path, &spool_path)?);
        let spooled = sink.row_count().await as u64;
        if spooled != checkpoint.total_written {
            warn!(
                spooled,
                checkpointed = checkpoint.total_written,
                "Spool and checkpoint disagree, trusting the spool"
            );
        }

        let budget = Arc::new(RecordBudget::new(config.max_results, spooled));
        let progress = Arc::new(ProgressReporter::new(budget.remaining(), windows.len()));
        let limiter = Arc::new(RateLimiter::new(config.rate));

        let paginator = Paginator::new(
            self.api.clone(),
            limiter,
            store.clone(),
            sink.clone(),
            budget.clone(),
            self.stop.clone(),
            progress.clone(),
            PageSettings {
                page_size: config.page_size,
                query_filter: config.query_filter.clone(),
                timestamp_field: config.timestamp_field.clone(),
                retry: RetryPolicy::from_config(config),
            },
        );
        let scheduler = WindowScheduler::new(
            paginator,
            LaunchPolicy::new(config.launch_stagger),
            self.stop.clone(),
            progress,
        );

        info!(
            start = %config.global_start,
            end = %config.global_end,
            workers = windows.len(),
            max_results = ?config.max_results,
            resumed_rows = spooled,
            "Starting export"
        );

        let mut plan = Vec::with_capacity(windows.len());
        for window in &windows {
            let cursor = checkpoint
                .cursor(window.index)
                .ok_or(crate::resume::ResumeError::UnknownWindow(window.index))?;
            plan.push((*window, cursor));
        }
        let reports = scheduler.run(plan).await;

        if self.stop.reason() == Some(StopReason::AuthenticationFailed) {
            let message = reports
                .iter()
                .find_map(|r| r.error.clone())
                .unwrap_or_else(|| "credentials rejected".to_string());
            error!(error = %message, "Authentication failed, checkpoint and spool kept");
            return Err(ExportError::Authentication(message));
        }

        let summary = sink.finalize().await?;
        let result = RunResult {
            total_written: summary.rows as u64,
            new_records: reports.iter().map(|r| r.records_this_run).sum(),
            total_errors: reports.iter().map(|r| r.errors as u64).sum(),
            windows: reports,
            elapsed: started.elapsed(),
            output_path: summary.path,
            already_complete: false,
        };

        if result.is_success() && result.was_capped() {
            // Capped windows keep their cursor; a larger limit continues them
            info!(
                rows = result.total_written,
                new = result.new_records,
                elapsed_secs = result.elapsed.as_secs_f64(),
                "Record limit reached, checkpoint kept for a larger --max-results"
            );
        } else if result.is_success() {
            store.mark_completed().await?;
            sink.discard_spool().await?;
            info!(
                rows = result.total_written,
                new = result.new_records,
                columns = summary.columns,
                elapsed_secs = result.elapsed.as_secs_f64(),
                "Export completed"
            );
        } else {
            for failed in result.failed_windows() {
                error!(
                    window = failed.window.index,
                    range = %failed.window,
                    pages = failed.last_cursor.pages_completed,
                    error = failed.error.as_deref().unwrap_or(""),
                    "Window failed; rerun to resume from its last saved page"
                );
            }
            warn!(
                rows = result.total_written,
                interrupted = result.was_interrupted(),
                "Export incomplete, checkpoint kept"
            );
        }

        Ok(result)
    }
}

fn remove_spool(path: &std::path::Path) -> Result<(), ExportError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ExportError::Output(crate::output::OutputError::Io(e.to_string()))),
    }
}

impl std::fmt::Debug for RunController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunController")
            .field("config", &self.config)
            .field("endpoint", &self.api.endpoint())
            .finish()
    }
}
