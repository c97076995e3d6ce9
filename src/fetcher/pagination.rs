//! Per-window pagination
//!
//! A [`Paginator`] pages through one window strictly sequentially. For each
//! page it waits for the rate limiter, retries retryable failures under the
//! [`RetryPolicy`], keeps only records inside the window, claims slots from
//! the shared record budget, hands the rows to the sink and only then
//! advances the checkpoint. The checkpoint therefore never leads the data.

use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::retry_formatter::RetryContext;
use super::{FetcherError, SearchApi, SearchPage, SearchRequest};
use crate::downloader::job::{WindowReport, WindowStatus};
use crate::downloader::progress::ProgressReporter;
use crate::downloader::rate_limit::RateLimiter;
use crate::downloader::retry::{AttemptOutcome, RetryDecision, RetryPolicy};
use crate::downloader::scheduler::RecordBudget;
use crate::metrics::{record_records_written, record_retry, WindowMetrics};
use crate::output::{extract_sort_key, flatten_record, CsvSink, RowKey, SinkRow};
use crate::resume::{CheckpointStore, PageCursor};
use crate::shutdown::{SharedStop, StopReason};
use crate::TimeWindow;

/// Per-request settings shared by every window
#[derive(Debug, Clone)]
pub struct PageSettings {
    /// Maximum records per page
    pub page_size: u32,
    /// Optional search filter
    pub query_filter: Option<String>,
    /// Record field holding the event time
    pub timestamp_field: String,
    /// Retry policy for failed requests
    pub retry: RetryPolicy,
}

/// Why a page could not be fetched
enum PageFailure {
    /// A stop was requested while waiting
    Stopped,
    /// Non-retryable error
    Fatal(FetcherError),
    /// Retry budget exhausted
    Exhausted(FetcherError),
}

/// Pages one window at a time; cheap to clone, one clone per window task
#[derive(Clone)]
pub struct Paginator {
    api: Arc<dyn SearchApi>,
    limiter: Arc<RateLimiter>,
    store: Arc<CheckpointStore>,
    sink: Arc<CsvSink>,
    budget: Arc<RecordBudget>,
    stop: SharedStop,
    progress: Arc<ProgressReporter>,
    settings: Arc<PageSettings>,
}

impl Paginator {
    /// Assemble a paginator from the run's shared components
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn SearchApi>,
        limiter: Arc<RateLimiter>,
        store: Arc<CheckpointStore>,
        sink: Arc<CsvSink>,
        budget: Arc<RecordBudget>,
        stop: SharedStop,
        progress: Arc<ProgressReporter>,
        settings: PageSettings,
    ) -> Self {
        Self {
            api,
            limiter,
            store,
            sink,
            budget,
            stop,
            progress,
            settings: Arc::new(settings),
        }
    }

    /// Page `window` from `cursor` until it is exhausted, capped, stopped or fails
    pub async fn run(&self, window: TimeWindow, cursor: PageCursor) -> WindowReport {
        let span = info_span!(
            "window",
            index = window.index,
            start = %window.start,
            end = %window.end
        );
        async move {
            let metrics = WindowMetrics::start(window.index);
            let report = self.page_window(window, cursor).await;
            match report.status {
                WindowStatus::Completed | WindowStatus::Capped => metrics.record_success(
                    report.records_fetched,
                    report.status == WindowStatus::Capped,
                ),
                WindowStatus::Failed => {
                    metrics.record_failure(report.error.as_deref().unwrap_or("unknown error"))
                }
                WindowStatus::Interrupted => {
                    info!(records = report.records_fetched, "Window interrupted")
                }
            }
            self.progress.window_finished();
            report
        }
        .instrument(span)
        .await
    }

    async fn page_window(&self, window: TimeWindow, mut cursor: PageCursor) -> WindowReport {
        let mut report = WindowReport::new(window, cursor.clone());
        if cursor.finished {
            report.status = WindowStatus::Completed;
            return report;
        }

        loop {
            if self.stop.is_stop_requested() {
                report.status = WindowStatus::Interrupted;
                return report;
            }

            let top = match self.budget.remaining() {
                Some(0) => {
                    debug!("Record budget exhausted before next page");
                    report.status = WindowStatus::Capped;
                    return report;
                }
                Some(remaining) => (self.settings.page_size as u64).min(remaining) as u32,
                None => self.settings.page_size,
            };

            let page_number = cursor.pages_completed + 1;
            let request = SearchRequest {
                query_filter: self.settings.query_filter.clone(),
                start: window.start,
                end: window.end,
                top,
                page_token: cursor.next_page_token.clone(),
            };

            let page = match self.fetch_page(&window, &request, page_number, &mut report).await {
                Ok(page) => page,
                Err(PageFailure::Stopped) => {
                    report.status = WindowStatus::Interrupted;
                    return report;
                }
                Err(PageFailure::Fatal(e)) => {
                    if e.is_run_fatal() {
                        error!(error = %e, "Authentication rejected, stopping all windows");
                        self.stop.request_stop(StopReason::AuthenticationFailed);
                        report.status = WindowStatus::Interrupted;
                    } else {
                        error!(page = page_number, error = %e, "Page rejected, aborting window");
                        report.status = WindowStatus::Failed;
                    }
                    report.error = Some(e.to_string());
                    return report;
                }
                Err(PageFailure::Exhausted(e)) => {
                    report.status = WindowStatus::Failed;
                    report.error = Some(e.to_string());
                    return report;
                }
            };

            let returned = page.records.len();
            let exhausted = page.next_page_token.is_none() || returned < top as usize;
            let rows = self.rows_in_window(&window, page_number, &page);
            let in_window = rows.len();

            let granted = self.budget.claim(in_window as u64) as usize;
            let capped = granted < in_window;
            let mut rows = rows;
            rows.truncate(granted);

            let accepted = match self.sink.submit_page(rows).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    self.budget.release(granted as u64);
                    error!(page = page_number, error = %e, "Sink rejected page, aborting window");
                    report.status = WindowStatus::Failed;
                    report.error = Some(format!("output error: {e}"));
                    return report;
                }
            };
            // Duplicates of rows spooled before a crash do not consume budget
            self.budget.release((granted - accepted) as u64);

            cursor.records_fetched = self.sink.rows_for_window(window.index).await;
            if capped {
                // Keep the token of this page: a later run with a larger
                // budget re-fetches it and the accepted rows dedup by key.
                cursor.finished = false;
            } else {
                cursor.next_page_token = page.next_page_token.clone();
                cursor.pages_completed = page_number;
                cursor.finished = exhausted;
            }

            if let Err(e) = self.store.save(&cursor).await {
                error!(page = page_number, error = %e, "Checkpoint save failed, aborting window");
                report.status = WindowStatus::Failed;
                report.error = Some(format!("checkpoint error: {e}"));
                return report;
            }

            report.last_cursor = cursor.clone();
            report.records_fetched = cursor.records_fetched;
            report.records_this_run += accepted as u64;
            report.pages_this_run += 1;
            record_records_written(accepted as u64);
            self.progress.record_page(accepted as u64);

            debug!(
                page = page_number,
                returned,
                in_window,
                accepted,
                total = cursor.records_fetched,
                "Page written"
            );

            if capped {
                info!(records = cursor.records_fetched, "Record budget reached");
                report.status = WindowStatus::Capped;
                return report;
            }
            if exhausted {
                report.status = WindowStatus::Completed;
                return report;
            }
        }
    }

    /// Flatten records and keep those whose timestamp falls inside the window
    ///
    /// Records without a parseable timestamp are kept; the API already
    /// filtered by time, so there is nothing to check them against.
    fn rows_in_window(&self, window: &TimeWindow, page_number: u64, page: &SearchPage) -> Vec<SinkRow> {
        let field = &self.settings.timestamp_field;
        let mut rows = Vec::with_capacity(page.records.len());
        for (position, record) in page.records.iter().enumerate() {
            let row = flatten_record(record);
            let sort_key = extract_sort_key(&row, field);
            if let Some(ts) = sort_key {
                if !window.contains_millis(ts) {
                    debug!(position, timestamp = ts, "Dropping record outside window");
                    continue;
                }
            }
            rows.push(SinkRow {
                key: RowKey {
                    window_index: window.index,
                    page: page_number,
                    position,
                },
                sort_key,
                row,
            });
        }
        rows
    }

    /// One page, with rate limiting and retries
    async fn fetch_page(
        &self,
        window: &TimeWindow,
        request: &SearchRequest,
        page_number: u64,
        report: &mut WindowReport,
    ) -> Result<SearchPage, PageFailure> {
        let policy = self.settings.retry;
        let mut retries = 0u32;

        loop {
            tokio::select! {
                _ = self.limiter.acquire() => {}
                _ = self.stop.wait_for_stop() => return Err(PageFailure::Stopped),
            }

            let error = match AttemptOutcome::from(self.api.search(request).await) {
                AttemptOutcome::Success(page) => {
                    if retries > 0 {
                        info!(page = page_number, attempt = retries + 1, "Retry succeeded");
                    }
                    return Ok(page);
                }
                AttemptOutcome::Fatal(e) => {
                    report.errors += 1;
                    return Err(PageFailure::Fatal(e));
                }
                AttemptOutcome::Retryable(e) => {
                    report.errors += 1;
                    e
                }
            };

            match policy.decide(retries, &error) {
                RetryDecision::GiveUp => {
                    let context = RetryContext::new(
                        retries + 1,
                        retries + 1,
                        &error,
                        std::time::Duration::ZERO,
                        *window,
                        page_number,
                        self.api.endpoint(),
                    );
                    error!("{}", context.format_failure());
                    return Err(PageFailure::Exhausted(error));
                }
                RetryDecision::RetryAfter(delay) => {
                    if matches!(error, FetcherError::RateLimited { .. }) {
                        self.limiter.pause_for(delay).await;
                    }
                    let context = RetryContext::new(
                        retries + 1,
                        policy.max_attempts(),
                        &error,
                        delay,
                        *window,
                        page_number,
                        self.api.endpoint(),
                    );
                    warn!(
                        page = page_number,
                        attempt = retries + 1,
                        backoff_ms = delay.as_millis() as u64,
                        error = %error,
                        "{}",
                        context.format_retry()
                    );
                    record_retry(window.index, retries + 1, delay);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.stop.wait_for_stop() => return Err(PageFailure::Stopped),
                    }
                    retries += 1;
                }
            }
        }
    }
}

impl std::fmt::Debug for Paginator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Paginator")
            .field("endpoint", &self.api.endpoint())
            .field("settings", &self.settings)
            .finish()
    }
}
