//! End-to-end export runs against the in-process search API

use super::mock_api::MockSearchApi;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use detection_exporter::downloader::{
    plan_windows, ExportConfig, ExportError, ResumeMode, RunController, RunResult, WindowStatus,
};
use detection_exporter::fetcher::{FetcherError, FetcherResult, SearchApi, SearchPage, SearchRequest};
use detection_exporter::output::spool_path_for;
use detection_exporter::resume::{load_checkpoint, RunLock};
use detection_exporter::shutdown::StopSignal;
use detection_exporter::TimeWindow;
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn range() -> (DateTime<Utc>, DateTime<Utc>) {
    (
        Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 10, 5, 0, 0, 0).unwrap(),
    )
}

fn config(dir: &TempDir, workers: usize, page_size: u32, max_results: Option<u64>) -> ExportConfig {
    let (start, end) = range();
    let mut config = ExportConfig::new(start, end, dir.path().join("detections.csv"));
    config.worker_count = workers;
    config.page_size = page_size;
    config.max_results = max_results;
    config
}

fn windows(workers: usize) -> Vec<TimeWindow> {
    let (start, end) = range();
    plan_windows(start, end, workers).unwrap()
}

async fn run(config: &ExportConfig, api: &Arc<MockSearchApi>) -> Result<RunResult, ExportError> {
    RunController::new(config.clone(), api.clone()).run().await
}

struct Csv {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Csv {
    fn read(path: &Path) -> Self {
        let mut reader = csv::Reader::from_path(path).unwrap();
        let header = reader.headers().unwrap().iter().map(String::from).collect();
        let rows = reader
            .records()
            .map(|r| r.unwrap().iter().map(String::from).collect())
            .collect();
        Self { header, rows }
    }

    fn column(&self, name: &str) -> Vec<String> {
        let idx = self.header.iter().position(|h| h == name).unwrap();
        self.rows.iter().map(|r| r[idx].clone()).collect()
    }

    fn unique(&self, name: &str) -> HashSet<String> {
        self.column(name).into_iter().collect()
    }
}

fn event_times(csv: &Csv) -> Vec<DateTime<Utc>> {
    csv.column("eventTime")
        .iter()
        .map(|s| DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_four_windows_three_pages_each() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 4, 2, None);
    let api = Arc::new(MockSearchApi::new(6));

    let result = run(&config, &api).await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.total_written, 24);
    assert_eq!(result.new_records, 24);
    assert_eq!(result.total_errors, 0);
    for report in &result.windows {
        assert_eq!(report.status, WindowStatus::Completed);
        assert_eq!(report.pages_this_run, 3);
        assert_eq!(report.records_fetched, 6);
    }
    assert_eq!(api.call_count(), 12);

    let csv = Csv::read(&config.output_path);
    assert_eq!(csv.rows.len(), 24);
    let header: HashSet<&str> = csv.header.iter().map(String::as_str).collect();
    let expected: HashSet<&str> = [
        "uuid",
        "eventTime",
        "severity",
        "endpoint.hostname",
        "endpoint.ips",
        "tags",
    ]
    .into_iter()
    .collect();
    assert_eq!(header, expected);

    let times = event_times(&csv);
    assert!(times.windows(2).all(|w| w[0] <= w[1]), "rows not sorted");
    assert_eq!(csv.unique("uuid").len(), 24);
    assert!(csv.column("endpoint.ips").contains(&"10.0.0.1,10.0.0.2".to_string()));

    let checkpoint = load_checkpoint(&config.checkpoint_path).unwrap().unwrap();
    assert!(checkpoint.completed);
    assert_eq!(checkpoint.total_written, 24);
    assert!(!spool_path_for(&config.checkpoint_path).exists());
}

#[tokio::test(start_paused = true)]
async fn test_failing_window_does_not_stop_siblings() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, 4, 2, None);
    config.max_retries = 3;
    let plan = windows(4);

    let api = Arc::new(MockSearchApi::new(6));
    api.fail_at(
        plan[2].start,
        2,
        FetcherError::Transient("HTTP 503 Service Unavailable".into()),
        None,
    );

    let result = run(&config, &api).await.unwrap();

    assert!(!result.is_success());
    let statuses: Vec<WindowStatus> = result.windows.iter().map(|w| w.status).collect();
    assert_eq!(
        statuses,
        vec![
            WindowStatus::Completed,
            WindowStatus::Completed,
            WindowStatus::Failed,
            WindowStatus::Completed
        ]
    );
    let failed = &result.windows[2];
    assert_eq!(failed.last_cursor.pages_completed, 1);
    assert_eq!(failed.last_cursor.next_page_token.as_deref(), Some("2"));
    assert_eq!(failed.errors, 4);
    assert!(failed.error.as_deref().unwrap().contains("503"));
    // first page, then four attempts at the second
    assert_eq!(api.calls_for(plan[2].start).len(), 5);

    assert_eq!(result.total_written, 20);
    assert_eq!(Csv::read(&config.output_path).rows.len(), 20);

    let checkpoint = load_checkpoint(&config.checkpoint_path).unwrap().unwrap();
    assert!(!checkpoint.completed);
    assert_eq!(checkpoint.windows[2].pages_completed, 1);
    assert!(!checkpoint.windows[2].finished);
    assert!(checkpoint.windows[3].finished);

    // The next run only fetches what window 2 is missing
    let api = Arc::new(MockSearchApi::new(6));
    let result = run(&config, &api).await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.total_written, 24);
    assert_eq!(result.new_records, 4);
    let offsets: Vec<usize> = api.calls().iter().map(|c| c.offset).collect();
    assert_eq!(offsets, vec![2, 4]);
    assert_eq!(Csv::read(&config.output_path).unique("uuid").len(), 24);
}

#[tokio::test(start_paused = true)]
async fn test_max_results_caps_total_rows() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 4, 2, Some(10));
    let api = Arc::new(MockSearchApi::new(6));

    let result = run(&config, &api).await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.total_written, 10);
    assert!(result
        .windows
        .iter()
        .any(|w| w.status == WindowStatus::Capped));
    assert!(api.calls().iter().all(|c| c.top <= 2));
    assert_eq!(Csv::read(&config.output_path).rows.len(), 10);

    // Capped windows still have work, so the run stays resumable
    let checkpoint = load_checkpoint(&config.checkpoint_path).unwrap().unwrap();
    assert!(!checkpoint.completed);
    assert!(spool_path_for(&config.checkpoint_path).exists());
}

#[tokio::test(start_paused = true)]
async fn test_capped_run_continues_with_larger_limit() {
    let dir = TempDir::new().unwrap();
    let capped = config(&dir, 4, 2, Some(10));
    let api = Arc::new(MockSearchApi::new(6));
    let first = run(&capped, &api).await.unwrap();
    assert_eq!(first.total_written, 10);

    // Same limit again: nothing left to claim, no requests
    let api = Arc::new(MockSearchApi::new(6));
    let again = run(&capped, &api).await.unwrap();
    assert!(!again.already_complete);
    assert_eq!(again.total_written, 10);
    assert_eq!(again.new_records, 0);
    assert_eq!(api.call_count(), 0);

    let unlimited = config(&dir, 4, 2, None);
    let api = Arc::new(MockSearchApi::new(6));
    let second = run(&unlimited, &api).await.unwrap();

    assert!(second.is_success());
    assert!(!second.already_complete);
    assert_eq!(second.total_written, 24);
    assert_eq!(second.new_records, 14);
    let csv = Csv::read(&unlimited.output_path);
    assert_eq!(csv.rows.len(), 24);
    assert_eq!(csv.unique("uuid").len(), 24);

    let checkpoint = load_checkpoint(&unlimited.checkpoint_path).unwrap().unwrap();
    assert!(checkpoint.completed);
    assert!(!spool_path_for(&unlimited.checkpoint_path).exists());
}

#[tokio::test(start_paused = true)]
async fn test_completed_run_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2, 5, None);
    let api = Arc::new(MockSearchApi::new(7));
    let first = run(&config, &api).await.unwrap();
    assert!(first.is_success());
    let written = std::fs::read(&config.output_path).unwrap();

    let api = Arc::new(MockSearchApi::new(7));
    let second = run(&config, &api).await.unwrap();

    assert!(second.already_complete);
    assert_eq!(second.new_records, 0);
    assert_eq!(second.total_written, 14);
    assert_eq!(api.call_count(), 0);
    assert_eq!(std::fs::read(&config.output_path).unwrap(), written);
}

#[tokio::test(start_paused = true)]
async fn test_resume_after_interrupt_has_no_duplicates() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 4, 2, None);

    let stop = StopSignal::shared();
    let api = Arc::new(MockSearchApi::new(6));
    api.interrupt_after(5, stop.clone());
    let first = RunController::new(config.clone(), api.clone())
        .with_stop(stop)
        .run()
        .await
        .unwrap();
    assert!(!first.is_success());
    assert!(first.was_interrupted());
    assert!(first.total_written < 24);
    assert!(spool_path_for(&config.checkpoint_path).exists());

    // Pretend window 0 crashed before its checkpoint saves landed: its rows
    // are in the spool but the cursor is back at the start.
    let raw = std::fs::read_to_string(&config.checkpoint_path).unwrap();
    let mut checkpoint: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let rolled_back = checkpoint["windows"][0]["records_fetched"].as_u64().unwrap();
    checkpoint["windows"][0]["next_page_token"] = json!(null);
    checkpoint["windows"][0]["records_fetched"] = json!(0);
    checkpoint["windows"][0]["pages_completed"] = json!(0);
    checkpoint["windows"][0]["finished"] = json!(false);
    let total = checkpoint["total_written"].as_u64().unwrap() - rolled_back;
    checkpoint["total_written"] = json!(total);
    std::fs::write(
        &config.checkpoint_path,
        serde_json::to_string_pretty(&checkpoint).unwrap(),
    )
    .unwrap();

    let api = Arc::new(MockSearchApi::new(6));
    let second = run(&config, &api).await.unwrap();

    assert!(second.is_success());
    assert_eq!(second.total_written, 24);
    assert_eq!(second.new_records, 24 - first.total_written);
    let csv = Csv::read(&config.output_path);
    assert_eq!(csv.rows.len(), 24);
    assert_eq!(csv.unique("uuid").len(), 24);
}

#[tokio::test(start_paused = true)]
async fn test_authentication_failure_aborts_run() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 4, 2, None);
    let api = Arc::new(MockSearchApi::new(6));
    api.fail_everything(FetcherError::Authentication("HTTP 401 Unauthorized".into()));

    let err = run(&config, &api).await.unwrap_err();

    assert!(matches!(err, ExportError::Authentication(ref m) if m.contains("401")));
    assert!(api.call_count() <= 4, "auth failure was retried");
    assert!(!config.output_path.exists());
    assert!(config.checkpoint_path.exists());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_rejection_waits_retry_after() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2, 10, None);
    let plan = windows(2);
    let api = Arc::new(MockSearchApi::new(4));
    api.fail_at(
        plan[0].start,
        0,
        FetcherError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        },
        Some(1),
    );

    let result = run(&config, &api).await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.total_written, 8);
    assert_eq!(result.total_errors, 1);
    let calls = api.calls_for(plan[0].start);
    assert_eq!(calls.len(), 2);
    assert!(calls[1].at - calls[0].at >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_requests_respect_per_second_ceiling() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, 4, 1, None);
    config.rate.per_second = 2;
    let api = Arc::new(MockSearchApi::new(5));

    let result = run(&config, &api).await.unwrap();
    assert!(result.is_success());

    let times: Vec<_> = api.calls().iter().map(|c| c.at).collect();
    assert_eq!(times.len(), 20);
    for (i, first) in times.iter().enumerate() {
        let in_window = times[i..]
            .iter()
            .filter(|t| t.duration_since(*first) < Duration::from_secs(1))
            .count();
        assert!(in_window <= 2, "{in_window} requests within one second");
    }
}

#[tokio::test(start_paused = true)]
async fn test_malformed_responses_get_two_retries() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 1, 10, None);
    let plan = windows(1);
    let api = Arc::new(MockSearchApi::new(3));
    api.fail_at(
        plan[0].start,
        0,
        FetcherError::Malformed("expected value at line 1".into()),
        None,
    );

    let result = run(&config, &api).await.unwrap();

    assert_eq!(result.windows[0].status, WindowStatus::Failed);
    assert_eq!(api.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_query_filter_reaches_every_request() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, 2, 2, None);
    config.query_filter = Some("productCode:PTP AND act:Block".into());
    let api = Arc::new(MockSearchApi::new(3));

    run(&config, &api).await.unwrap();

    let calls = api.calls();
    assert_eq!(calls.len(), 4);
    assert!(calls
        .iter()
        .all(|c| c.query.as_deref() == Some("productCode:PTP AND act:Block")));
}

#[tokio::test(start_paused = true)]
async fn test_checkpoint_for_other_run_is_rejected() {
    let dir = TempDir::new().unwrap();
    let api = Arc::new(MockSearchApi::new(2));
    run(&config(&dir, 4, 2, None), &api).await.unwrap();

    let three_workers = config(&dir, 3, 2, None);
    let err = run(&three_workers, &api).await.unwrap_err();
    assert!(matches!(err, ExportError::Configuration(_)));

    let mut reset = three_workers.clone();
    reset.resume = ResumeMode::Reset;
    let result = run(&reset, &api).await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.total_written, 6);
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_checkpoint_is_left_alone() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2, 2, None);
    std::fs::write(&config.checkpoint_path, "{\"schema_version\": ").unwrap();
    let api = Arc::new(MockSearchApi::new(2));

    let err = run(&config, &api).await.unwrap_err();

    assert!(matches!(err, ExportError::CheckpointCorruption(_)));
    assert_eq!(
        std::fs::read_to_string(&config.checkpoint_path).unwrap(),
        "{\"schema_version\": "
    );
    assert_eq!(api.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_second_process_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2, 2, None);
    let _held = RunLock::try_acquire(&config.checkpoint_path).unwrap();
    let api = Arc::new(MockSearchApi::new(2));

    let err = run(&config, &api).await.unwrap_err();

    assert!(matches!(err, ExportError::Configuration(_)));
    assert_eq!(api.call_count(), 0);
}

#[tokio::test]
async fn test_invalid_config_fails_before_any_request() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, 2, 2, None);
    config.page_size = 0;
    let api = Arc::new(MockSearchApi::new(2));

    let err = run(&config, &api).await.unwrap_err();

    assert!(matches!(err, ExportError::Configuration(_)));
    assert!(!config.checkpoint_path.exists());
}

/// Serves one page with records outside the window and one without a timestamp
struct StrayRecordsApi {
    window_end: DateTime<Utc>,
}

#[async_trait]
impl SearchApi for StrayRecordsApi {
    async fn search(&self, _request: &SearchRequest) -> FetcherResult<SearchPage> {
        let records = [
            json!({ "uuid": "no-time" }),
            json!({ "uuid": "at-end", "eventTime": self.window_end.to_rfc3339() }),
            json!({ "uuid": "inside", "eventTime": "2024-10-02T08:00:00Z" }),
            json!({ "uuid": "before", "eventTime": "2024-09-30T23:59:59Z" }),
        ];
        Ok(SearchPage {
            records: records
                .into_iter()
                .map(|v| v.as_object().unwrap().clone())
                .collect(),
            next_page_token: None,
        })
    }

    fn endpoint(&self) -> &str {
        "stray://"
    }
}

#[tokio::test(start_paused = true)]
async fn test_records_outside_window_are_dropped() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 1, 10, None);
    let api = Arc::new(StrayRecordsApi {
        window_end: range().1,
    });

    let result = RunController::new(config.clone(), api).run().await.unwrap();

    assert_eq!(result.total_written, 2);
    let csv = Csv::read(&config.output_path);
    assert_eq!(csv.column("uuid"), vec!["inside", "no-time"]);
}
