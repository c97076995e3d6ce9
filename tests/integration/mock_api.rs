//! In-process search API used by the export integration tests
//!
//! Each window gets a fixed number of generated records, served newest
//! first with an offset-based skip token. Failures can be injected per
//! window and page offset.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use detection_exporter::fetcher::{FetcherError, FetcherResult, SearchApi, SearchPage, SearchRequest};
use detection_exporter::shutdown::{SharedStop, StopReason};
use detection_exporter::RawRecord;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::time::Instant;

/// One recorded call
#[derive(Debug, Clone)]
pub struct Call {
    pub start: DateTime<Utc>,
    pub offset: usize,
    pub top: u32,
    pub query: Option<String>,
    pub at: Instant,
}

struct Injection {
    window_start: DateTime<Utc>,
    offset: usize,
    error: FetcherError,
    remaining: Option<u32>,
}

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    injections: Vec<Injection>,
    successes: usize,
    stop_after: Option<(usize, SharedStop)>,
}

/// Deterministic search API
pub struct MockSearchApi {
    records_per_window: usize,
    state: Mutex<MockState>,
}

impl MockSearchApi {
    pub fn new(records_per_window: usize) -> Self {
        Self {
            records_per_window,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Fail requests for the window starting at `window_start` at page `offset`;
    /// `times = None` fails forever
    pub fn fail_at(
        &self,
        window_start: DateTime<Utc>,
        offset: usize,
        error: FetcherError,
        times: Option<u32>,
    ) {
        self.state.lock().unwrap().injections.push(Injection {
            window_start,
            offset,
            error,
            remaining: times,
        });
    }

    /// Fail every request with `error`
    pub fn fail_everything(&self, error: FetcherError) {
        self.state.lock().unwrap().injections.push(Injection {
            window_start: DateTime::<Utc>::MIN_UTC,
            offset: usize::MAX,
            error,
            remaining: None,
        });
    }

    /// Request an interrupt once `successes` pages have been served
    pub fn interrupt_after(&self, successes: usize, stop: SharedStop) {
        self.state.lock().unwrap().stop_after = Some((successes, stop));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    pub fn calls_for(&self, window_start: DateTime<Utc>) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.start == window_start)
            .collect()
    }

    /// Every record of a window, oldest first
    pub fn records_for(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<RawRecord> {
        let n = self.records_per_window;
        let span = (end - start).num_milliseconds();
        (0..n)
            .map(|i| {
                let at = start + ChronoDuration::milliseconds(span * (i as i64 + 1) / (n as i64 + 1));
                let mut record = json!({
                    "uuid": format!("{}-{i}", start.timestamp_millis()),
                    "eventTime": at.to_rfc3339_opts(SecondsFormat::Millis, true),
                    "severity": if i % 3 == 0 { "high" } else { "low" },
                });
                let obj = record.as_object_mut().unwrap();
                if i % 2 == 0 {
                    obj.insert("endpoint".into(), json!({ "hostname": format!("host-{i}"), "ips": ["10.0.0.1", "10.0.0.2"] }));
                } else {
                    obj.insert("tags".into(), json!(["XSAE.F1", "MITRE.T1059"]));
                }
                obj.clone()
            })
            .collect()
    }
}

#[async_trait]
impl SearchApi for MockSearchApi {
    async fn search(&self, request: &SearchRequest) -> FetcherResult<SearchPage> {
        let offset: usize = request
            .page_token
            .as_deref()
            .map(|t| t.parse().expect("mock token"))
            .unwrap_or(0);

        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            start: request.start,
            offset,
            top: request.top,
            query: request.query_filter.clone(),
            at: Instant::now(),
        });

        for injection in state.injections.iter_mut() {
            let everything = injection.offset == usize::MAX;
            let matches = everything
                || (injection.window_start == request.start && injection.offset == offset);
            if !matches {
                continue;
            }
            match injection.remaining.as_mut() {
                None => return Err(injection.error.clone()),
                Some(0) => continue,
                Some(n) => {
                    *n -= 1;
                    return Err(injection.error.clone());
                }
            }
        }

        // Newest first, like the real endpoint
        let mut all = self.records_for(request.start, request.end);
        all.reverse();
        let upto = (offset + request.top as usize).min(all.len());
        let records = all[offset.min(upto)..upto].to_vec();
        let next_page_token = (upto < all.len()).then(|| upto.to_string());

        state.successes += 1;
        if let Some((after, stop)) = &state.stop_after {
            if state.successes >= *after {
                stop.request_stop(StopReason::Interrupted);
            }
        }

        Ok(SearchPage {
            records,
            next_page_token,
        })
    }

    fn endpoint(&self) -> &str {
        "mock://search/detections"
    }
}
