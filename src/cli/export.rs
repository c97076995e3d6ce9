//! Export command implementation

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Utc};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use super::{CliError, OutputFormat};
use crate::downloader::config::{
    default_checkpoint_path, DEFAULT_MAX_RESULTS, DEFAULT_PAGE_SIZE, DEFAULT_PER_HOUR,
    DEFAULT_PER_MINUTE, DEFAULT_PER_SECOND, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_TIMESTAMP_FIELD, DEFAULT_WORKERS, MAX_PAGE_SIZE, MAX_RETRIES, MAX_WORKERS,
};
use crate::downloader::{ExportConfig, RateCeilings, ResumeMode, RunController, RunResult};
use crate::fetcher::vision_one::{ApiConfig, VisionOneClient, DEFAULT_API_BASE_URL};
use crate::shutdown::SharedStop;

/// Date-only inputs accepted by `--start` / `--end`
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m-%d-%Y"];

/// Try to parse an RFC 3339 datetime, assuming UTC when no offset is given
fn try_parse_datetime(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.and_utc());
    }
    None
}

fn try_parse_date(input: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(input.trim(), fmt).ok())
}

/// Parse a start time from YYYY-MM-DD, MM-DD-YYYY or RFC 3339.
///
/// Date-only input means midnight UTC at the start of that day.
pub fn parse_start_time(input: &str) -> Result<DateTime<Utc>, CliError> {
    if let Some(dt) = try_parse_datetime(input) {
        return Ok(dt);
    }
    try_parse_date(input)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| {
            CliError::InvalidArgument(format!(
                "Invalid start time '{input}': use YYYY-MM-DD, MM-DD-YYYY or RFC 3339"
            ))
        })
}

/// Parse an end time from YYYY-MM-DD, MM-DD-YYYY or RFC 3339.
///
/// Date-only input covers that whole day: the (exclusive) end is the
/// following midnight UTC.
pub fn parse_end_time(input: &str) -> Result<DateTime<Utc>, CliError> {
    if let Some(dt) = try_parse_datetime(input) {
        return Ok(dt);
    }
    try_parse_date(input)
        .and_then(|date| date.succ_opt())
        .and_then(|next| next.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| {
            CliError::InvalidArgument(format!(
                "Invalid end time '{input}': use YYYY-MM-DD, MM-DD-YYYY or RFC 3339"
            ))
        })
}

fn parse_workers(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if value == 0 {
        return Err("workers must be at least 1".to_string());
    }
    if value > MAX_WORKERS {
        return Err(format!("workers {value} exceeds maximum of {MAX_WORKERS}"));
    }
    Ok(value)
}

/// Arguments of the `export` command
#[derive(Parser, Debug, Clone)]
pub struct ExportArgs {
    /// Start of the range (YYYY-MM-DD, MM-DD-YYYY or RFC 3339)
    #[arg(long, requires = "end", conflicts_with = "days")]
    pub start: Option<String>,

    /// End of the range, exclusive; a bare date includes that whole day
    #[arg(long, requires = "start", conflicts_with = "days")]
    pub end: Option<String>,

    /// Export the last N days instead of a fixed range
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub days: Option<u32>,

    /// Search filter sent as the TMV1-Query header (e.g. "productCode:PTP AND act:Block")
    #[arg(long)]
    pub query: Option<String>,

    /// Maximum number of records across all windows
    #[arg(long, default_value_t = DEFAULT_MAX_RESULTS, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_results: u64,

    /// Export every matching record (ignores --max-results)
    #[arg(long, default_value_t = false)]
    pub unlimited: bool,

    /// Records per API call (max 5000)
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE, value_parser = clap::value_parser!(u32).range(1..=MAX_PAGE_SIZE as i64))]
    pub page_size: u32,

    /// Number of concurrent windows (default: 4, max: 32)
    ///
    /// The range is split into this many equal windows, each paged by its
    /// own worker. All workers share the same rate limiter.
    #[arg(long, default_value_t = DEFAULT_WORKERS, value_parser = parse_workers)]
    pub workers: usize,

    /// Request ceiling per trailing second
    #[arg(long, default_value_t = DEFAULT_PER_SECOND)]
    pub per_second: u32,

    /// Request ceiling per trailing minute
    #[arg(long, default_value_t = DEFAULT_PER_MINUTE)]
    pub per_minute: u32,

    /// Request ceiling per trailing hour
    #[arg(long, default_value_t = DEFAULT_PER_HOUR)]
    pub per_hour: u32,

    /// HTTP request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout_secs: u64,

    /// Output CSV file
    #[arg(long, default_value = "detections.csv")]
    pub output: PathBuf,

    /// Checkpoint file (default: <output stem>.checkpoint.json next to the output)
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// Record field used to order the output
    #[arg(long, default_value = DEFAULT_TIMESTAMP_FIELD)]
    pub timestamp_field: String,

    /// Maximum number of retries for a failed page (range: 0-20)
    #[arg(long, default_value_t = MAX_RETRIES, value_parser = clap::value_parser!(u32).range(0..=20))]
    pub max_retries: u32,

    /// API host
    #[arg(long, default_value = DEFAULT_API_BASE_URL)]
    pub api_base_url: String,

    /// Vision One API token
    #[arg(long, env = "V1_API_TOKEN", hide_env_values = true)]
    pub api_token: String,

    /// Resume mode: on or reset
    #[arg(long, default_value = "on")]
    pub resume: ResumeMode,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9000)
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}

impl ExportArgs {
    /// Resolve the requested range against `now`
    pub fn time_range(&self, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>), CliError> {
        let (start, end) = match (self.days, &self.start, &self.end) {
            (Some(days), None, None) => (now - ChronoDuration::days(days as i64), now),
            (None, Some(start), Some(end)) => (parse_start_time(start)?, parse_end_time(end)?),
            (Some(_), _, _) => {
                return Err(CliError::InvalidArgument(
                    "use either --days or --start/--end, not both".to_string(),
                ))
            }
            _ => {
                return Err(CliError::InvalidArgument(
                    "specify --days or both --start and --end".to_string(),
                ))
            }
        };
        if end <= start {
            return Err(CliError::InvalidArgument(format!(
                "end ({end}) must be after start ({start})"
            )));
        }
        Ok((start, end))
    }

    /// Build the validated run configuration
    pub fn export_config(&self, now: DateTime<Utc>) -> Result<ExportConfig, CliError> {
        let (start, end) = self.time_range(now)?;

        let mut config = ExportConfig::new(start, end, self.output.clone());
        config.max_results = (!self.unlimited).then_some(self.max_results);
        config.page_size = self.page_size;
        config.worker_count = self.workers;
        config.rate = RateCeilings {
            per_second: self.per_second,
            per_minute: self.per_minute,
            per_hour: self.per_hour,
        };
        config.request_timeout = Duration::from_secs(self.timeout_secs);
        config.query_filter = self
            .query
            .as_ref()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty());
        config.checkpoint_path = self
            .checkpoint
            .clone()
            .unwrap_or_else(|| default_checkpoint_path(&self.output));
        config.timestamp_field = self.timestamp_field.clone();
        config.max_retries = self.max_retries;
        config.resume = self.resume;

        config.validate().map_err(CliError::ConfigurationError)?;
        Ok(config)
    }

    /// Build the API client configuration
    pub fn api_config(&self) -> Result<ApiConfig, CliError> {
        let api = ApiConfig::new(self.api_token.clone())
            .with_base_url(self.api_base_url.clone())
            .with_timeout(Duration::from_secs(self.timeout_secs));
        api.validate().map_err(CliError::ConfigurationError)?;
        Ok(api)
    }

    /// Run the export and print the outcome
    pub async fn execute(
        &self,
        format: OutputFormat,
        stop: SharedStop,
    ) -> Result<RunResult, CliError> {
        let result = self.run(stop).await;
        match format {
            OutputFormat::Json => output_json(&result),
            OutputFormat::Human => output_human(&result),
        }
        result
    }

    async fn run(&self, stop: SharedStop) -> Result<RunResult, CliError> {
        let config = self.export_config(Utc::now())?;
        let api = self.api_config()?;

        if let Some(addr) = self.metrics_addr {
            crate::metrics::init_metrics(addr)
                .await
                .map_err(|e| CliError::ConfigurationError(format!("metrics exporter: {e}")))?;
            info!(%addr, "Prometheus metrics exporter listening");
        }

        let client = VisionOneClient::new(api)?;
        info!(
            start = %config.global_start,
            end = %config.global_end,
            output = %config.output_path.display(),
            query = config.query_filter.as_deref().unwrap_or(""),
            "Export requested"
        );

        let controller = RunController::new(config, Arc::new(client)).with_stop(stop);
        Ok(controller.run().await?)
    }
}

/// Process exit code for a finished run: 0 complete, 2 incomplete
pub fn exit_code(result: &RunResult) -> i32 {
    if result.is_success() {
        0
    } else {
        2
    }
}

fn output_json(result: &Result<RunResult, CliError>) {
    let output = match result {
        Ok(run) => serde_json::json!({
            "success": run.is_success(),
            "result": run,
            "error": serde_json::Value::Null,
        }),
        Err(e) => serde_json::json!({
            "success": false,
            "result": serde_json::Value::Null,
            "error": e.to_string(),
        }),
    };
    match serde_json::to_string(&output) {
        Ok(line) => println!("{line}"),
        Err(e) => error!("Failed to serialize result: {}", e),
    }
}

fn output_human(result: &Result<RunResult, CliError>) {
    match result {
        Ok(run) if run.already_complete => {
            println!("\nNothing to do: the checkpoint for this range is already complete.");
            println!("Output: {}", run.output_path.display());
            println!("Records: {}", run.total_written);
            println!("Use --resume reset to export again.");
        }
        Ok(run) => {
            if run.is_success() {
                println!("\nExport completed successfully!");
            } else if run.was_interrupted() {
                println!("\nExport interrupted; rerun the same command to resume.");
            } else {
                println!("\nExport finished with failed windows; rerun the same command to resume them.");
            }
            println!("Output: {}", run.output_path.display());
            println!("Records written: {}", run.total_written);
            println!("New this run: {}", run.new_records);
            if run.total_errors > 0 {
                println!("Request errors: {}", run.total_errors);
            }
            println!("Elapsed: {:.1}s", run.elapsed.as_secs_f64());
            for window in run.windows.iter().filter(|w| !w.status.is_success()) {
                println!(
                    "  window {} {} [{}] after {} pages: {}",
                    window.window.index,
                    window.window,
                    window.status,
                    window.last_cursor.pages_completed,
                    window.error.as_deref().unwrap_or("stopped")
                );
            }
        }
        Err(e) => {
            eprintln!("\nExport failed!");
            eprintln!("Error: {e}");
        }
    }
}
