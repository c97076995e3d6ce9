//! Main entry point for the detection-exporter CLI

use clap::Parser;
use detection_exporter::cli::export::exit_code;
use detection_exporter::cli::{Cli, Commands};
use detection_exporter::shutdown::{StopReason, StopSignal};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber with optional JSON formatting
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("detection_exporter=info"));

    // Logs go to stderr so `--output-format json` keeps stdout machine-readable
    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();

    // Ctrl+C stops every window after its current page
    let stop = StopSignal::shared();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Ctrl+C received - finishing current pages and saving progress...");
                stop.request_stop(StopReason::Interrupted);
            }
        }
    });

    let result = match cli.command {
        Commands::Export(ref args) => args
            .execute(cli.output_format, stop.clone())
            .await
            .map(|run| exit_code(&run))
            .map_err(|e| anyhow::anyhow!(e)),
        Commands::Validate(ref validate_cmd) => validate_cmd
            .execute(cli.output_format)
            .await
            .map(|_| 0)
            .map_err(|e| anyhow::anyhow!(e)),
    };

    match result {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Command failed: {}", e);
            std::process::exit(1);
        }
    }
}
