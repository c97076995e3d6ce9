//! CLI command implementations

use clap::{Parser, Subcommand};
use std::str::FromStr;

pub mod error;
pub mod export;
pub mod validate;

pub use error::CliError;
pub use export::ExportArgs;
pub use validate::ValidateCommand;

/// Detection Exporter CLI
#[derive(Parser, Debug)]
#[command(name = "detection-exporter")]
#[command(about = "Export Vision One detections into one ordered CSV file", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (json or human)
    #[arg(long, global = true, default_value = "human")]
    pub output_format: OutputFormat,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Export detections for a time range
    Export(ExportArgs),

    /// Inspect a checkpoint file
    Validate(ValidateCommand),
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" => Ok(OutputFormat::Human),
            _ => Err(format!("Invalid output format: {s}")),
        }
    }
}
