//! Validation subcommand

use clap::Parser;
use std::path::{Path, PathBuf};

use super::{CliError, OutputFormat};
use crate::output::spool_path_for;
use crate::resume::{load_checkpoint, Checkpoint};

/// Validate command for checking a checkpoint file
#[derive(Parser, Debug)]
pub struct ValidateCommand {
    /// Checkpoint file to inspect
    #[arg(long, default_value = "detections.checkpoint.json")]
    pub checkpoint: PathBuf,
}

impl ValidateCommand {
    /// Load the checkpoint and report what a resumed run would still fetch
    ///
    /// A missing file is not an error; a corrupt one is.
    pub async fn execute(&self, format: OutputFormat) -> Result<(), CliError> {
        let checkpoint = match load_checkpoint(&self.checkpoint) {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => {
                match format {
                    OutputFormat::Json => println!(
                        "{}",
                        serde_json::json!({ "valid": true, "exists": false })
                    ),
                    OutputFormat::Human => {
                        println!("No checkpoint found at {}", self.checkpoint.display())
                    }
                }
                return Ok(());
            }
            Err(e) => {
                match format {
                    OutputFormat::Json => println!(
                        "{}",
                        serde_json::json!({ "valid": false, "exists": true, "error": e.to_string() })
                    ),
                    OutputFormat::Human => {
                        eprintln!("Invalid checkpoint {}: {e}", self.checkpoint.display());
                        eprintln!("Use `export --resume reset` to start over.");
                    }
                }
                return Err(e.into());
            }
        };

        let spool = spool_path_for(&self.checkpoint);
        match format {
            OutputFormat::Json => print_json(&checkpoint, &spool),
            OutputFormat::Human => print_human(&self.checkpoint, &checkpoint, &spool),
        }
        Ok(())
    }
}

fn print_json(checkpoint: &Checkpoint, spool: &Path) {
    let remaining: Vec<usize> = checkpoint
        .unfinished_windows()
        .map(|w| w.window_index)
        .collect();
    let output = serde_json::json!({
        "valid": true,
        "exists": true,
        "completed": checkpoint.completed,
        "total_written": checkpoint.total_written,
        "remaining_windows": remaining,
        "spool_present": spool.exists(),
        "checkpoint": checkpoint,
    });
    println!("{output}");
}

fn print_human(path: &Path, checkpoint: &Checkpoint, spool: &Path) {
    println!("Checkpoint: {} (schema {})", path.display(), checkpoint.schema_version);
    println!(
        "Range: {} .. {} across {} windows",
        checkpoint.global_start,
        checkpoint.global_end,
        checkpoint.windows.len()
    );
    println!("Records written so far: {}", checkpoint.total_written);

    if checkpoint.completed {
        println!("Status: completed, a rerun fetches nothing");
        return;
    }

    for w in &checkpoint.windows {
        let state = if w.finished {
            "done".to_string()
        } else if w.pages_completed == 0 && w.records_fetched == 0 {
            "not started".to_string()
        } else {
            format!("resumes at page {}", w.pages_completed + 1)
        };
        println!(
            "  window {}: {} .. {} - {} records, {} pages, {}",
            w.window_index, w.start, w.end, w.records_fetched, w.pages_completed, state
        );
    }
    let remaining = checkpoint.unfinished_windows().count();
    println!("Status: {remaining} window(s) still to fetch");
    if spool.exists() {
        println!("Buffered rows: {}", spool.display());
    }
}
