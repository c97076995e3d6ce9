//! Durable row journal
//!
//! The sink buffers rows in memory until the run finalizes the CSV. To keep
//! the checkpoint from ever leading the data, every accepted page is first
//! appended to a JSON-lines spool and fsynced. On restart the spool is
//! replayed; a torn trailing line from a crash mid-append is dropped and
//! truncated away.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{OutputError, OutputResult, SinkRow};

/// `run.checkpoint.json` → `run.checkpoint.rows.jsonl`
pub fn spool_path_for(checkpoint_path: &Path) -> PathBuf {
    let stem = checkpoint_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".to_string());
    checkpoint_path.with_file_name(format!("{stem}.rows.jsonl"))
}

/// Append-only JSON-lines file of accepted rows
#[derive(Debug)]
pub struct Spool {
    path: PathBuf,
    file: File,
}

impl Spool {
    /// Open (creating if needed) and replay the spool
    pub fn open(path: impl Into<PathBuf>) -> OutputResult<(Self, Vec<SinkRow>)> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| OutputError::Io(format!("Failed to create directory: {e}")))?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| OutputError::Io(format!("Failed to open spool: {e}")))?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .map_err(|e| OutputError::Io(format!("Failed to read spool: {e}")))?;

        let (rows, valid_len) = replay(&contents, &path)?;
        if valid_len < contents.len() {
            warn!(
                path = %path.display(),
                dropped_bytes = contents.len() - valid_len,
                "Dropping torn trailing spool line"
            );
            file.set_len(valid_len as u64)
                .map_err(|e| OutputError::Io(format!("Failed to truncate spool: {e}")))?;
            file.sync_all()
                .map_err(|e| OutputError::Io(format!("Failed to sync spool: {e}")))?;
        }

        if !rows.is_empty() {
            info!(path = %path.display(), rows = rows.len(), "Replayed spooled rows");
        }
        Ok((Self { path, file }, rows))
    }

    /// Append rows and fsync before returning
    pub fn append(&mut self, rows: &[SinkRow]) -> OutputResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut writer = BufWriter::new(&mut self.file);
        for row in rows {
            serde_json::to_writer(&mut writer, row)
                .map_err(|e| OutputError::Serialization(e.to_string()))?;
            writer
                .write_all(b"\n")
                .map_err(|e| OutputError::Io(format!("Failed to append to spool: {e}")))?;
        }
        writer
            .flush()
            .map_err(|e| OutputError::Io(format!("Failed to flush spool: {e}")))?;
        drop(writer);

        self.file
            .sync_data()
            .map_err(|e| OutputError::Io(format!("Failed to sync spool: {e}")))?;
        debug!(rows = rows.len(), "Spooled rows");
        Ok(())
    }

    /// Path of the spool file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse complete lines; returns the rows and the byte length of the valid prefix
fn replay(contents: &[u8], path: &Path) -> OutputResult<(Vec<SinkRow>, usize)> {
    let mut rows = Vec::new();
    let mut offset = 0;

    while offset < contents.len() {
        let rest = &contents[offset..];
        let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
            // Unterminated tail: the append never completed
            break;
        };
        let line = &rest[..newline];
        let next_offset = offset + newline + 1;

        if !line.iter().all(u8::is_ascii_whitespace) {
            match serde_json::from_slice::<SinkRow>(line) {
                Ok(row) => rows.push(row),
                Err(e) if next_offset == contents.len() => {
                    warn!(path = %path.display(), error = %e, "Unparseable final spool line");
                    break;
                }
                Err(e) => {
                    return Err(OutputError::Serialization(format!(
                        "corrupt spool line at byte {offset} in {}: {e}",
                        path.display()
                    )));
                }
            }
        }
        offset = next_offset;
    }

    Ok((rows, offset))
}
