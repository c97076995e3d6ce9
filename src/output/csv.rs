//! Ordered CSV sink
//!
//! Rows from every window are buffered, de-duplicated by [`RowKey`] and
//! written once at the end, sorted by event time, under a header that is
//! the first-seen union of all columns. The output file is replaced
//! atomically, so readers never see a half-written CSV.

use csv::Writer;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::spool::Spool;
use super::{FlatRow, OutputError, OutputResult, RowKey, SinkRow};

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug)]
struct StoredRow {
    sort_key: Option<i64>,
    row: FlatRow,
}

#[derive(Debug, Default)]
struct SinkState {
    columns: Vec<String>,
    column_set: HashSet<String>,
    rows: BTreeMap<RowKey, StoredRow>,
    window_rows: HashMap<usize, u64>,
    spool: Option<Spool>,
    duplicates: u64,
}

impl SinkState {
    fn accept(&mut self, row: SinkRow) {
        for column in row.row.columns() {
            if !self.column_set.contains(column) {
                self.column_set.insert(column.to_string());
                self.columns.push(column.to_string());
            }
        }
        *self.window_rows.entry(row.key.window_index).or_insert(0) += 1;
        self.rows.insert(
            row.key,
            StoredRow {
                sort_key: row.sort_key,
                row: row.row,
            },
        );
    }
}

/// Result of writing the final file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeSummary {
    /// Data rows written (excluding the header)
    pub rows: usize,
    /// Columns in the header
    pub columns: usize,
    /// Final output path
    pub path: PathBuf,
}

/// Thread-safe buffered CSV sink with a durable spool
#[derive(Debug)]
pub struct CsvSink {
    output_path: PathBuf,
    state: Mutex<SinkState>,
}

impl CsvSink {
    /// Sink without a spool; rows live only in memory until finalize
    pub fn in_memory(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            state: Mutex::new(SinkState::default()),
        }
    }

    /// Sink backed by a spool file, replaying any rows it already holds
    pub fn open(output_path: impl Into<PathBuf>, spool_path: impl Into<PathBuf>) -> OutputResult<Self> {
        let output_path = output_path.into();
        let (spool, replayed) = Spool::open(spool_path)?;

        let mut state = SinkState::default();
        for row in replayed {
            if state.rows.contains_key(&row.key) {
                state.duplicates += 1;
                continue;
            }
            state.accept(row);
        }
        state.spool = Some(spool);

        info!(
            path = %output_path.display(),
            buffered_rows = state.rows.len(),
            columns = state.columns.len(),
            "CSV sink opened"
        );
        Ok(Self {
            output_path,
            state: Mutex::new(state),
        })
    }

    /// Submit one row
    pub async fn submit(&self, row: SinkRow) -> OutputResult<usize> {
        self.submit_page(vec![row]).await
    }

    /// Submit a page of rows; returns how many were new
    ///
    /// Rows whose key was already accepted are ignored. New rows reach the
    /// spool (fsynced) before this returns.
    pub async fn submit_page(&self, rows: Vec<SinkRow>) -> OutputResult<usize> {
        let mut state = self.state.lock().await;

        let mut seen_in_page = HashSet::new();
        let mut fresh = Vec::with_capacity(rows.len());
        for row in rows {
            if state.rows.contains_key(&row.key) || !seen_in_page.insert(row.key) {
                state.duplicates += 1;
                continue;
            }
            fresh.push(row);
        }

        if let Some(spool) = state.spool.as_mut() {
            spool.append(&fresh)?;
        }

        let accepted = fresh.len();
        for row in fresh {
            state.accept(row);
        }
        debug!(accepted, buffered = state.rows.len(), "Rows submitted to sink");
        Ok(accepted)
    }

    /// Number of distinct rows buffered
    pub async fn row_count(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    /// Number of distinct rows buffered for one window
    pub async fn rows_for_window(&self, window_index: usize) -> u64 {
        self.state
            .lock()
            .await
            .window_rows
            .get(&window_index)
            .copied()
            .unwrap_or(0)
    }

    /// Current header in first-seen order
    pub async fn columns(&self) -> Vec<String> {
        self.state.lock().await.columns.clone()
    }

    /// Submissions ignored because their key was already present
    pub async fn duplicates(&self) -> u64 {
        self.state.lock().await.duplicates
    }

    /// Output path the sink finalizes to
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Sort every buffered row and atomically write the CSV
    ///
    /// Rows without a sort key go last; ties break by [`RowKey`].
    pub async fn finalize(&self) -> OutputResult<FinalizeSummary> {
        let state = self.state.lock().await;

        let mut ordered: Vec<(&RowKey, &StoredRow)> = state.rows.iter().collect();
        ordered.sort_by_key(|(key, stored)| (stored.sort_key.is_none(), stored.sort_key, **key));

        let parent_dir = match self.output_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent_dir)
            .map_err(|e| OutputError::Io(format!("Failed to create directory: {e}")))?;
        let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)
            .map_err(|e| OutputError::Io(format!("Failed to create temp file: {e}")))?;

        {
            let buf_writer = BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, temp_file.as_file_mut());
            let mut writer = Writer::from_writer(buf_writer);
            write_rows(&mut writer, &state.columns, &ordered)?;
            let mut buf_writer = writer
                .into_inner()
                .map_err(|e| OutputError::Io(format!("Failed to flush CSV writer: {e}")))?;
            buf_writer
                .flush()
                .map_err(|e| OutputError::Io(format!("Failed to flush CSV file: {e}")))?;
        }

        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| OutputError::Io(format!("Failed to sync CSV file: {e}")))?;
        temp_file
            .persist(&self.output_path)
            .map_err(|e| OutputError::Io(format!("Failed to replace output file: {e}")))?;
        if let Ok(dir) = std::fs::File::open(parent_dir) {
            let _ = dir.sync_all();
        }

        let summary = FinalizeSummary {
            rows: ordered.len(),
            columns: state.columns.len(),
            path: self.output_path.clone(),
        };
        info!(
            path = %summary.path.display(),
            rows = summary.rows,
            columns = summary.columns,
            "CSV written"
        );
        Ok(summary)
    }

    /// Close and delete the spool after a fully successful run
    pub async fn discard_spool(&self) -> OutputResult<()> {
        let mut state = self.state.lock().await;
        if let Some(spool) = state.spool.take() {
            let path = spool.path().to_path_buf();
            drop(spool);
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Spool removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(OutputError::Io(format!("Failed to remove spool: {e}"))),
            }
        }
        Ok(())
    }
}

fn write_rows<W: Write>(
    writer: &mut Writer<W>,
    columns: &[String],
    rows: &[(&RowKey, &StoredRow)],
) -> OutputResult<()> {
    if columns.is_empty() {
        return Ok(());
    }
    writer
        .write_record(columns)
        .map_err(|e| OutputError::Csv(format!("Failed to write header: {e}")))?;

    let index: HashMap<&str, usize> = columns
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    let mut record: Vec<&str> = vec![""; columns.len()];
    for (key, stored) in rows {
        record.iter_mut().for_each(|cell| *cell = "");
        for (name, value) in stored.row.iter().rev() {
            // Reverse so the first occurrence of a repeated path wins
            if let Some(&i) = index.get(name) {
                record[i] = value;
            }
        }
        writer.write_record(&record).map_err(|e| {
            OutputError::Csv(format!(
                "Failed to write row (window {}, page {}, position {}): {e}",
                key.window_index, key.page, key.position
            ))
        })?;
    }
    Ok(())
}
