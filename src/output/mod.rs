//! Record flattening and CSV output

use serde::{Deserialize, Serialize};

pub mod csv;
pub mod flatten;
pub mod spool;

pub use self::csv::{CsvSink, FinalizeSummary};
pub use flatten::{extract_sort_key, flatten_record};
pub use spool::{spool_path_for, Spool};

/// Output writer errors
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// CSV write error
    #[error("CSV error: {0}")]
    Csv(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

/// Identity of a record within a run: which window, which page, which slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey {
    /// Window the record came from
    pub window_index: usize,
    /// Page number within the window (1-based)
    pub page: u64,
    /// Position within the page
    pub position: usize,
}

/// Ordered `(column, value)` pairs derived from one record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlatRow {
    fields: Vec<(String, String)>,
}

impl FlatRow {
    /// Build a row from pairs, keeping their order
    pub fn new(fields: Vec<(String, String)>) -> Self {
        Self { fields }
    }

    /// Value of a column; the first occurrence wins if a path repeats
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    /// Column names in row order
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// Pairs in row order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&str, &str)> + '_ {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of pairs
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the row has no columns
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A flattened record on its way into the sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkRow {
    /// Run-wide identity used for de-duplication
    pub key: RowKey,
    /// Event time in Unix milliseconds, if the record carried one
    pub sort_key: Option<i64>,
    /// Flattened record
    pub row: FlatRow,
}
