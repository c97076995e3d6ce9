//! Record flattening
//!
//! Turns one nested JSON record into ordered `(column, value)` string pairs.
//! Nested objects become dot-joined paths (`endpoint.hostname`); lists are
//! joined with `,`. A list element that itself contains `,` makes the join
//! lossy, which is accepted for this tabular format.

use chrono::DateTime;
use serde_json::Value;

use super::FlatRow;
use crate::RawRecord;

/// Separator between nested keys
pub const PATH_SEPARATOR: char = '.';

/// Separator between list elements
pub const LIST_SEPARATOR: &str = ",";

/// Values above this are epoch milliseconds, below are epoch seconds
const MILLIS_THRESHOLD: f64 = 1e11;

/// Flatten one record; column order follows the record's key order
pub fn flatten_record(record: &RawRecord) -> FlatRow {
    let mut fields = Vec::with_capacity(record.len());
    for (key, value) in record {
        flatten_into(key.clone(), value, &mut fields);
    }
    FlatRow::new(fields)
}

fn flatten_into(path: String, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) if map.is_empty() => out.push((path, String::new())),
        Value::Object(map) => {
            for (key, nested) in map {
                flatten_into(format!("{path}{PATH_SEPARATOR}{key}"), nested, out);
            }
        }
        Value::Array(items) => {
            let joined = items
                .iter()
                .map(list_element)
                .collect::<Vec<_>>()
                .join(LIST_SEPARATOR);
            out.push((path, joined));
        }
        scalar => out.push((path, scalar_text(scalar))),
    }
}

fn list_element(value: &Value) -> String {
    match value {
        // Compact JSON keeps nested structure readable in one cell
        Value::Object(_) | Value::Array(_) => value.to_string(),
        scalar => scalar_text(scalar),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Object(_) | Value::Array(_) => value.to_string(),
    }
}

/// Parse the timestamp column of a row into Unix milliseconds
///
/// Accepts RFC 3339 strings and numeric epoch values (seconds or
/// milliseconds, told apart by magnitude). Returns `None` when the column
/// is absent, empty or unparseable.
pub fn extract_sort_key(row: &FlatRow, field: &str) -> Option<i64> {
    parse_timestamp(row.get(field)?)
}

/// Parse one timestamp value into Unix milliseconds
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(int) = raw.parse::<i64>() {
        return Some(if int.unsigned_abs() as f64 > MILLIS_THRESHOLD {
            int
        } else {
            int.saturating_mul(1000)
        });
    }
    let float = raw.parse::<f64>().ok().filter(|f| f.is_finite())?;
    let millis = if float.abs() > MILLIS_THRESHOLD {
        float
    } else {
        float * 1000.0
    };
    Some(millis.round() as i64)
}
