use detection_exporter::output::flatten::parse_timestamp;
use detection_exporter::output::{extract_sort_key, flatten_record, CsvSink, RowKey, SinkRow};
use detection_exporter::RawRecord;
use serde_json::json;
use tempfile::TempDir;

fn detection() -> RawRecord {
    json!({
        "uuid": "d-1",
        "eventTime": "2024-10-02T03:04:05.678Z",
        "endpoint": {"hostname": "ws-17", "ips": ["10.1.1.1", "fe80::1"], "agentGuid": null},
        "filters": [{"id": "F1", "name": "Suspicious"}],
        "matchedRules": [],
        "detail": {},
        "score": 73,
        "isTest": false
    })
    .as_object()
    .unwrap()
    .clone()
}

#[test]
fn detection_flattens_to_dot_paths() {
    let row = flatten_record(&detection());
    let columns: Vec<&str> = row.columns().collect();
    assert_eq!(
        columns,
        vec![
            "uuid",
            "eventTime",
            "endpoint.hostname",
            "endpoint.ips",
            "endpoint.agentGuid",
            "filters",
            "matchedRules",
            "detail",
            "score",
            "isTest",
        ]
    );
    assert_eq!(row.get("endpoint.ips"), Some("10.1.1.1,fe80::1"));
    assert_eq!(row.get("endpoint.agentGuid"), Some(""));
    assert_eq!(row.get("filters"), Some(r#"{"id":"F1","name":"Suspicious"}"#));
    assert_eq!(row.get("matchedRules"), Some(""));
    assert_eq!(row.get("detail"), Some(""));
    assert_eq!(row.get("score"), Some("73"));
    assert_eq!(row.get("isTest"), Some("false"));
}

#[test]
fn sort_key_reads_the_configured_field() {
    let row = flatten_record(&detection());
    assert_eq!(extract_sort_key(&row, "eventTime"), Some(1_727_838_245_678));
    assert_eq!(extract_sort_key(&row, "missing"), None);
    assert_eq!(extract_sort_key(&row, "endpoint.hostname"), None);
}

#[test]
fn epoch_values_are_told_apart_by_magnitude() {
    assert_eq!(parse_timestamp("1727838245"), Some(1_727_838_245_000));
    assert_eq!(parse_timestamp("1727838245678"), Some(1_727_838_245_678));
    assert_eq!(parse_timestamp("1727838245.5"), Some(1_727_838_245_500));
    assert_eq!(parse_timestamp("2024-10-02T05:04:05+02:00"), Some(1_727_838_245_000));
    assert_eq!(parse_timestamp("  "), None);
    assert_eq!(parse_timestamp("yesterday"), None);
}

#[tokio::test]
async fn flattened_rows_land_in_the_csv_with_quoting() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("detections.csv");
    let sink = CsvSink::in_memory(&out);

    let mut quoted = detection();
    quoted.insert("uuid".into(), json!("d-0"));
    quoted.insert("eventTime".into(), json!("2024-10-01T00:00:00Z"));
    quoted.insert("description".into(), json!("line one\nsaid \"hi\""));

    let rows = [detection(), quoted]
        .iter()
        .enumerate()
        .map(|(position, record)| {
            let row = flatten_record(record);
            SinkRow {
                key: RowKey { window_index: 0, page: 1, position },
                sort_key: extract_sort_key(&row, "eventTime"),
                row,
            }
        })
        .collect();
    assert_eq!(sink.submit_page(rows).await.unwrap(), 2);
    sink.finalize().await.unwrap();

    let mut reader = csv::Reader::from_path(&out).unwrap();
    let header: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
    assert_eq!(header.last().map(String::as_str), Some("description"));
    let records: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
    assert_eq!(&records[0][0], "d-0");
    assert_eq!(&records[0][header.len() - 1], "line one\nsaid \"hi\"");
    assert_eq!(&records[1][0], "d-1");
    assert_eq!(&records[1][header.len() - 1], "");
}
