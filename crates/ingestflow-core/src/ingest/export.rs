//! File export of downloaded batches.
//!
//! When a task has a `save_path`, every executed batch is also written to
//! `{save_path}/{api_code}_{step_order}_{download_date}_{HHMMSS}[_comboN].{ext}`
//! as CSV or a JSON array of records.

use std::path::{Path, PathBuf};

use chrono::NaiveTime;
use ingestflow_types::schema::Record;
use ingestflow_types::workflow::SaveFormat;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Build the export file name for one batch.
pub fn export_file_name(
    api_code: &str,
    step_order: i32,
    download_date: &str,
    at: NaiveTime,
    combo_index: Option<usize>,
    format: SaveFormat,
) -> String {
    let combo = combo_index.map(|i| format!("_combo{i}")).unwrap_or_default();
    format!(
        "{api_code}_{step_order}_{download_date}_{}{combo}.{}",
        at.format("%H%M%S"),
        format.extension()
    )
}

/// Header for a CSV export: every field of every record, in first-seen order.
fn csv_header(records: &[Record]) -> Vec<&str> {
    let mut header: Vec<&str> = Vec::new();
    for record in records {
        for field in record.keys() {
            if !header.contains(&field.as_str()) {
                header.push(field);
            }
        }
    }
    header
}

fn csv_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Render records as UTF-8 CSV with a byte order mark and a header row.
pub fn render_csv(records: &[Record]) -> Result<Vec<u8>, ExportError> {
    let header = csv_header(records);
    let mut writer = csv::Writer::from_writer(b"\xEF\xBB\xBF".to_vec());
    writer.write_record(&header)?;
    for record in records {
        writer.write_record(header.iter().map(|field| csv_cell(record.get(*field))))?;
    }
    writer.into_inner().map_err(|e| ExportError::Io(e.into_error()))
}

/// Render records as a pretty-printed JSON array.
pub fn render_json(records: &[Record]) -> Result<Vec<u8>, ExportError> {
    Ok(serde_json::to_vec_pretty(records)?)
}

/// Write `records` to `dir/file_name`, creating `dir` if needed.
pub async fn export_records(
    dir: &Path,
    file_name: &str,
    format: SaveFormat,
    records: &[Record],
) -> Result<PathBuf, ExportError> {
    let bytes = match format {
        SaveFormat::Csv => render_csv(records)?,
        SaveFormat::Json => render_json(records)?,
    };
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(file_name);
    tokio::fs::write(&path, bytes).await?;
    tracing::info!(path = %path.display(), rows = records.len(), "batch exported");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn file_name_carries_step_date_time_and_combo() {
        let at = NaiveTime::from_hms_opt(9, 5, 7).unwrap();
        assert_eq!(
            export_file_name("daily", 2, "20240102", at, None, SaveFormat::Csv),
            "daily_2_20240102_090507.csv"
        );
        assert_eq!(
            export_file_name("daily", 2, "20240102", at, Some(3), SaveFormat::Json),
            "daily_2_20240102_090507_combo3.json"
        );
    }

    #[test]
    fn csv_has_union_header_and_blank_missing_cells() {
        let records = vec![
            record(json!({"close": 9.4, "ts_code": "000001.SZ"})),
            record(json!({"close": null, "ts_code": "600000.SH, A", "vol": 12})),
        ];
        let bytes = render_csv(&records).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let text = text.strip_prefix('\u{feff}').unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "close,ts_code,vol");
        assert_eq!(lines[1], "9.4,000001.SZ,");
        assert_eq!(lines[2], ",\"600000.SH, A\",12");
    }

    #[test]
    fn json_export_is_an_array_of_records() {
        let records = vec![record(json!({"a": 1})), record(json!({"a": 2}))];
        let parsed: Value = serde_json::from_slice(&render_json(&records).unwrap()).unwrap();
        assert_eq!(parsed, json!([{"a": 1}, {"a": 2}]));
    }

    #[tokio::test]
    async fn export_creates_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("exports").join("daily");
        let path = export_records(&dir, "daily.json", SaveFormat::Json, &[record(json!({"a": 1}))])
            .await
            .unwrap();
        assert_eq!(path, dir.join("daily.json"));
        assert!(path.exists());
    }
}
