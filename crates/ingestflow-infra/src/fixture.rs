//! File-backed data-source client.
//!
//! Serves each api code from `{dir}/{api_code}.json`, a JSON array of flat
//! objects. A row is returned only when it agrees with every request
//! parameter it also carries as a field, so one fixture file can answer a
//! whole loop of combinations. A missing file yields no rows.

use std::path::{Path, PathBuf};

use ingestflow_core::ingest::client::{ClientError, DataSourceClient};
use ingestflow_types::schema::Record;
use serde_json::Value;

/// `DataSourceClient` reading canned responses from a directory.
pub struct FixtureClient {
    dir: PathBuf,
}

impl FixtureClient {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn fixture_path(&self, api_code: &str) -> Result<PathBuf, ClientError> {
        let valid = !api_code.is_empty()
            && api_code
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
            && !api_code.starts_with('.');
        if !valid {
            return Err(ClientError::Request(format!("invalid api code '{api_code}'")));
        }
        Ok(self.dir.join(format!("{api_code}.json")))
    }
}

/// Compare loosely so `"600000"` in a request matches `600000` in a row.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x == y,
        (Value::String(s), other) | (other, Value::String(s)) => other.to_string() == *s,
        _ => a == b,
    }
}

fn row_matches(row: &Record, params: &Record) -> bool {
    params.iter().all(|(key, wanted)| match row.get(key) {
        Some(actual) => wanted.is_null() || loosely_equal(actual, wanted),
        None => true,
    })
}

impl DataSourceClient for FixtureClient {
    async fn invoke(&self, api_code: &str, params: &Record) -> Result<Vec<Record>, ClientError> {
        let path = self.fixture_path(api_code)?;

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(api_code, path = %path.display(), "no fixture file, returning no rows");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(ClientError::Request(format!(
                    "failed to read {}: {err}",
                    path.display()
                )));
            }
        };

        let rows: Vec<Value> = serde_json::from_str(&content)
            .map_err(|e| ClientError::InvalidResponse(format!("{}: {e}", path.display())))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match row {
                Value::Object(record) => {
                    if row_matches(&record, params) {
                        records.push(record);
                    }
                }
                other => {
                    return Err(ClientError::InvalidResponse(format!(
                        "{}: expected an object row, got {other}",
                        path.display()
                    )));
                }
            }
        }

        tracing::debug!(api_code, rows = records.len(), "fixture response");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn params(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn missing_fixture_returns_no_rows() {
        let tmp = TempDir::new().unwrap();
        let client = FixtureClient::new(tmp.path());
        let rows = client.invoke("stock_basic", &Record::new()).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn rows_are_filtered_by_shared_params() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("daily.json"),
            json!([
                {"ts_code": "000001.SZ", "trade_date": "20240102", "close": 9.4},
                {"ts_code": "600000.SH", "trade_date": "20240102", "close": 7.1},
                {"ts_code": "600000.SH", "trade_date": "20240103", "close": 7.2}
            ])
            .to_string(),
        )
        .unwrap();
        let client = FixtureClient::new(tmp.path());

        let rows = client
            .invoke("daily", &params(json!({"ts_code": "600000.SH", "adj": "qfq"})))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        let rows = client
            .invoke("daily", &params(json!({"ts_code": "600000.SH", "trade_date": 20240103})))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["close"], json!(7.2));
    }

    #[tokio::test]
    async fn malformed_fixture_is_invalid_response() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("bad.json"), "[1, 2]").unwrap();
        let client = FixtureClient::new(tmp.path());
        let err = client.invoke("bad", &Record::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn path_like_api_codes_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let client = FixtureClient::new(tmp.path());
        let err = client.invoke("../secrets", &Record::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::Request(_)));
    }
}
