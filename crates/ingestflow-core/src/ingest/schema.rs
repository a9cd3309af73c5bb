//! Schema & key management for dynamically named target tables.
//!
//! Target tables are created on first write from the shape of the result
//! batch. Column types are inferred from JSON values; table names are
//! validated and column names sanitized before they ever reach SQL.
//!
//! The unique-key boundary used by merge modes is resolved by a fixed
//! priority (see [`SchemaManager::resolve_unique_key`]).

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, NaiveDateTime};
use ingestflow_types::error::StoreError;
use ingestflow_types::schema::{
    BOOKKEEPING_COLUMNS, CREATE_TIME_COLUMN, ColumnSpec, Record, SURROGATE_KEY_COLUMN, SqlType,
    TableSpec,
};
use serde_json::Value;

use crate::repository::table::TableTransaction;

/// Longest identifier accepted by every supported dialect.
pub const MAX_IDENTIFIER_LEN: usize = 63;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Accept only `^[A-Za-z_][A-Za-z0-9_]*$`, at most 63 characters.
pub fn validate_table_name(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid_start && valid_rest && name.len() <= MAX_IDENTIFIER_LEN {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// Map a result field name to a safe column name.
///
/// Every character other than ASCII alphanumerics and `_` becomes `_`; a
/// leading digit gets a `col_` prefix; an empty name becomes `col_`.
pub fn sanitize_column_name(name: &str) -> String {
    let mut out: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "col_");
    }
    out
}

/// Whether a sanitized column name collides with an engine-managed column.
pub fn is_reserved_column(name: &str) -> bool {
    name == SURROGATE_KEY_COLUMN
        || name == CREATE_TIME_COLUMN
        || BOOKKEEPING_COLUMNS.contains(&name)
}

/// Name of the unique index created over `columns`: `uk_{table}_{cols}`,
/// cut to 63 characters.
pub fn unique_index_name(table: &str, columns: &[String]) -> String {
    format!("uk_{}_{}", table, columns.join("_"))
        .chars()
        .take(MAX_IDENTIFIER_LEN)
        .collect()
}

// ---------------------------------------------------------------------------
// Type inference
// ---------------------------------------------------------------------------

fn looks_like_timestamp(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").is_ok()
}

#[derive(Debug, Default)]
struct Observed {
    bools: usize,
    ints: usize,
    floats: usize,
    timestamps: usize,
    strings: usize,
    nested: usize,
    max_len: usize,
}

impl Observed {
    fn record(&mut self, value: &Value) {
        match value {
            Value::Null => {}
            Value::Bool(_) => self.bools += 1,
            Value::Number(n) if n.is_i64() => self.ints += 1,
            // above i64::MAX, stored as digits
            Value::Number(n) if n.is_u64() => {
                self.max_len = self.max_len.max(n.to_string().len());
                self.strings += 1;
            }
            Value::Number(_) => self.floats += 1,
            Value::String(s) => {
                self.max_len = self.max_len.max(s.chars().count());
                if looks_like_timestamp(s) {
                    self.timestamps += 1;
                } else {
                    self.strings += 1;
                }
            }
            Value::Array(_) | Value::Object(_) => {
                self.max_len = self.max_len.max(value.to_string().chars().count());
                self.nested += 1;
            }
        }
    }

    fn non_null(&self) -> usize {
        self.bools + self.ints + self.floats + self.timestamps + self.strings + self.nested
    }

    fn infer(&self, text_len: u32) -> SqlType {
        let total = self.non_null();
        let bounded_text = if self.max_len <= text_len as usize {
            SqlType::Varchar(text_len)
        } else {
            SqlType::Text
        };
        if total == 0 {
            return SqlType::Varchar(text_len);
        }
        if self.bools == total {
            SqlType::Boolean
        } else if self.ints == total {
            SqlType::BigInt
        } else if self.ints + self.floats == total {
            SqlType::Double
        } else if self.timestamps == total {
            SqlType::Timestamp
        } else {
            bounded_text
        }
    }
}

/// Infer data columns from a batch, in first-occurrence order.
///
/// Field names are sanitized; fields that collide with engine-managed
/// columns are left out with a warning.
pub fn infer_columns(records: &[Record], text_column_length: u32) -> Vec<ColumnSpec> {
    let mut order: Vec<String> = Vec::new();
    let mut observed: Vec<Observed> = Vec::new();

    for record in records {
        for (field, value) in record {
            let name = sanitize_column_name(field);
            if is_reserved_column(&name) {
                continue;
            }
            let idx = match order.iter().position(|n| n == &name) {
                Some(i) => i,
                None => {
                    order.push(name);
                    observed.push(Observed::default());
                    order.len() - 1
                }
            };
            observed[idx].record(value);
        }
    }

    let reserved: Vec<&String> = records
        .first()
        .map(|r| r.keys().filter(|k| is_reserved_column(&sanitize_column_name(k))).collect())
        .unwrap_or_default();
    if !reserved.is_empty() {
        tracing::warn!(fields = ?reserved, "result fields collide with bookkeeping columns and are ignored");
    }

    order
        .into_iter()
        .zip(observed)
        .map(|(name, obs)| ColumnSpec {
            name,
            sql_type: obs.infer(text_column_length),
            // nulls and absent fields both leave a record uncounted
            nullable: obs.non_null() < records.len(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Unique key resolution
// ---------------------------------------------------------------------------

/// Which rule produced a resolved unique key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    StepOverride,
    /// Declared on the ApiConfig while the table already exists.
    DeclaredOverPhysical,
    Physical,
    /// Declared on the ApiConfig; the table does not exist yet.
    Declared,
    Catalog,
    None,
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KeySource::StepOverride => "step override",
            KeySource::DeclaredOverPhysical => "declared (over physical)",
            KeySource::Physical => "physical",
            KeySource::Declared => "declared",
            KeySource::Catalog => "catalog",
            KeySource::None => "none",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub fields: Vec<String>,
    pub source: KeySource,
}

impl ResolvedKey {
    fn new(fields: Vec<String>, source: KeySource) -> Self {
        Self { fields, source }
    }

    fn none() -> Self {
        Self::new(Vec::new(), KeySource::None)
    }
}

fn sanitize_all(fields: &[String]) -> Vec<String> {
    fields
        .iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .map(sanitize_column_name)
        .collect()
}

// ---------------------------------------------------------------------------
// SchemaManager
// ---------------------------------------------------------------------------

/// Outcome of [`SchemaManager::ensure_table`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsuredTable {
    pub created: bool,
    /// Every column of the table, engine-managed ones included.
    pub columns: Vec<String>,
}

/// Creates target tables and unique indexes, and resolves merge keys.
#[derive(Debug, Clone)]
pub struct SchemaManager {
    text_column_length: u32,
}

impl SchemaManager {
    pub fn new(text_column_length: u32) -> Self {
        Self { text_column_length }
    }

    /// Make sure `table` exists, creating it from `batch` if not.
    ///
    /// A new table takes its primary key from the declared key fields that
    /// are present in the batch; otherwise the surrogate key is primary.
    pub async fn ensure_table<T: TableTransaction>(
        &self,
        tx: &mut T,
        table: &str,
        batch: &[Record],
        declared_primary_key: &[String],
    ) -> Result<EnsuredTable, StoreError> {
        validate_table_name(table)?;

        if tx.table_exists(table).await? {
            let columns = tx.table_columns(table).await?;
            return Ok(EnsuredTable {
                created: false,
                columns,
            });
        }

        if batch.is_empty() {
            return Err(StoreError::Schema(format!(
                "cannot create table '{table}' from an empty batch"
            )));
        }

        let mut columns = infer_columns(batch, self.text_column_length);
        let column_names: HashSet<&str> = columns.iter().map(|c| c.name.as_str()).collect();

        let declared = sanitize_all(declared_primary_key);
        let (primary_key, missing): (Vec<String>, Vec<String>) = declared
            .into_iter()
            .partition(|f| column_names.contains(f.as_str()));
        if !missing.is_empty() {
            tracing::warn!(table = %table, missing = ?missing, "declared primary key fields absent from batch are ignored");
        }
        for column in &mut columns {
            if primary_key.contains(&column.name) {
                column.nullable = false;
            }
        }

        let spec = TableSpec {
            name: table.to_string(),
            columns,
            primary_key,
        };
        tx.create_table(&spec).await?;
        tracing::info!(
            table = %table,
            columns = spec.columns.len(),
            primary_key = ?spec.primary_key,
            "created target table"
        );

        let columns = tx.table_columns(table).await?;
        Ok(EnsuredTable {
            created: true,
            columns,
        })
    }

    /// Resolve the field set that bounds uniqueness for merge modes.
    ///
    /// Priority:
    /// 1. a non-empty step override;
    /// 2. declared key fields, when the table already exists (these win over
    ///    the physical key so configuration can correct a wrong key);
    /// 3. the table's physical key: a primary key other than the surrogate,
    ///    else the first unique index;
    /// 4. declared key fields, when the table does not exist yet;
    /// 5. any unique set in the catalog, the surrogate key included.
    pub async fn resolve_unique_key<T: TableTransaction>(
        &self,
        tx: &mut T,
        table: &str,
        step_override: &[String],
        declared_primary_key: &[String],
    ) -> Result<ResolvedKey, StoreError> {
        let override_fields = sanitize_all(step_override);
        if !override_fields.is_empty() {
            return Ok(ResolvedKey::new(override_fields, KeySource::StepOverride));
        }

        let declared = sanitize_all(declared_primary_key);
        let exists = tx.table_exists(table).await?;

        if exists && !declared.is_empty() {
            return Ok(ResolvedKey::new(declared, KeySource::DeclaredOverPhysical));
        }

        let key_sets = if exists {
            tx.unique_key_sets(table).await?
        } else {
            Vec::new()
        };

        if exists {
            let surrogate_only = |cols: &[String]| cols.len() == 1 && cols[0] == SURROGATE_KEY_COLUMN;
            let physical = key_sets
                .iter()
                .find(|k| k.primary && !surrogate_only(&k.columns))
                .or_else(|| key_sets.iter().find(|k| !k.primary));
            if let Some(key) = physical {
                return Ok(ResolvedKey::new(key.columns.clone(), KeySource::Physical));
            }
        }

        if !declared.is_empty() {
            return Ok(ResolvedKey::new(declared, KeySource::Declared));
        }

        match key_sets.into_iter().next() {
            Some(key) => Ok(ResolvedKey::new(key.columns, KeySource::Catalog)),
            None => Ok(ResolvedKey::none()),
        }
    }

    /// Make sure a unique constraint covers exactly `key_fields`.
    ///
    /// Returns whether such a constraint exists after the call. Missing
    /// tables or columns, and a failed index build (e.g. existing duplicate
    /// rows), are reported as `false` with a warning. The index build runs
    /// in its own savepoint so a failure leaves the transaction usable.
    pub async fn ensure_unique_index<T: TableTransaction>(
        &self,
        tx: &mut T,
        table: &str,
        key_fields: &[String],
    ) -> Result<bool, StoreError> {
        if key_fields.is_empty() {
            return Ok(false);
        }
        if !tx.table_exists(table).await? {
            tracing::warn!(table = %table, "cannot create unique index on a missing table");
            return Ok(false);
        }

        let columns = tx.table_columns(table).await?;
        let missing: Vec<&String> = key_fields.iter().filter(|f| !columns.contains(f)).collect();
        if !missing.is_empty() {
            tracing::warn!(table = %table, missing = ?missing, "unique key fields are not columns of the table");
            return Ok(false);
        }

        let key_sets = tx.unique_key_sets(table).await?;
        if key_sets.iter().any(|k| k.matches(key_fields)) {
            return Ok(true);
        }

        let index_name = unique_index_name(table, key_fields);
        let savepoint = tx.savepoint().await?;
        match tx.create_unique_index(table, &index_name, key_fields).await {
            Ok(()) => {
                tx.release_savepoint(savepoint).await?;
                tracing::info!(table = %table, index = %index_name, fields = ?key_fields, "created unique index");
                Ok(true)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tx.rollback_to_savepoint(savepoint).await?;
                tracing::warn!(table = %table, index = %index_name, error = %e, "unique index creation failed");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn table_name_validation() {
        for ok in ["daily", "_tmp", "ingest_stock_basic", "T1"] {
            assert!(validate_table_name(ok).is_ok(), "{ok}");
        }
        let too_long = "x".repeat(64);
        for bad in ["", "1daily", "daily-quotes", "daily;drop", "dåily", too_long.as_str()] {
            assert!(validate_table_name(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn column_name_sanitizing() {
        assert_eq!(sanitize_column_name("ts_code"), "ts_code");
        assert_eq!(sanitize_column_name("pct chg%"), "pct_chg_");
        assert_eq!(sanitize_column_name("5d_ma"), "col_5d_ma");
        assert_eq!(sanitize_column_name(""), "col_");
    }

    #[test]
    fn unique_index_name_is_truncated() {
        let cols = vec!["ts_code".to_string(), "trade_date".to_string()];
        assert_eq!(unique_index_name("daily", &cols), "uk_daily_ts_code_trade_date");
        let long: Vec<String> = (0..10).map(|i| format!("column_number_{i}")).collect();
        assert_eq!(unique_index_name("daily", &long).len(), MAX_IDENTIFIER_LEN);
    }

    #[test]
    fn column_types_are_inferred() {
        let batch = vec![
            record(json!({"code": "A", "vol": 10, "close": 1.5, "open": true, "ts": "2024-01-02 09:30:00", "date": "20240102"})),
            record(json!({"code": "B", "vol": 20, "close": 2, "open": false, "ts": "2024-01-02T09:31:00Z", "date": null})),
        ];
        let cols = infer_columns(&batch, 500);
        let ty = |name: &str| cols.iter().find(|c| c.name == name).unwrap().sql_type;
        assert_eq!(ty("code"), SqlType::Varchar(500));
        assert_eq!(ty("vol"), SqlType::BigInt);
        assert_eq!(ty("close"), SqlType::Double);
        assert_eq!(ty("open"), SqlType::Boolean);
        assert_eq!(ty("ts"), SqlType::Timestamp);
        assert_eq!(ty("date"), SqlType::Varchar(500));
        assert!(cols.iter().find(|c| c.name == "date").unwrap().nullable);
        assert!(!cols.iter().find(|c| c.name == "code").unwrap().nullable);
    }

    #[test]
    fn long_and_mixed_values_fall_back_to_text() {
        let batch = vec![
            record(json!({"note": "x".repeat(20), "mixed": 1})),
            record(json!({"note": "short", "mixed": "one"})),
        ];
        let cols = infer_columns(&batch, 10);
        let ty = |name: &str| cols.iter().find(|c| c.name == name).unwrap().sql_type;
        assert_eq!(ty("note"), SqlType::Text);
        assert_eq!(ty("mixed"), SqlType::Varchar(10));
    }

    #[test]
    fn integers_beyond_i64_are_text() {
        let batch = vec![
            record(json!({"id": u64::MAX, "vol": i64::MAX})),
            record(json!({"id": 7, "vol": 1})),
        ];
        let cols = infer_columns(&batch, 500);
        let ty = |name: &str| cols.iter().find(|c| c.name == name).unwrap().sql_type;
        assert_eq!(ty("id"), SqlType::Varchar(500));
        assert_eq!(ty("vol"), SqlType::BigInt);
    }

    #[test]
    fn columns_keep_first_occurrence_order_and_skip_reserved() {
        let batch = vec![
            record(json!({"b": 1, "task_id": 9})),
            record(json!({"a": 1, "b": 2})),
        ];
        let cols = infer_columns(&batch, 500);
        let names: Vec<&str> = cols.iter().map(|c| c.name.as_str()).collect();
        // serde_json maps iterate in key order within a record
        assert_eq!(names, vec!["b", "a"]);
        assert!(cols[1].nullable);
    }
}
