//! Merge engine: persists a result batch under one of four write modes.
//!
//! | mode           | collision on key fields                       |
//! |----------------|-----------------------------------------------|
//! | `Insert`       | error                                         |
//! | `InsertIgnore` | incoming row skipped                          |
//! | `Upsert`       | non-key columns overwritten (last write wins) |
//! | `DeleteInsert` | matching rows deleted first, then inserted    |
//!
//! Modes that need a key fall back to `Insert` with a warning when no usable
//! key or unique constraint exists. Dialect syntax stays behind
//! [`TableTransaction`].
//!
//! Unique indexes never match a key containing NULL, so rows with a null key
//! part bypass conflict handling: `Upsert` replaces them by key (`IS NULL`
//! matching) and `InsertIgnore` skips them.

use std::collections::HashSet;

use ingestflow_types::error::StoreError;
use ingestflow_types::schema::{BOOKKEEPING_COLUMNS, Record};
use ingestflow_types::workflow::WriteMode;
use serde_json::Value;

use super::combination::sanitize_value;
use super::schema::{is_reserved_column, sanitize_column_name};
use crate::repository::table::{ConflictAction, TableTransaction, WriteBatch};

// ---------------------------------------------------------------------------
// Batch preparation
// ---------------------------------------------------------------------------

/// Values stamped onto every written row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bookkeeping {
    pub task_id: i64,
    pub config_id: i64,
    pub api_code: String,
    pub download_date: String,
}

impl Bookkeeping {
    fn values(&self) -> [Value; 4] {
        [
            Value::from(self.task_id),
            Value::from(self.config_id),
            Value::from(self.api_code.clone()),
            Value::from(self.download_date.clone()),
        ]
    }
}

/// Turn records into a [`WriteBatch`] for an existing table.
///
/// Column names are sanitized. Fields the table has no column for are
/// dropped with a warning; nested values are written as JSON text.
pub fn prepare_batch(
    table: &str,
    records: &[Record],
    table_columns: &[String],
    bookkeeping: &Bookkeeping,
) -> WriteBatch {
    let known: HashSet<&str> = table_columns.iter().map(String::as_str).collect();

    let mut data_columns: Vec<(String, String)> = Vec::new();
    let mut dropped: Vec<String> = Vec::new();
    for record in records {
        for field in record.keys() {
            let column = sanitize_column_name(field);
            if data_columns.iter().any(|(f, _)| f == field) || dropped.contains(field) {
                continue;
            }
            if is_reserved_column(&column)
                || !known.contains(column.as_str())
                || data_columns.iter().any(|(_, c)| c == &column)
            {
                dropped.push(field.clone());
            } else {
                data_columns.push((field.clone(), column));
            }
        }
    }
    if !dropped.is_empty() {
        tracing::warn!(table = %table, fields = ?dropped, "result fields without a matching column are not written");
    }

    let mut columns: Vec<String> = BOOKKEEPING_COLUMNS.iter().map(|c| c.to_string()).collect();
    columns.extend(data_columns.iter().map(|(_, c)| c.clone()));

    let stamp = bookkeeping.values();
    let rows = records
        .iter()
        .map(|record| {
            let mut row: Vec<Value> = stamp.to_vec();
            row.extend(data_columns.iter().map(|(field, _)| {
                record
                    .get(field)
                    .cloned()
                    .map(sanitize_value)
                    .unwrap_or(Value::Null)
            }));
            row
        })
        .collect();

    WriteBatch { columns, rows }
}

// ---------------------------------------------------------------------------
// MergeEngine
// ---------------------------------------------------------------------------

/// What a write actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Mode after any downgrade.
    pub mode: WriteMode,
    pub key_fields: Vec<String>,
    pub submitted: usize,
    /// Rows present in the table for this batch after the write.
    pub written: u64,
    pub skipped: u64,
    pub deleted: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MergeEngine;

impl MergeEngine {
    pub fn new() -> Self {
        Self
    }

    /// Write `batch` into `table` under `mode`.
    ///
    /// Key fields that are not batch columns are dropped with a warning. A
    /// uniqueness-requiring mode with no key left downgrades to `Insert`;
    /// `InsertIgnore` and `Upsert` also downgrade when no unique constraint
    /// covers exactly the key fields.
    pub async fn write<T: TableTransaction>(
        &self,
        tx: &mut T,
        table: &str,
        batch: &WriteBatch,
        mode: WriteMode,
        key_fields: &[String],
    ) -> Result<MergeOutcome, StoreError> {
        let (keys, missing): (Vec<String>, Vec<String>) = key_fields
            .iter()
            .cloned()
            .partition(|k| batch.columns.contains(k));
        if !missing.is_empty() {
            tracing::warn!(table = %table, missing = ?missing, "key fields not present in batch are ignored");
        }

        let mut mode = mode;
        if mode.requires_unique_key() && keys.is_empty() {
            tracing::warn!(table = %table, requested = %mode, "no unique key available, falling back to insert");
            mode = WriteMode::Insert;
        }

        if matches!(mode, WriteMode::InsertIgnore | WriteMode::Upsert) {
            let key_sets = tx.unique_key_sets(table).await?;
            if !key_sets.iter().any(|k| k.matches(&keys)) {
                tracing::warn!(
                    table = %table,
                    requested = %mode,
                    keys = ?keys,
                    "no unique constraint on key fields, falling back to insert"
                );
                mode = WriteMode::Insert;
            }
        }

        let submitted = batch.len();
        let mut outcome = MergeOutcome {
            mode,
            key_fields: if mode == WriteMode::Insert { Vec::new() } else { keys.clone() },
            submitted,
            written: 0,
            skipped: 0,
            deleted: 0,
        };
        if batch.is_empty() {
            return Ok(outcome);
        }

        match mode {
            WriteMode::Insert => {
                tx.insert_rows(table, batch, &ConflictAction::Fail).await?;
                outcome.written = submitted as u64;
            }
            WriteMode::InsertIgnore => {
                let (keyed, null_keyed) = batch.split_null_keys(&keys);
                if !null_keyed.is_empty() {
                    tracing::warn!(table = %table, rows = null_keyed.len(), keys = ?keys, "rows with a null key skipped");
                }
                let inserted = if keyed.is_empty() {
                    0
                } else {
                    tx.insert_rows(table, &keyed, &ConflictAction::Ignore { key_fields: keys })
                        .await?
                };
                outcome.written = inserted;
                outcome.skipped = (submitted as u64).saturating_sub(inserted);
                if outcome.skipped > 0 {
                    tracing::info!(table = %table, inserted, skipped = outcome.skipped, "duplicate rows skipped");
                }
            }
            WriteMode::Upsert => {
                let (keyed, null_keyed) = batch.split_null_keys(&keys);
                if !null_keyed.is_empty() {
                    outcome.deleted = replace_by_keys(tx, table, &null_keyed, &keys).await?;
                    tracing::debug!(table = %table, rows = null_keyed.len(), deleted = outcome.deleted, "null-key rows replaced");
                }
                if !keyed.is_empty() {
                    let update_columns: Vec<String> = batch
                        .columns
                        .iter()
                        .filter(|c| !keys.contains(c))
                        .cloned()
                        .collect();
                    let conflict = if update_columns.is_empty() {
                        ConflictAction::Ignore { key_fields: keys }
                    } else {
                        ConflictAction::Update {
                            key_fields: keys,
                            update_columns,
                        }
                    };
                    tx.insert_rows(table, &keyed, &conflict).await?;
                }
                outcome.written = submitted as u64;
            }
            WriteMode::DeleteInsert => {
                outcome.deleted = replace_by_keys(tx, table, batch, &keys).await?;
                outcome.written = submitted as u64;
                tracing::debug!(table = %table, deleted = outcome.deleted, inserted = submitted, "replaced rows by key");
            }
        }

        Ok(outcome)
    }
}

/// Delete every row sharing a key with `batch`, then insert `batch`.
/// Returns the number of deleted rows.
async fn replace_by_keys<T: TableTransaction>(
    tx: &mut T,
    table: &str,
    batch: &WriteBatch,
    keys: &[String],
) -> Result<u64, StoreError> {
    let mut distinct: Vec<Vec<Value>> = Vec::new();
    for key in batch.key_tuples(keys) {
        if !distinct.contains(&key) {
            distinct.push(key);
        }
    }
    let deleted = tx.delete_by_keys(table, keys, &distinct).await?;
    tx.insert_rows(table, batch, &ConflictAction::Fail).await?;
    Ok(deleted)
}
