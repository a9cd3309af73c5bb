//! Target-table store trait definitions.
//!
//! A `TableStore` hands out transactions; everything the Schema & Key Manager
//! and the Merge Engine need from the database happens on a
//! `TableTransaction`: savepoints, catalog introspection, DDL and batch DML.
//! SQL text and dialect differences live entirely behind these traits.

use ingestflow_types::error::StoreError;
use ingestflow_types::schema::TableSpec;
use serde_json::Value;

/// Handle to an open savepoint inside a transaction.
///
/// Savepoints nest: releasing or rolling back a savepoint also closes every
/// savepoint opened after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    pub name: String,
    pub depth: u32,
}

/// A unique constraint or unique index found in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueKeySet {
    pub name: String,
    pub columns: Vec<String>,
    pub primary: bool,
}

impl UniqueKeySet {
    /// Whether this constraint covers exactly `fields`, in any order.
    pub fn matches(&self, fields: &[String]) -> bool {
        if self.columns.len() != fields.len() {
            return false;
        }
        let mut a: Vec<&str> = self.columns.iter().map(String::as_str).collect();
        let mut b: Vec<&str> = fields.iter().map(String::as_str).collect();
        a.sort_unstable();
        b.sort_unstable();
        a == b
    }
}

/// Rows ready for insertion: a fixed column list and one value per column per row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl WriteBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Extract the values of `fields` from every row, in row order.
    ///
    /// Fields missing from the column list yield `Null`.
    pub fn key_tuples(&self, fields: &[String]) -> Vec<Vec<Value>> {
        let positions: Vec<Option<usize>> = fields
            .iter()
            .map(|f| self.columns.iter().position(|c| c == f))
            .collect();
        self.rows
            .iter()
            .map(|row| {
                positions
                    .iter()
                    .map(|p| p.and_then(|i| row.get(i).cloned()).unwrap_or(Value::Null))
                    .collect()
            })
            .collect()
    }

    /// Split into rows whose `fields` are all non-null and rows with at least
    /// one null key part. Unique indexes treat nulls as distinct, so the
    /// second group can never collide.
    pub fn split_null_keys(&self, fields: &[String]) -> (WriteBatch, WriteBatch) {
        let keys = self.key_tuples(fields);
        let mut keyed = WriteBatch {
            columns: self.columns.clone(),
            rows: Vec::new(),
        };
        let mut null_keyed = keyed.clone();
        for (row, key) in self.rows.iter().zip(keys) {
            if key.iter().any(Value::is_null) {
                null_keyed.rows.push(row.clone());
            } else {
                keyed.rows.push(row.clone());
            }
        }
        (keyed, null_keyed)
    }
}

/// What an insert does when a row collides on a unique key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictAction {
    /// Plain insert; a collision is an error.
    Fail,
    /// Skip colliding rows.
    Ignore { key_fields: Vec<String> },
    /// Overwrite `update_columns` of the existing row with the incoming values.
    Update {
        key_fields: Vec<String>,
        update_columns: Vec<String>,
    },
}

/// Factory for step-scoped transactions against the target database.
pub trait TableStore: Send + Sync {
    type Tx: TableTransaction;

    /// Open a new top-level transaction.
    fn begin(&self) -> impl std::future::Future<Output = Result<Self::Tx, StoreError>> + Send;
}

/// An open transaction against the target database.
///
/// Dropping a transaction without committing rolls it back.
pub trait TableTransaction: Send {
    // -----------------------------------------------------------------------
    // Transaction control
    // -----------------------------------------------------------------------

    /// Open a nested savepoint.
    fn savepoint(
        &mut self,
    ) -> impl std::future::Future<Output = Result<Savepoint, StoreError>> + Send;

    /// Keep the savepoint's work and close it.
    fn release_savepoint(
        &mut self,
        savepoint: Savepoint,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Discard the savepoint's work and close it.
    fn rollback_to_savepoint(
        &mut self,
        savepoint: Savepoint,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn commit(self) -> impl std::future::Future<Output = Result<(), StoreError>> + Send
    where
        Self: Sized;

    fn rollback(self) -> impl std::future::Future<Output = Result<(), StoreError>> + Send
    where
        Self: Sized;

    // -----------------------------------------------------------------------
    // Catalog
    // -----------------------------------------------------------------------

    fn table_exists(
        &mut self,
        table: &str,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    /// Column names of `table` in definition order. Empty if the table is absent.
    fn table_columns(
        &mut self,
        table: &str,
    ) -> impl std::future::Future<Output = Result<Vec<String>, StoreError>> + Send;

    /// Primary key and unique constraints/indexes of `table`.
    fn unique_key_sets(
        &mut self,
        table: &str,
    ) -> impl std::future::Future<Output = Result<Vec<UniqueKeySet>, StoreError>> + Send;

    // -----------------------------------------------------------------------
    // DDL
    // -----------------------------------------------------------------------

    /// Create a table with bookkeeping columns, `spec`'s data columns, and
    /// non-unique indexes on the bookkeeping columns.
    fn create_table(
        &mut self,
        spec: &TableSpec,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn create_unique_index(
        &mut self,
        table: &str,
        index_name: &str,
        columns: &[String],
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    // -----------------------------------------------------------------------
    // DML
    // -----------------------------------------------------------------------

    /// Insert every row of `batch`. Returns the number of rows the database
    /// reports as affected.
    fn insert_rows(
        &mut self,
        table: &str,
        batch: &WriteBatch,
        conflict: &ConflictAction,
    ) -> impl std::future::Future<Output = Result<u64, StoreError>> + Send;

    /// Delete rows whose `key_fields` equal any of `keys` (`Null` matches
    /// `IS NULL`). Returns the number of deleted rows.
    fn delete_by_keys(
        &mut self,
        table: &str,
        key_fields: &[String],
        keys: &[Vec<Value>],
    ) -> impl std::future::Future<Output = Result<u64, StoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unique_key_set_matches_ignores_order() {
        let set = UniqueKeySet {
            name: "uk_daily".to_string(),
            columns: vec!["ts_code".to_string(), "trade_date".to_string()],
            primary: false,
        };
        assert!(set.matches(&["trade_date".to_string(), "ts_code".to_string()]));
        assert!(!set.matches(&["ts_code".to_string()]));
        assert!(!set.matches(&["ts_code".to_string(), "close".to_string()]));
    }

    #[test]
    fn key_tuples_follow_field_order() {
        let batch = WriteBatch {
            columns: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            rows: vec![vec![json!(1), json!("x"), json!(true)], vec![json!(2), json!("y"), json!(false)]],
        };
        let keys = batch.key_tuples(&["c".to_string(), "a".to_string(), "missing".to_string()]);
        assert_eq!(keys, vec![vec![json!(true), json!(1), json!(null)], vec![json!(false), json!(2), json!(null)]]);
    }

    #[test]
    fn split_null_keys_separates_partial_keys() {
        let batch = WriteBatch {
            columns: vec!["id".to_string(), "day".to_string(), "val".to_string()],
            rows: vec![
                vec![json!(1), json!("d1"), json!("a")],
                vec![json!(null), json!("d1"), json!("b")],
                vec![json!(2), json!(null), json!("c")],
                vec![json!(3), json!("d2"), json!(null)],
            ],
        };
        let (keyed, null_keyed) = batch.split_null_keys(&["id".to_string(), "day".to_string()]);
        assert_eq!(keyed.columns, batch.columns);
        assert_eq!(keyed.len(), 2);
        assert_eq!(keyed.rows[1][2], json!(null));
        assert_eq!(null_keyed.rows, vec![batch.rows[1].clone(), batch.rows[2].clone()]);
    }
}
