//! SQLite implementation of the target-table store.
//!
//! Step transactions are taken from the single-connection writer pool, so
//! a step holds the only write connection until it commits or rolls back.
//! Catalog introspection uses `sqlite_master` and the `table_info`,
//! `index_list` and `index_info` pragmas.

use ingestflow_core::repository::table::{
    ConflictAction, Savepoint, TableStore, TableTransaction, UniqueKeySet, WriteBatch,
};
use ingestflow_types::error::StoreError;
use ingestflow_types::schema::TableSpec;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Row, Sqlite, Transaction};

use super::pool::DatabasePool;
use crate::sql::dialect::SqlDialect;

/// `TableStore` over the writer pool of a [`DatabasePool`].
#[derive(Clone)]
pub struct SqliteTableStore {
    pool: DatabasePool,
}

impl SqliteTableStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl TableStore for SqliteTableStore {
    type Tx = SqliteTableTx;

    async fn begin(&self) -> Result<SqliteTableTx, StoreError> {
        let tx = self.pool.writer.begin().await.map_err(|e| map_sqlx_error("", e))?;
        Ok(SqliteTableTx {
            tx,
            dialect: SqlDialect::Sqlite,
            depth: 0,
            next_savepoint: 0,
        })
    }
}

/// An open step transaction.
pub struct SqliteTableTx {
    tx: Transaction<'static, Sqlite>,
    dialect: SqlDialect,
    depth: u32,
    next_savepoint: u32,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Classify a sqlx error. Pool and I/O failures are connection errors; a
/// unique-constraint failure keeps its database message.
fn map_sqlx_error(table: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::UniqueViolation {
            table: table.to_string(),
            message: db.message().to_string(),
        },
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_) => StoreError::Connection(err.to_string()),
        other => StoreError::Query(other.to_string()),
    }
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            // above i64::MAX; an f64 would round it
            None if n.is_u64() => query.bind(n.to_string()),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

impl SqliteTableTx {
    async fn execute(&mut self, table: &str, sql: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(sql)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(table, e))?;
        Ok(result.rows_affected())
    }

    async fn execute_bound(&mut self, table: &str, sql: &str, values: &[Value]) -> Result<u64, StoreError> {
        let mut query = sqlx::query(sql);
        for value in values {
            query = bind_value(query, value);
        }
        let result = query
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(table, e))?;
        Ok(result.rows_affected())
    }

    /// Primary key column names in key order, from `table_info`.
    async fn primary_key_columns(&mut self, table: &str) -> Result<Vec<String>, StoreError> {
        let sql = format!("PRAGMA table_info({})", self.dialect.quote_ident(table));
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(table, e))?;
        let mut pk: Vec<(i64, String)> = Vec::new();
        for row in rows {
            let position: i64 = row.try_get("pk").map_err(|e| map_sqlx_error(table, e))?;
            if position > 0 {
                let name: String = row.try_get("name").map_err(|e| map_sqlx_error(table, e))?;
                pk.push((position, name));
            }
        }
        pk.sort_by_key(|(position, _)| *position);
        Ok(pk.into_iter().map(|(_, name)| name).collect())
    }
}

// ---------------------------------------------------------------------------
// TableTransaction impl
// ---------------------------------------------------------------------------

impl TableTransaction for SqliteTableTx {
    async fn savepoint(&mut self) -> Result<Savepoint, StoreError> {
        self.next_savepoint += 1;
        let name = format!("sp_{}", self.next_savepoint);
        let sql = self.dialect.savepoint(&name);
        self.execute("", &sql).await?;
        self.depth += 1;
        Ok(Savepoint {
            name,
            depth: self.depth,
        })
    }

    async fn release_savepoint(&mut self, savepoint: Savepoint) -> Result<(), StoreError> {
        let sql = self.dialect.release_savepoint(&savepoint.name);
        self.execute("", &sql).await?;
        self.depth = savepoint.depth.saturating_sub(1);
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, savepoint: Savepoint) -> Result<(), StoreError> {
        // ROLLBACK TO keeps the savepoint open; release it afterwards.
        let sql = self.dialect.rollback_to_savepoint(&savepoint.name);
        self.execute("", &sql).await?;
        let sql = self.dialect.release_savepoint(&savepoint.name);
        self.execute("", &sql).await?;
        self.depth = savepoint.depth.saturating_sub(1);
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(|e| map_sqlx_error("", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(|e| map_sqlx_error("", e))
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(self.dialect.table_exists_query())
            .bind(table)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(table, e))?;
        Ok(row.is_some())
    }

    async fn table_columns(&mut self, table: &str) -> Result<Vec<String>, StoreError> {
        let sql = format!("PRAGMA table_info({})", self.dialect.quote_ident(table));
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(table, e))?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(|e| map_sqlx_error(table, e)))
            .collect()
    }

    async fn unique_key_sets(&mut self, table: &str) -> Result<Vec<UniqueKeySet>, StoreError> {
        let sql = format!("PRAGMA index_list({})", self.dialect.quote_ident(table));
        let indexes = sqlx::query(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(table, e))?;

        let mut unique: Vec<(String, bool)> = Vec::new();
        for row in &indexes {
            let is_unique: i64 = row.try_get("unique").map_err(|e| map_sqlx_error(table, e))?;
            if is_unique == 0 {
                continue;
            }
            let name: String = row.try_get("name").map_err(|e| map_sqlx_error(table, e))?;
            let origin: String = row.try_get("origin").map_err(|e| map_sqlx_error(table, e))?;
            unique.push((name, origin == "pk"));
        }

        let mut sets = Vec::with_capacity(unique.len() + 1);
        for (name, primary) in unique {
            let sql = format!("PRAGMA index_info({})", self.dialect.quote_ident(&name));
            let rows = sqlx::query(&sql)
                .fetch_all(&mut *self.tx)
                .await
                .map_err(|e| map_sqlx_error(table, e))?;
            let mut columns: Vec<(i64, String)> = Vec::new();
            for row in rows {
                let seqno: i64 = row.try_get("seqno").map_err(|e| map_sqlx_error(table, e))?;
                // Expression index columns have no name.
                let column: Option<String> = row.try_get("name").map_err(|e| map_sqlx_error(table, e))?;
                if let Some(column) = column {
                    columns.push((seqno, column));
                }
            }
            columns.sort_by_key(|(seqno, _)| *seqno);
            sets.push(UniqueKeySet {
                name,
                columns: columns.into_iter().map(|(_, c)| c).collect(),
                primary,
            });
        }

        // An INTEGER PRIMARY KEY aliases the rowid and has no index entry.
        if !sets.iter().any(|s| s.primary) {
            let pk = self.primary_key_columns(table).await?;
            if !pk.is_empty() {
                sets.insert(
                    0,
                    UniqueKeySet {
                        name: "PRIMARY".to_string(),
                        columns: pk,
                        primary: true,
                    },
                );
            }
        }
        Ok(sets)
    }

    async fn create_table(&mut self, spec: &TableSpec) -> Result<(), StoreError> {
        let sql = self.dialect.create_table(spec);
        tracing::debug!(table = %spec.name, sql = %sql, "creating table");
        self.execute(&spec.name, &sql).await?;
        for index in self.dialect.bookkeeping_indexes(&spec.name) {
            self.execute(&spec.name, &index).await?;
        }
        Ok(())
    }

    async fn create_unique_index(
        &mut self,
        table: &str,
        index_name: &str,
        columns: &[String],
    ) -> Result<(), StoreError> {
        let sql = self.dialect.create_unique_index(table, index_name, columns);
        self.execute(table, &sql).await?;
        Ok(())
    }

    async fn insert_rows(
        &mut self,
        table: &str,
        batch: &WriteBatch,
        conflict: &ConflictAction,
    ) -> Result<u64, StoreError> {
        if batch.is_empty() || batch.columns.is_empty() {
            return Ok(0);
        }
        let per_statement = self.dialect.rows_per_statement(batch.columns.len());
        let mut affected = 0;
        for chunk in batch.rows.chunks(per_statement) {
            let sql = self.dialect.insert(table, &batch.columns, chunk.len(), conflict);
            let values: Vec<Value> = chunk.iter().flatten().cloned().collect();
            affected += self.execute_bound(table, &sql, &values).await?;
        }
        Ok(affected)
    }

    async fn delete_by_keys(
        &mut self,
        table: &str,
        key_fields: &[String],
        keys: &[Vec<Value>],
    ) -> Result<u64, StoreError> {
        if key_fields.is_empty() || keys.is_empty() {
            return Ok(0);
        }
        let per_statement = self.dialect.rows_per_statement(key_fields.len());
        let mut deleted = 0;
        for chunk in keys.chunks(per_statement) {
            let (sql, values) = self.dialect.delete_by_keys(table, key_fields, chunk);
            deleted += self.execute_bound(table, &sql, &values).await?;
        }
        Ok(deleted)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
