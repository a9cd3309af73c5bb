//! SQL text rendering per dialect.
//!
//! Everything dialect-specific about the dynamic target tables lives here:
//! identifier quoting, type names, the surrogate key, bookkeeping columns
//! and indexes, conflict clauses, keyed deletes and savepoint statements.
//! Only SQLite is executed by this crate; Postgres and MySQL output is
//! exercised by the tests below.

use ingestflow_core::repository::table::ConflictAction;
use ingestflow_types::config::Dialect;
use ingestflow_types::schema::{CREATE_TIME_COLUMN, SURROGATE_KEY_COLUMN, SqlType, TableSpec};
use serde_json::Value;

/// Bookkeeping index prefixes and the column each one covers.
const BOOKKEEPING_INDEXES: [(&str, &str); 5] = [
    ("tid", "task_id"),
    ("cid", "config_id"),
    ("ac", "api_code"),
    ("dd", "download_date"),
    ("ct", CREATE_TIME_COLUMN),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Sqlite,
    Postgres,
    MySql,
}

impl From<Dialect> for SqlDialect {
    fn from(dialect: Dialect) -> Self {
        match dialect {
            Dialect::Sqlite => SqlDialect::Sqlite,
            Dialect::Postgres => SqlDialect::Postgres,
            Dialect::Mysql => SqlDialect::MySql,
        }
    }
}

/// Last `n` characters of `s`.
fn tail_chars(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    match s.char_indices().nth(count - n) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

impl SqlDialect {
    // -----------------------------------------------------------------------
    // Identifiers, types, placeholders
    // -----------------------------------------------------------------------

    pub fn quote_ident(self, name: &str) -> String {
        match self {
            SqlDialect::MySql => format!("`{}`", name.replace('`', "``")),
            SqlDialect::Sqlite | SqlDialect::Postgres => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }

    fn quote_list(self, names: &[String]) -> String {
        names
            .iter()
            .map(|n| self.quote_ident(n))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn type_name(self, sql_type: SqlType) -> String {
        match (self, sql_type) {
            (_, SqlType::BigInt) => "BIGINT".to_string(),
            (SqlDialect::Postgres, SqlType::Double) => "DOUBLE PRECISION".to_string(),
            (_, SqlType::Double) => "DOUBLE".to_string(),
            (SqlDialect::MySql, SqlType::Boolean) => "TINYINT(1)".to_string(),
            (_, SqlType::Boolean) => "BOOLEAN".to_string(),
            (SqlDialect::MySql, SqlType::Timestamp) => "DATETIME".to_string(),
            (_, SqlType::Timestamp) => "TIMESTAMP".to_string(),
            (_, SqlType::Varchar(n)) => format!("VARCHAR({n})"),
            (_, SqlType::Text) => "TEXT".to_string(),
        }
    }

    /// Bind parameter for the 1-based position `n`.
    pub fn placeholder(self, n: usize) -> String {
        match self {
            SqlDialect::Postgres => format!("${n}"),
            SqlDialect::Sqlite | SqlDialect::MySql => "?".to_string(),
        }
    }

    /// Upper bound on bind parameters in one statement.
    pub fn max_bind_params(self) -> usize {
        match self {
            SqlDialect::Sqlite => 32_766,
            SqlDialect::Postgres | SqlDialect::MySql => 65_535,
        }
    }

    /// How many rows of `width` values fit in one statement.
    pub fn rows_per_statement(self, width: usize) -> usize {
        (self.max_bind_params() / width.max(1)).max(1)
    }

    // -----------------------------------------------------------------------
    // DDL
    // -----------------------------------------------------------------------

    pub fn bookkeeping_index_name(prefix: &str, table: &str) -> String {
        format!("idx_{prefix}_{}", tail_chars(table, 20))
    }

    /// Query returning one row when `table` exists; binds the table name.
    pub fn table_exists_query(self) -> &'static str {
        match self {
            SqlDialect::Sqlite => "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            SqlDialect::Postgres => {
                "SELECT 1 FROM information_schema.tables WHERE table_schema = current_schema() AND table_name = $1"
            }
            SqlDialect::MySql => {
                "SELECT 1 FROM information_schema.tables WHERE table_schema = DATABASE() AND table_name = ?"
            }
        }
    }

    fn surrogate_key_column(self, has_declared_pk: bool) -> String {
        let col = self.quote_ident(SURROGATE_KEY_COLUMN);
        match (self, has_declared_pk) {
            (SqlDialect::Sqlite, false) => format!("{col} INTEGER PRIMARY KEY AUTOINCREMENT"),
            (SqlDialect::Sqlite, true) => format!("{col} INTEGER"),
            (SqlDialect::Postgres, false) => format!("{col} BIGSERIAL PRIMARY KEY"),
            (SqlDialect::Postgres, true) => format!("{col} BIGSERIAL"),
            (SqlDialect::MySql, false) => format!("{col} BIGINT AUTO_INCREMENT PRIMARY KEY"),
            (SqlDialect::MySql, true) => format!("{col} BIGINT AUTO_INCREMENT"),
        }
    }

    /// `CREATE TABLE` with surrogate key, bookkeeping columns, data columns
    /// and the declared primary key. MySQL gets its bookkeeping indexes
    /// inline; other dialects use [`Self::bookkeeping_indexes`].
    pub fn create_table(self, spec: &TableSpec) -> String {
        let has_pk = !spec.primary_key.is_empty();
        let mut lines = vec![
            self.surrogate_key_column(has_pk),
            format!("{} BIGINT NOT NULL", self.quote_ident("task_id")),
            format!("{} BIGINT NOT NULL", self.quote_ident("config_id")),
            format!("{} VARCHAR(100) NOT NULL", self.quote_ident("api_code")),
            format!("{} VARCHAR(20)", self.quote_ident("download_date")),
        ];
        for column in &spec.columns {
            let not_null = if spec.primary_key.contains(&column.name) {
                " NOT NULL"
            } else {
                ""
            };
            lines.push(format!(
                "{} {}{not_null}",
                self.quote_ident(&column.name),
                self.type_name(column.sql_type)
            ));
        }
        let create_time_type = self.type_name(SqlType::Timestamp);
        lines.push(format!(
            "{} {create_time_type} DEFAULT CURRENT_TIMESTAMP",
            self.quote_ident(CREATE_TIME_COLUMN)
        ));
        if has_pk {
            lines.push(format!("PRIMARY KEY ({})", self.quote_list(&spec.primary_key)));
        }
        if self == SqlDialect::MySql {
            if has_pk {
                lines.push(format!("UNIQUE KEY ({})", self.quote_ident(SURROGATE_KEY_COLUMN)));
            }
            for (prefix, column) in BOOKKEEPING_INDEXES {
                lines.push(format!(
                    "INDEX {} ({})",
                    self.quote_ident(&Self::bookkeeping_index_name(prefix, &spec.name)),
                    self.quote_ident(column)
                ));
            }
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
            self.quote_ident(&spec.name),
            lines.join(",\n  ")
        )
    }

    /// Non-unique indexes on the bookkeeping columns.
    pub fn bookkeeping_indexes(self, table: &str) -> Vec<String> {
        if self == SqlDialect::MySql {
            return Vec::new();
        }
        BOOKKEEPING_INDEXES
            .iter()
            .map(|(prefix, column)| {
                format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    self.quote_ident(&Self::bookkeeping_index_name(prefix, table)),
                    self.quote_ident(table),
                    self.quote_ident(column)
                )
            })
            .collect()
    }

    pub fn create_unique_index(self, table: &str, index_name: &str, columns: &[String]) -> String {
        let if_not_exists = match self {
            SqlDialect::MySql => "",
            SqlDialect::Sqlite | SqlDialect::Postgres => "IF NOT EXISTS ",
        };
        format!(
            "CREATE UNIQUE INDEX {if_not_exists}{} ON {} ({})",
            self.quote_ident(index_name),
            self.quote_ident(table),
            self.quote_list(columns)
        )
    }

    // -----------------------------------------------------------------------
    // DML
    // -----------------------------------------------------------------------

    /// Multi-row insert of `row_count` rows over `columns`, with the
    /// dialect's rendering of `conflict`.
    pub fn insert(
        self,
        table: &str,
        columns: &[String],
        row_count: usize,
        conflict: &ConflictAction,
    ) -> String {
        let width = columns.len();
        let rows: Vec<String> = (0..row_count)
            .map(|r| {
                let values: Vec<String> = (1..=width)
                    .map(|c| self.placeholder(r * width + c))
                    .collect();
                format!("({})", values.join(", "))
            })
            .collect();

        let verb = match (self, conflict) {
            (SqlDialect::MySql, ConflictAction::Ignore { .. }) => "INSERT IGNORE INTO",
            _ => "INSERT INTO",
        };
        let mut sql = format!(
            "{verb} {} ({}) VALUES {}",
            self.quote_ident(table),
            self.quote_list(columns),
            rows.join(", ")
        );

        match (self, conflict) {
            (_, ConflictAction::Fail) | (SqlDialect::MySql, ConflictAction::Ignore { .. }) => {}
            (_, ConflictAction::Ignore { key_fields }) => {
                sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", self.quote_list(key_fields)));
            }
            (SqlDialect::MySql, ConflictAction::Update { update_columns, .. }) => {
                let sets: Vec<String> = update_columns
                    .iter()
                    .map(|c| {
                        let q = self.quote_ident(c);
                        format!("{q} = VALUES({q})")
                    })
                    .collect();
                sql.push_str(&format!(" ON DUPLICATE KEY UPDATE {}", sets.join(", ")));
            }
            (_, ConflictAction::Update {
                key_fields,
                update_columns,
            }) => {
                let sets: Vec<String> = update_columns
                    .iter()
                    .map(|c| {
                        let q = self.quote_ident(c);
                        format!("{q} = excluded.{q}")
                    })
                    .collect();
                sql.push_str(&format!(
                    " ON CONFLICT ({}) DO UPDATE SET {}",
                    self.quote_list(key_fields),
                    sets.join(", ")
                ));
            }
        }
        sql
    }

    /// Delete rows matching any of `keys` on `key_fields`.
    ///
    /// Returns the statement and the values to bind, in order. `Null` key
    /// parts render as `IS NULL` and are not bound.
    pub fn delete_by_keys(
        self,
        table: &str,
        key_fields: &[String],
        keys: &[Vec<Value>],
    ) -> (String, Vec<Value>) {
        let mut binds: Vec<Value> = Vec::new();
        let table = self.quote_ident(table);

        if let [field] = key_fields {
            let column = self.quote_ident(field);
            let mut has_null = false;
            let mut placeholders = Vec::new();
            for key in keys {
                match key.first() {
                    Some(Value::Null) | None => has_null = true,
                    Some(value) => {
                        binds.push(value.clone());
                        placeholders.push(self.placeholder(binds.len()));
                    }
                }
            }
            let mut conditions = Vec::new();
            if !placeholders.is_empty() {
                conditions.push(format!("{column} IN ({})", placeholders.join(", ")));
            }
            if has_null {
                conditions.push(format!("{column} IS NULL"));
            }
            let predicate = if conditions.is_empty() {
                "1 = 0".to_string()
            } else {
                conditions.join(" OR ")
            };
            return (format!("DELETE FROM {table} WHERE {predicate}"), binds);
        }

        let mut groups = Vec::with_capacity(keys.len());
        for key in keys {
            let parts: Vec<String> = key_fields
                .iter()
                .zip(key)
                .map(|(field, value)| {
                    let column = self.quote_ident(field);
                    if value.is_null() {
                        format!("{column} IS NULL")
                    } else {
                        binds.push(value.clone());
                        format!("{column} = {}", self.placeholder(binds.len()))
                    }
                })
                .collect();
            groups.push(format!("({})", parts.join(" AND ")));
        }
        let predicate = if groups.is_empty() {
            "1 = 0".to_string()
        } else {
            groups.join(" OR ")
        };
        (format!("DELETE FROM {table} WHERE {predicate}"), binds)
    }

    // -----------------------------------------------------------------------
    // Savepoints
    // -----------------------------------------------------------------------

    pub fn savepoint(self, name: &str) -> String {
        format!("SAVEPOINT {name}")
    }

    pub fn release_savepoint(self, name: &str) -> String {
        format!("RELEASE SAVEPOINT {name}")
    }

    pub fn rollback_to_savepoint(self, name: &str) -> String {
        format!("ROLLBACK TO SAVEPOINT {name}")
    }
}
