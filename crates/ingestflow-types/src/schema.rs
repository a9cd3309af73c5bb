//! Runtime-discovered table shape.
//!
//! Target tables are not known at compile time: their columns come from
//! whatever the external API returns. Shapes are therefore plain values
//! (`ColumnSpec`, `TableSpec`) built from result batches.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One result row: field name to scalar value.
pub type Record = serde_json::Map<String, Value>;

/// Bookkeeping columns stamped onto every written row, in insertion order.
///
/// `create_time` is filled by the column default.
pub const BOOKKEEPING_COLUMNS: [&str; 4] = ["task_id", "config_id", "api_code", "download_date"];

/// Surrogate key column present on every target table.
pub const SURROGATE_KEY_COLUMN: &str = "data_id";

/// Creation timestamp column present on every target table.
pub const CREATE_TIME_COLUMN: &str = "create_time";

/// Portable column type, rendered per SQL dialect.
///
/// JSON numbers carry no width, so every integer column is `BigInt` and
/// every fractional one `Double`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "length", rename_all = "snake_case")]
pub enum SqlType {
    BigInt,
    Double,
    Boolean,
    Timestamp,
    Varchar(u32),
    Text,
}

impl SqlType {
    pub fn is_numeric(self) -> bool {
        matches!(self, SqlType::BigInt | SqlType::Double)
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlType::BigInt => write!(f, "bigint"),
            SqlType::Double => write!(f, "double"),
            SqlType::Boolean => write!(f, "boolean"),
            SqlType::Timestamp => write!(f, "timestamp"),
            SqlType::Varchar(n) => write!(f, "varchar({n})"),
            SqlType::Text => write!(f, "text"),
        }
    }
}

/// A data column inferred from a result batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Sanitized column name.
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
}

/// Everything needed to create a target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    /// Inferred data columns; bookkeeping columns are added by the renderer.
    pub columns: Vec<ColumnSpec>,
    /// Declared primary key. Empty means the surrogate key is the primary key.
    pub primary_key: Vec<String>,
}
