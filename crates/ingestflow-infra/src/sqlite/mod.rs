//! SQLite storage layer.
//!
//! Repository and table-store implementations backed by SQLite with WAL mode
//! and split read/write connection pools.

pub mod pool;
pub mod run;
pub mod table_store;
