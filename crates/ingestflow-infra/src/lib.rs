//! Infrastructure layer for ingestflow.
//!
//! Contains implementations of the ports defined in `ingestflow-core`:
//! SQLite storage for runs and target tables, SQL dialect rendering, the
//! file-backed data-source client and configuration loading.

pub mod config;
pub mod engine;
pub mod fixture;
pub mod sql;
pub mod sqlite;
