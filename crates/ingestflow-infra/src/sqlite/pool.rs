//! SQLite connection pools in WAL mode.
//!
//! SQLite admits one writer at a time, so writes go through a pool with
//! exactly one connection:
//!
//! - a step transaction (`SqliteTableStore::begin`) holds the writer until
//!   it commits or rolls back;
//! - run and audit records are written only between step transactions, after
//!   the step has committed;
//! - anything else that needs the writer while a step runs waits at most
//!   `writer_acquire_timeout_secs` and then fails with `PoolTimedOut`.
//!
//! Reads (history, log listings, catalog checks outside a step) use a
//! read-only pool of `reader_connections` connections. Migrations run on the
//! writer before the reader pool opens.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ingestflow_types::config::DatabaseConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Read-only reader pool plus the single writer connection.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open with default [`DatabaseConfig`] settings.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::connect(database_url, &DatabaseConfig::default()).await
    }

    /// Open both pools and migrate the database.
    pub async fn connect(database_url: &str, config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(config.writer_acquire_timeout_secs))
            .connect_with(base_opts.clone())
            .await?;

        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(config.reader_connections.max(1))
            .connect_with(base_opts.read_only(true))
            .await?;

        tracing::debug!(
            readers = config.reader_connections,
            busy_timeout_ms = config.busy_timeout_ms,
            "database pools opened"
        );
        Ok(Self { reader, writer })
    }
}

/// Data directory from `INGESTFLOW_DATA_DIR`, falling back to `~/.ingestflow`.
pub fn data_dir() -> PathBuf {
    match std::env::var_os("INGESTFLOW_DATA_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ingestflow"),
    }
}

/// Returns the default database URL: `ingestflow.db` inside [`data_dir`].
pub fn default_database_url() -> String {
    format!("sqlite://{}/ingestflow.db", data_dir().display())
}
