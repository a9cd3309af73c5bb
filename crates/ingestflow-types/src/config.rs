//! Engine configuration types.
//!
//! `EngineConfig` represents the `config.toml` in the data directory. Every
//! field has a default so an empty or missing file is valid.

use serde::{Deserialize, Serialize};

/// SQL dialect the engine renders statements for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Sqlite,
    Postgres,
    Mysql,
}

/// Top-level configuration for the ingestion engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub dialect: Dialect,

    /// Upper bound on a single external client call.
    #[serde(default = "default_client_timeout_secs")]
    pub client_timeout_secs: u64,

    /// Optional bound on a whole run. `None` means unbounded.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,

    /// Failure log messages are cut to this many characters.
    #[serde(default = "default_max_error_message_len")]
    pub max_error_message_len: usize,

    /// Per-combination entries kept in a loop summary.
    #[serde(default = "default_loop_summary_detail_limit")]
    pub loop_summary_detail_limit: usize,

    /// Loop summary JSON is cut to this many characters.
    #[serde(default = "default_loop_summary_max_len")]
    pub loop_summary_max_len: usize,

    /// Length of the bounded text type used for string columns.
    #[serde(default = "default_text_column_length")]
    pub text_column_length: u32,

    /// Stop the workflow at the first failed step instead of continuing.
    #[serde(default)]
    pub halt_on_step_failure: bool,

    /// Connection settings for the SQLite database (`[database]` table).
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// SQLite connection pool settings.
///
/// The writer pool always has exactly one connection; a step transaction
/// holds it until commit, so `writer_acquire_timeout_secs` bounds how long
/// any other write waits behind a running step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_reader_connections")]
    pub reader_connections: u32,

    /// SQLite `busy_timeout` applied to every connection.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_writer_acquire_timeout_secs")]
    pub writer_acquire_timeout_secs: u64,
}

fn default_reader_connections() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_writer_acquire_timeout_secs() -> u64 {
    30
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            reader_connections: default_reader_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
            writer_acquire_timeout_secs: default_writer_acquire_timeout_secs(),
        }
    }
}

fn default_client_timeout_secs() -> u64 {
    60
}

fn default_max_error_message_len() -> usize {
    5000
}

fn default_loop_summary_detail_limit() -> usize {
    5
}

fn default_loop_summary_max_len() -> usize {
    3000
}

fn default_text_column_length() -> u32 {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dialect: Dialect::default(),
            client_timeout_secs: default_client_timeout_secs(),
            run_timeout_secs: None,
            max_error_message_len: default_max_error_message_len(),
            loop_summary_detail_limit: default_loop_summary_detail_limit(),
            loop_summary_max_len: default_loop_summary_max_len(),
            text_column_length: default_text_column_length(),
            halt_on_step_failure: false,
            database: DatabaseConfig::default(),
        }
    }
}
