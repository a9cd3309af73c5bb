use thiserror::Error;

/// Errors from repository operations (used by trait definitions in ingestflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors raised by a table store while managing target tables and writing batches.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("unique constraint violated on {table}: {message}")]
    UniqueViolation { table: String, message: String },

    #[error("no transaction is open")]
    NoTransaction,
}

impl StoreError {
    /// Whether the error leaves the underlying connection unusable.
    ///
    /// Connection failures escape combination-level recovery and abort the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::NoTransaction)
    }
}
