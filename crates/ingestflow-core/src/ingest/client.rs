//! Upstream data-source client port.
//!
//! The engine never talks to an API directly; it invokes a
//! [`DataSourceClient`] with an api code and a flat parameter map and gets
//! back flat records.

use std::future::Future;

use ingestflow_types::schema::Record;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// An external API the engine can invoke.
pub trait DataSourceClient: Send + Sync {
    /// Call `api_code` with `params` and return the result rows.
    fn invoke(
        &self,
        api_code: &str,
        params: &Record,
    ) -> impl Future<Output = Result<Vec<Record>, ClientError>> + Send;
}
