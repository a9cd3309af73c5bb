//! Shared domain types for ingestflow.
//!
//! Workflow configuration, run/audit records, runtime table shapes, engine
//! configuration and the error types shared across layers.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod run;
pub mod schema;
pub mod workflow;
