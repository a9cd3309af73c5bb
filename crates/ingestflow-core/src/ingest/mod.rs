//! Workflow-driven ingestion engine.
//!
//! Parameter resolution, combination expansion, schema and key management,
//! merging, step execution, orchestration and run tracking.

pub mod cache;
pub mod client;
pub mod combination;
pub mod condition;
pub mod definition;
pub mod export;
pub mod merge;
pub mod orchestrator;
pub mod resolver;
pub mod schema;
pub mod step;
pub mod summary;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;
