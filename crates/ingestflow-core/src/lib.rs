//! Ingestion engine logic and port traits for ingestflow.
//!
//! This crate defines the "ports" (repository, table store and client traits)
//! that the infrastructure layer implements. It depends only on
//! `ingestflow-types` -- never on `ingestflow-infra` or any database/IO crate.

pub mod ingest;
pub mod repository;
