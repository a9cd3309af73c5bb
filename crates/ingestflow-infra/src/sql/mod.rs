//! SQL rendering for the dynamic target tables.

pub mod dialect;
