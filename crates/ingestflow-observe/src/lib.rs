//! Observability setup for ingestflow: tracing subscriber and optional
//! OpenTelemetry span export.

pub mod tracing_setup;
