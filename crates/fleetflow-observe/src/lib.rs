//! Observability setup for Fleetflow: tracing subscriber, log format
//! selection and optional OpenTelemetry export.

pub mod tracing_setup;

pub use tracing_setup::{LogFormat, init_tracing, shutdown_tracing};
