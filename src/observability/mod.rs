//! Observability: structured logging via `tracing`.
//!
//! Console output is configurable as pretty, compact or JSON, and `RUST_LOG`
//! overrides the configured filter.

mod tracing_init;

pub use tracing_init::*;
