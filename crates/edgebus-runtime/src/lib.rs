//! `edgebus-runtime` – process-level plumbing for hosting edges.
//!
//! - [`config`] – TOML-backed [`EdgeConfig`] with `EDGEBUS_*` overrides.
//! - [`telemetry`] – `tracing` subscriber and optional OTLP export.
//! - [`wiring`] – builds an [`Edge`][edgebus_middleware::Edge] from an
//!   [`EdgeConfig`] over the in-memory bus.

pub mod config;
pub mod telemetry;
pub mod wiring;

pub use config::{ConfigError, EdgeConfig};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
pub use wiring::open_memory_edge;
