//! Tracing bootstrap for hosts and examples.
//!
//! The runtime itself only emits `tracing` events; installing a subscriber
//! is the host's call. This helper wires the usual stack: env-filtered fmt
//! output plus span-trace capture for richer error reports.

use miette::Diagnostic;
use thiserror::Error;
use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Error, Diagnostic)]
pub enum TelemetryError {
    #[error("a global tracing subscriber is already installed")]
    #[diagnostic(code(flowstate::telemetry::already_installed))]
    AlreadyInstalled,
}

/// Install the default subscriber: `RUST_LOG`-filtered fmt output (info by
/// default) plus an [`ErrorLayer`] for span traces.
pub fn init() -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(ErrorLayer::default())
        .try_init()
        .map_err(|_| TelemetryError::AlreadyInstalled)
}
