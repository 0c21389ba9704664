//! Tracing bootstrap for binaries and tests embedding the runtime.
//!
//! The runtime only emits `tracing` events; installing a subscriber is left
//! to the application. [`init_tracing`] installs a `fmt` subscriber filtered
//! by `RUST_LOG`, falling back to `default_level` when the variable is unset
//! or invalid.

use crate::error::{Result, TopologyError};
use tracing_subscriber::EnvFilter;

/// Installs the global `fmt` subscriber.
///
/// # Errors
///
/// Returns [`TopologyError::Validation`] if `default_level` is not a valid
/// filter directive, or [`TopologyError::IllegalState`] if a global
/// subscriber is already installed.
pub fn init_tracing(default_level: &str) -> Result<()> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(default_level))
    .map_err(|e| TopologyError::Validation(format!("invalid log level '{default_level}': {e}")))?;

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(true)
    .try_init()
    .map_err(|e| TopologyError::IllegalState(format!("cannot install the tracing subscriber: {e}")))
}
