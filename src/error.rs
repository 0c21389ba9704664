//! # Error Handling
//!
//! Error taxonomy shared by every part of the topology runtime.
//!
//! ## Overview
//!
//! - **Conflict**: a name was added twice (nodes, inputs, outputs)
//! - **NotExist**: an operation referenced an unknown name
//! - **Closed**: a pipe or port set was already closed
//! - **Validation**: bad configuration, bad name, or an input the unit refuses
//! - **Processing**: a unit failed on a record; recoverable unless marked fatal
//! - **PanicRecovered**: a unit panicked and the panic was caught
//! - **IllegalState**: a lifecycle operation was issued in the wrong state
//!
//! Node failures never cross node boundaries. A run loop records the first
//! fatal error and reports it through the node status.
//!
//! ## Example
//!
//! ```rust
//! use topoweave::error::TopologyError;
//!
//! let err = TopologyError::processing("malformed field");
//! assert!(!err.is_fatal());
//!
//! let err = TopologyError::fatal("disk full");
//! assert!(err.is_fatal());
//! ```

use std::error::Error;
use thiserror::Error;

/// Boxed error type used for errors raised by user-supplied units.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Result alias used throughout the crate.
pub type Result<T, E = TopologyError> = std::result::Result<T, E>;

/// Errors produced by the topology runtime.
#[derive(Error, Debug)]
pub enum TopologyError {
  /// A name was registered twice.
  #[error("{kind} '{name}' already exists")]
  Conflict {
    /// What kind of entity collided (node, input, output, ...).
    kind: &'static str,
    /// The duplicated name.
    name: String,
  },
  /// An operation referenced a name that isn't registered.
  #[error("{kind} '{name}' does not exist")]
  NotExist {
    /// What kind of entity was looked up.
    kind: &'static str,
    /// The missing name.
    name: String,
  },
  /// The pipe or port set is closed.
  #[error("the pipe is already closed")]
  Closed,
  /// Bad configuration, bad name, or unaccepted input.
  #[error("validation error: {0}")]
  Validation(String),
  /// A processing unit failed.
  #[error("processing error (fatal: {fatal}): {source}")]
  Processing {
    /// The unit's error.
    #[source]
    source: BoxError,
    /// Whether the error should terminate the node's run loop.
    fatal: bool,
  },
  /// A processing unit panicked; the panic was caught and converted.
  #[error("panic recovered: {0}")]
  PanicRecovered(String),
  /// A lifecycle operation was issued in a state that doesn't allow it.
  #[error("illegal state: {0}")]
  IllegalState(String),
  /// I/O failure in a storage backend.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl TopologyError {
  /// Creates a recoverable processing error. The record is skipped and the
  /// node keeps running.
  pub fn processing(err: impl Into<BoxError>) -> Self {
    Self::Processing {
      source: err.into(),
      fatal: false,
    }
  }

  /// Creates a fatal processing error. The node stops after it.
  pub fn fatal(err: impl Into<BoxError>) -> Self {
    Self::Processing {
      source: err.into(),
      fatal: true,
    }
  }

  pub(crate) fn conflict(kind: &'static str, name: impl Into<String>) -> Self {
    Self::Conflict {
      kind,
      name: name.into(),
    }
  }

  pub(crate) fn not_exist(kind: &'static str, name: impl Into<String>) -> Self {
    Self::NotExist {
      kind,
      name: name.into(),
    }
  }

  /// Returns true for [`TopologyError::Conflict`].
  pub fn is_conflict(&self) -> bool {
    matches!(self, Self::Conflict { .. })
  }

  /// Returns true for [`TopologyError::NotExist`].
  pub fn is_not_exist(&self) -> bool {
    matches!(self, Self::NotExist { .. })
  }

  /// Returns true for [`TopologyError::Closed`].
  pub fn is_closed(&self) -> bool {
    matches!(self, Self::Closed)
  }

  /// Returns true when the error must terminate a run loop.
  ///
  /// Recoverable processing errors are the only non-fatal kind; everything
  /// else a unit returns (closed pipes, panics, validation failures) ends the
  /// loop.
  pub fn is_fatal(&self) -> bool {
    match self {
      Self::Processing { fatal, .. } => *fatal,
      _ => true,
    }
  }
}
