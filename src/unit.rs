//! # Processing Units
//!
//! User-supplied logic plugged into topology nodes:
//!
//! - [`Source`]: generates tuples (no inputs, 1+ outputs)
//! - [`Processor`]: transforms tuples, the "box" of a topology (inputs and outputs)
//! - [`Sink`]: consumes tuples (inputs, no outputs)
//!
//! Units are shared between the node's run loop and control calls, so every
//! method takes `&self`; units with mutable state keep it behind their own
//! lock. A node may call `process` concurrently when its parallelism is
//! above 1.
//!
//! Errors returned from `process`/`write` decide what the run loop does:
//! [`TopologyError::processing`] skips the record and keeps going, anything
//! else (see [`TopologyError::is_fatal`]) stops the node. Panics are caught
//! and stop the node as well.
//!
//! ## Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use topoweave::context::Context;
//! use topoweave::error::Result;
//! use topoweave::tuple::Tuple;
//! use topoweave::unit::{Processor, Writer};
//!
//! struct Double;
//!
//! #[async_trait]
//! impl Processor for Double {
//!   async fn process(&self, ctx: &Context, mut t: Tuple, w: &dyn Writer) -> Result<()> {
//!     if let Some(n) = t.get("n").and_then(|v| v.as_i64()) {
//!       t.data.insert("n".to_string(), (n * 2).into());
//!     }
//!     w.write(ctx, t).await
//!   }
//! }
//! ```

use crate::context::Context;
use crate::error::Result;
use crate::tuple::Tuple;
use async_trait::async_trait;
use std::collections::HashSet;

/// Receives tuples emitted by a unit.
#[async_trait]
pub trait Writer: Send + Sync {
  /// Emits one tuple downstream.
  async fn write(&self, ctx: &Context, tuple: Tuple) -> Result<()>;
}

/// Input names a unit accepts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InputConstraints {
  names: HashSet<String>,
}

impl InputConstraints {
  /// Accepts exactly the given names. `"*"` stands for the default input.
  pub fn new<I, S>(names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      names: names.into_iter().map(Into::into).collect(),
    }
  }

  /// Returns true if `name` is accepted.
  pub fn accepts(&self, name: &str) -> bool {
    self.names.contains(name)
  }
}

/// Transformation unit run by a box node.
#[async_trait]
pub trait Processor: Send + Sync {
  /// Processes one tuple, writing zero or more tuples to `writer`.
  async fn process(&self, ctx: &Context, tuple: Tuple, writer: &dyn Writer) -> Result<()>;

  /// Accepted input names; `None` accepts any name.
  fn input_constraints(&self) -> Option<InputConstraints> {
    None
  }

  /// Releases resources. Called exactly once when the node's run loop exits.
  async fn terminate(&self, _ctx: &Context) -> Result<()> {
    Ok(())
  }

  /// Unit-specific status included under the `box` key of the node status.
  fn status(&self) -> Option<serde_json::Value> {
    None
  }
}

/// Tuple generator run by a source node.
#[async_trait]
pub trait Source: Send + Sync {
  /// Writes tuples to `writer` until the source is exhausted or stopped.
  ///
  /// After a stop request, `writer` rejects tuples with
  /// [`TopologyError::Closed`](crate::error::TopologyError::Closed); returning
  /// that error is treated as a clean exit.
  async fn generate_stream(&self, ctx: &Context, writer: &dyn Writer) -> Result<()>;

  /// Asks `generate_stream` to return. Must not wait for it.
  async fn stop(&self, _ctx: &Context) -> Result<()> {
    Ok(())
  }

  /// Unit-specific status.
  fn status(&self) -> Option<serde_json::Value> {
    None
  }
}

/// Tuple consumer run by a sink node.
#[async_trait]
pub trait Sink: Send + Sync {
  /// Consumes one tuple.
  async fn write(&self, ctx: &Context, tuple: Tuple) -> Result<()>;

  /// Accepted input names; `None` accepts any name.
  fn input_constraints(&self) -> Option<InputConstraints> {
    None
  }

  /// Flushes and releases resources. Called exactly once at shutdown.
  async fn close(&self, _ctx: &Context) -> Result<()> {
    Ok(())
  }

  /// Unit-specific status.
  fn status(&self) -> Option<serde_json::Value> {
    None
  }
}
