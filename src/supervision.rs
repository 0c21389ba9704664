//! Supervised calls into user-supplied units.
//!
//! Every call a node makes into its unit goes through [`supervise`]: a panic
//! raised while the call's future is polled is caught and turned into
//! [`TopologyError::PanicRecovered`], so a faulty unit stops its own node and
//! never takes down the task driving it or the rest of the topology.

use crate::error::{Result, TopologyError};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Runs `fut`, converting a panic into [`TopologyError::PanicRecovered`].
///
/// The unit is considered poisoned after a panic; callers stop the node
/// rather than retrying.
pub async fn supervise<T, F>(fut: F) -> Result<T>
where
  F: Future<Output = Result<T>>,
{
  match AssertUnwindSafe(fut).catch_unwind().await {
    Ok(res) => res,
    Err(payload) => Err(TopologyError::PanicRecovered(panic_message(payload.as_ref()))),
  }
}

/// Extracts a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic payload".to_string()
  }
}
