//! Lifecycle state machine for nodes and topologies.
//!
//! States only move forward: `Created → Starting → Running → Stopping →
//! Stopped`. A [`StateHolder`] keeps the current state in a `watch` channel so
//! any number of tasks can wait for a state without polling.

use crate::error::{Result, TopologyError};
use serde::Serialize;
use std::fmt;
use tokio::sync::watch;

/// Lifecycle state of a node or topology, ordered by progression.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
  /// Registered but never started.
  Created,
  /// `start` was called and the run loop is being set up.
  Starting,
  /// The run loop is processing records.
  Running,
  /// A stop was requested and the run loop is draining.
  Stopping,
  /// Terminal.
  Stopped,
}

impl NodeState {
  /// Returns the lowercase name of the state.
  pub fn as_str(self) -> &'static str {
    match self {
      NodeState::Created => "created",
      NodeState::Starting => "starting",
      NodeState::Running => "running",
      NodeState::Stopping => "stopping",
      NodeState::Stopped => "stopped",
    }
  }
}

impl fmt::Display for NodeState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// What a stop request has to do, decided atomically against the current state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopPreparation {
  /// The holder went from `Created` to `Stopping` without ever running; the
  /// caller owns the cleanup a run loop would otherwise have done and must set
  /// `Stopped` afterwards.
  NeverStarted,
  /// Another caller is already stopping; the holder has reached `Stopped`.
  AlreadyStopped,
  /// The holder moved from `Running` to `Stopping`; the caller drives the stop.
  Proceed,
}

/// Holds a [`NodeState`] and wakes waiters on every transition.
#[derive(Debug)]
pub struct StateHolder {
  tx: watch::Sender<NodeState>,
}

impl Default for StateHolder {
  fn default() -> Self {
    Self::new()
  }
}

impl StateHolder {
  /// Creates a holder in the `Created` state.
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(NodeState::Created);
    Self { tx }
  }

  /// Returns the current state.
  pub fn get(&self) -> NodeState {
    *self.tx.borrow()
  }

  /// Moves forward to `next`.
  ///
  /// Setting the current state again is a no-op. Moving backwards fails with
  /// [`TopologyError::IllegalState`] and leaves the state untouched.
  pub fn set(&self, next: NodeState) -> Result<()> {
    let mut current = next;
    self.tx.send_if_modified(|state| {
      current = *state;
      if next > *state {
        *state = next;
        true
      } else {
        false
      }
    });
    if next < current {
      return Err(TopologyError::IllegalState(format!(
        "cannot move from {} back to {}",
        current, next
      )));
    }
    Ok(())
  }

  /// Moves from `from` to `to` only if the current state is `from`.
  pub fn transition(&self, from: NodeState, to: NodeState) -> bool {
    debug_assert!(from < to);
    self.tx.send_if_modified(|state| {
      if *state == from {
        *state = to;
        true
      } else {
        false
      }
    })
  }

  /// Waits until the state reaches or passes `target` and returns the state
  /// observed at that moment.
  pub async fn wait(&self, target: NodeState) -> NodeState {
    let mut rx = self.tx.subscribe();
    match rx.wait_for(|state| *state >= target).await {
      Ok(state) => *state,
      // The sender lives as long as `self`, so this arm is unreachable in
      // practice; fall back to the current value.
      Err(_) => self.get(),
    }
  }

  /// Claims the `Created → Starting` transition for a run loop.
  pub(crate) fn prepare_for_running(&self, what: &str) -> Result<()> {
    if self.transition(NodeState::Created, NodeState::Starting) {
      return Ok(());
    }
    Err(TopologyError::IllegalState(format!(
      "the {} has already been {}",
      what,
      match self.get() {
        NodeState::Stopping | NodeState::Stopped => "stopped",
        _ => "started",
      }
    )))
  }

  /// Decides how a stop request proceeds. Only one caller ever gets
  /// [`StopPreparation::Proceed`] or [`StopPreparation::NeverStarted`].
  pub(crate) async fn prepare_for_stopping(&self) -> StopPreparation {
    loop {
      match self.get() {
        NodeState::Created => {
          if self.transition(NodeState::Created, NodeState::Stopping) {
            return StopPreparation::NeverStarted;
          }
        }
        NodeState::Starting => {
          self.wait(NodeState::Running).await;
        }
        NodeState::Running => {
          if self.transition(NodeState::Running, NodeState::Stopping) {
            return StopPreparation::Proceed;
          }
        }
        NodeState::Stopping | NodeState::Stopped => {
          self.wait(NodeState::Stopped).await;
          return StopPreparation::AlreadyStopped;
        }
      }
    }
  }
}
