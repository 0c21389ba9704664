//! # Destinations (fan-out)
//!
//! The output side of a node: a set of pipe senders keyed by downstream node
//! name. Every tuple written is broadcast to all of them.
//!
//! The owning node observes the set through a [`DestinationEvent`] callback:
//! `Connected` when a destination is added, `Disconnected` whenever one goes
//! away, whether it was removed explicitly, its consumer closed the pipe, or
//! the set itself was closed. Directional stop-on-disconnect is built on
//! these events.

use crate::context::Context;
use crate::error::{Result, TopologyError};
use crate::pipe::{PipeSender, PipeStats};
use crate::tuple::Tuple;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lifecycle event of a destination set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DestinationEvent {
  /// A destination was added; `count` is the new number of destinations.
  Connected {
    /// Number of destinations after the addition.
    count: usize,
  },
  /// Destination `name` became unreachable.
  Disconnected {
    /// Downstream node name.
    name: String,
    /// Number of destinations still attached.
    remaining: usize,
  },
}

/// Callback receiving [`DestinationEvent`]s. It runs on whichever task caused
/// the event and must not block.
pub type DestinationCallback = Arc<dyn Fn(DestinationEvent) + Send + Sync>;

/// Snapshot of a node's outputs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DestinationsStatus {
  /// Per-destination sends accepted by their pipe, dropped ones included.
  pub num_sent_total: u64,
  /// Deliveries abandoned because the node was being stopped.
  pub num_skipped: u64,
  /// Per-output pipe counters, keyed by downstream node name.
  pub outputs: BTreeMap<String, PipeStats>,
}

struct Output {
  sender: PipeSender,
  /// Child of the set-wide interrupt token; cancelled alone by `skip`.
  skip: CancellationToken,
}

struct DestInner {
  dsts: HashMap<String, Output>,
  closed: bool,
}

struct DestShared {
  node_name: String,
  inner: Mutex<DestInner>,
  callback: OnceLock<DestinationCallback>,
  interrupt: CancellationToken,
  num_sent: AtomicU64,
  num_skipped: AtomicU64,
}

impl DestShared {
  fn lock(&self) -> MutexGuard<'_, DestInner> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn emit(&self, event: DestinationEvent) {
    if let Some(callback) = self.callback.get() {
      callback(event);
    }
  }

  fn detach(&self, name: &str, id: u64) {
    let remaining = {
      let mut inner = self.lock();
      if !inner.dsts.get(name).is_some_and(|o| o.sender.id() == id) {
        return;
      }
      inner.dsts.remove(name);
      inner.dsts.len()
    };
    debug!(node_name = %self.node_name, destination = name, "Destination disconnected");
    self.emit(DestinationEvent::Disconnected {
      name: name.to_string(),
      remaining,
    });
  }
}

/// Output port set of a node.
pub struct Destinations {
  shared: Arc<DestShared>,
}

impl Destinations {
  /// Creates an empty output set for the named node.
  pub fn new(node_name: impl Into<String>) -> Self {
    Self {
      shared: Arc::new(DestShared {
        node_name: node_name.into(),
        inner: Mutex::new(DestInner {
          dsts: HashMap::new(),
          closed: false,
        }),
        callback: OnceLock::new(),
        interrupt: CancellationToken::new(),
        num_sent: AtomicU64::new(0),
        num_skipped: AtomicU64::new(0),
      }),
    }
  }

  /// Installs the event callback. Only the first call has an effect.
  pub fn set_callback(&self, callback: DestinationCallback) {
    let _ = self.shared.callback.set(callback);
  }

  /// Registers the sending end of a pipe to downstream node `name`.
  ///
  /// # Errors
  ///
  /// - [`TopologyError::Conflict`] if `name` is already a destination
  /// - [`TopologyError::Closed`] if the set is closed
  pub fn add(&self, name: &str, sender: PipeSender) -> Result<()> {
    let (count, handle) = {
      let mut inner = self.shared.lock();
      if inner.closed {
        return Err(TopologyError::Closed);
      }
      if inner.dsts.contains_key(name) {
        return Err(TopologyError::conflict("output", name));
      }
      let handle = sender.handle();
      let skip = self.shared.interrupt.child_token();
      inner.dsts.insert(name.to_string(), Output { sender, skip });
      (inner.dsts.len(), handle)
    };

    let weak: Weak<DestShared> = Arc::downgrade(&self.shared);
    let id = handle.id();
    let dst_name = name.to_string();
    handle.on_close(move || {
      if let Some(shared) = weak.upgrade() {
        shared.detach(&dst_name, id);
      }
    });
    self.shared.emit(DestinationEvent::Connected { count });
    Ok(())
  }

  /// Detaches destination `name` and closes its pipe.
  ///
  /// # Errors
  ///
  /// Returns [`TopologyError::NotExist`] if there is no such destination.
  pub fn remove(&self, name: &str) -> Result<()> {
    let (sender, remaining) = {
      let mut inner = self.shared.lock();
      let output = inner
        .dsts
        .remove(name)
        .ok_or_else(|| TopologyError::not_exist("output", name))?;
      (output.sender, inner.dsts.len())
    };
    sender.close();
    self.shared.emit(DestinationEvent::Disconnected {
      name: name.to_string(),
      remaining,
    });
    Ok(())
  }

  /// Undoes an `add` whose other half failed: detaches and closes the pipe
  /// without emitting an event.
  pub(crate) fn discard(&self, name: &str) {
    let output = self.shared.lock().dsts.remove(name);
    if let Some(output) = output {
      output.sender.close();
    }
  }

  /// Returns the names of the downstream nodes.
  pub fn names(&self) -> Vec<String> {
    self.shared.lock().dsts.keys().cloned().collect()
  }

  /// Returns the number of destinations.
  pub fn len(&self) -> usize {
    self.shared.lock().dsts.len()
  }

  /// Returns true if there are no destinations.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Broadcasts `tuple` to every destination.
  ///
  /// Destinations whose pipe is closed are detached. After
  /// [`Destinations::interrupt`], a send that would block is abandoned and
  /// the tuple skipped for that destination.
  pub async fn write(&self, _ctx: &Context, tuple: Tuple) -> Result<()> {
    let targets: Vec<(String, PipeSender, CancellationToken)> = {
      let inner = self.shared.lock();
      inner
        .dsts
        .iter()
        .map(|(name, o)| (name.clone(), o.sender.handle(), o.skip.clone()))
        .collect()
    };
    let Some(((last_name, last, last_skip), rest)) = targets.split_last() else {
      return Ok(());
    };
    for (name, sender, skip) in rest {
      self.send_to(name, sender, skip, tuple.clone()).await;
    }
    self.send_to(last_name, last, last_skip, tuple).await;
    Ok(())
  }

  async fn send_to(
    &self,
    name: &str,
    sender: &PipeSender,
    skip: &CancellationToken,
    tuple: Tuple,
  ) {
    let res = tokio::select! {
      biased;
      res = sender.send(tuple) => res,
      _ = skip.cancelled() => {
        self.shared.num_skipped.fetch_add(1, Ordering::Relaxed);
        debug!(node_name = %self.shared.node_name, destination = name, "Skipping a blocked destination while stopping");
        return;
      }
    };
    match res {
      Ok(()) => {
        self.shared.num_sent.fetch_add(1, Ordering::Relaxed);
      }
      // The close listener registered in `add` detaches the destination.
      Err(_) => {
        debug!(node_name = %self.shared.node_name, destination = name, "Destination pipe is closed");
      }
    }
  }

  /// Abandons sends blocked on full `Block` pipes, now and in the future.
  pub fn interrupt(&self) {
    self.shared.interrupt.cancel();
  }

  /// Like [`Destinations::interrupt`], limited to destination `name`.
  ///
  /// # Errors
  ///
  /// Returns [`TopologyError::NotExist`] if there is no such destination.
  pub fn skip(&self, name: &str) -> Result<()> {
    let inner = self.shared.lock();
    let output = inner
      .dsts
      .get(name)
      .ok_or_else(|| TopologyError::not_exist("output", name))?;
    output.skip.cancel();
    Ok(())
  }

  /// Closes every destination pipe and emits a `Disconnected` event per
  /// destination. Later additions fail with [`TopologyError::Closed`].
  pub fn close(&self, _ctx: &Context) {
    let senders: Vec<(String, PipeSender)> = {
      let mut inner = self.shared.lock();
      inner.closed = true;
      inner.dsts.drain().map(|(name, o)| (name, o.sender)).collect()
    };
    let mut remaining = senders.len();
    for (name, sender) in senders {
      sender.close();
      remaining -= 1;
      self.shared.emit(DestinationEvent::Disconnected { name, remaining });
    }
  }

  /// Returns output counters.
  pub fn status(&self) -> DestinationsStatus {
    let inner = self.shared.lock();
    DestinationsStatus {
      num_sent_total: self.shared.num_sent.load(Ordering::Relaxed),
      num_skipped: self.shared.num_skipped.load(Ordering::Relaxed),
      outputs: inner
        .dsts
        .iter()
        .map(|(name, o)| (name.clone(), o.sender.stats()))
        .collect(),
    }
  }
}
