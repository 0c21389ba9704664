//! # Sources (fan-in)
//!
//! The input side of a node: a set of pipe receivers keyed by upstream node
//! name, merged into one stream of tuples for the node's unit.
//!
//! ## Merge discipline
//!
//! Inputs are merged first-ready: every pipe becomes a stream and the streams
//! are polled fairly through a `SelectAll`. Order is preserved per pipe; there
//! is no ordering across pipes.
//!
//! ## Stopping
//!
//! - Forced stop (default): the loop exits once the records already handed
//!   to the unit are done; queued records are discarded.
//! - Graceful stop: every input pipe is closed, so upstreams can't send more,
//!   and the loop drains what is buffered before it exits.
//!
//! In both cases [`Sources::stop`] returns only after [`Sources::pour`] has
//! returned, unless pouring never started.

use crate::context::Context;
use crate::error::{Result, TopologyError};
use crate::pipe::{PipeReceiver, PipeStats};
use crate::tuple::Tuple;
use crate::unit::Writer;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, FuturesUnordered, SelectAll};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{Notify, watch};
use tracing::{error, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PourState {
  Idle,
  Pouring,
  Stopped,
}

struct SourcesInner {
  state: PourState,
  recvs: HashMap<String, PipeReceiver>,
  /// Receivers not yet merged into the pouring loop.
  pending: Vec<(String, PipeReceiver)>,
  graceful: bool,
  stop_on_disconnect: bool,
  stop_requested: bool,
}

enum InputItem {
  Tuple(Tuple),
  Closed { name: String, id: u64 },
}

/// Snapshot of a node's inputs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SourcesStatus {
  /// Tuples handed to the unit since the node was created.
  pub num_received_total: u64,
  /// Recoverable errors returned by the unit.
  pub num_errors: u64,
  /// Per-input pipe counters, keyed by upstream node name.
  pub inputs: BTreeMap<String, PipeStats>,
}

/// Input port set of a node.
pub struct Sources {
  node_name: String,
  inner: Mutex<SourcesInner>,
  /// Signalled when inputs are added or the stop flags change.
  changed: Notify,
  done: watch::Sender<bool>,
  num_received: AtomicU64,
  num_errors: AtomicU64,
}

fn input_stream(name: String, recv: PipeReceiver) -> impl Stream<Item = InputItem> + Send {
  async_stream::stream! {
    let id = recv.id();
    while let Some(tuple) = recv.recv().await {
      yield InputItem::Tuple(tuple);
    }
    yield InputItem::Closed { name, id };
  }
}

impl Sources {
  /// Creates an empty input set for the named node.
  pub fn new(node_name: impl Into<String>) -> Self {
    let (done, _) = watch::channel(false);
    Self {
      node_name: node_name.into(),
      inner: Mutex::new(SourcesInner {
        state: PourState::Idle,
        recvs: HashMap::new(),
        pending: Vec::new(),
        graceful: false,
        stop_on_disconnect: false,
        stop_requested: false,
      }),
      changed: Notify::new(),
      done,
      num_received: AtomicU64::new(0),
      num_errors: AtomicU64::new(0),
    }
  }

  fn lock(&self) -> MutexGuard<'_, SourcesInner> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Registers the receiving end of a pipe from upstream node `name`.
  ///
  /// # Errors
  ///
  /// - [`TopologyError::Conflict`] if `name` is already an input
  /// - [`TopologyError::Closed`] if the set is stopping or stopped
  pub fn add(&self, name: &str, recv: PipeReceiver) -> Result<()> {
    {
      let mut inner = self.lock();
      if inner.stop_requested || inner.state == PourState::Stopped {
        return Err(TopologyError::Closed);
      }
      if inner.recvs.contains_key(name) {
        return Err(TopologyError::conflict("input", name));
      }
      inner.pending.push((name.to_string(), recv.handle()));
      inner.recvs.insert(name.to_string(), recv);
    }
    self.changed.notify_waiters();
    Ok(())
  }

  /// Detaches input `name` and closes its pipe, discarding queued records.
  ///
  /// # Errors
  ///
  /// Returns [`TopologyError::NotExist`] if there is no such input.
  pub fn remove(&self, name: &str) -> Result<()> {
    let recv = {
      let mut inner = self.lock();
      inner.pending.retain(|(n, _)| n != name);
      inner
        .recvs
        .remove(name)
        .ok_or_else(|| TopologyError::not_exist("input", name))?
    };
    recv.close_and_discard();
    Ok(())
  }

  /// Returns the names of the upstream nodes.
  pub fn names(&self) -> Vec<String> {
    self.lock().recvs.keys().cloned().collect()
  }

  /// Returns the number of attached inputs.
  pub fn len(&self) -> usize {
    self.lock().recvs.len()
  }

  /// Returns true if no input is attached.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Makes later stops drain queued records instead of discarding them.
  pub fn enable_graceful_stop(&self) {
    self.lock().graceful = true;
  }

  /// Makes `pour` return once every input is closed, including right away
  /// when there are no inputs.
  pub fn stop_on_disconnect(&self) {
    self.lock().stop_on_disconnect = true;
    self.changed.notify_waiters();
  }

  /// Feeds tuples from every input to `writer` until the inputs are
  /// exhausted (with stop-on-disconnect armed) or a stop is requested.
  ///
  /// At most `parallelism` writes are in flight at once.
  ///
  /// # Errors
  ///
  /// Returns the first fatal error returned by `writer`. Recoverable errors
  /// are logged and counted; errors after the first fatal one are logged as
  /// secondary.
  pub async fn pour(&self, ctx: &Context, writer: &dyn Writer, parallelism: usize) -> Result<()> {
    {
      let mut inner = self.lock();
      match inner.state {
        PourState::Idle if inner.stop_requested && !inner.graceful => {
          drop(inner);
          self.finish_pour();
          return Ok(());
        }
        PourState::Idle => inner.state = PourState::Pouring,
        PourState::Pouring => {
          return Err(TopologyError::IllegalState(format!(
            "inputs of '{}' are already being poured",
            self.node_name
          )));
        }
        PourState::Stopped => return Ok(()),
      }
    }
    let _finish = scopeguard::guard((), |_| self.finish_pour());

    let parallelism = parallelism.max(1);
    let mut merged: SelectAll<BoxStream<'static, InputItem>> = SelectAll::new();
    let mut in_flight: FuturesUnordered<BoxFuture<'_, Result<()>>> = FuturesUnordered::new();
    let mut first_err: Option<TopologyError> = None;

    loop {
      let changed = self.changed.notified();
      tokio::pin!(changed);
      changed.as_mut().enable();
      {
        let mut inner = self.lock();
        for (name, recv) in inner.pending.drain(..) {
          merged.push(input_stream(name, recv).boxed());
        }
        if inner.stop_requested && !inner.graceful {
          break;
        }
        if merged.is_empty()
          && in_flight.is_empty()
          && (inner.stop_on_disconnect || inner.stop_requested)
        {
          break;
        }
      }

      let can_pull = in_flight.len() < parallelism && !merged.is_empty();
      tokio::select! {
        biased;
        _ = &mut changed => {}
        Some(res) = in_flight.next(), if !in_flight.is_empty() => {
          self.record_result(res, &mut first_err);
        }
        item = merged.next(), if can_pull => match item {
          Some(InputItem::Tuple(tuple)) => {
            self.num_received.fetch_add(1, Ordering::Relaxed);
            in_flight.push(writer.write(ctx, tuple));
          }
          Some(InputItem::Closed { name, id }) => self.detach_closed(&name, id),
          None => {}
        },
      }
      if first_err.is_some() {
        break;
      }
    }

    while let Some(res) = in_flight.next().await {
      self.record_result(res, &mut first_err);
    }
    first_err.map_or(Ok(()), Err)
  }

  fn record_result(&self, res: Result<()>, first_err: &mut Option<TopologyError>) {
    let Err(err) = res else {
      return;
    };
    if !err.is_fatal() {
      self.num_errors.fetch_add(1, Ordering::Relaxed);
      warn!(node_name = %self.node_name, error = %err, "Cannot process a tuple, skipping it");
      return;
    }
    if first_err.is_none() {
      *first_err = Some(err);
    } else {
      error!(node_name = %self.node_name, error = %err, "Secondary error while stopping the input loop");
    }
  }

  fn detach_closed(&self, name: &str, id: u64) {
    let mut inner = self.lock();
    if inner.recvs.get(name).is_some_and(|r| r.id() == id) {
      inner.recvs.remove(name);
    }
  }

  fn finish_pour(&self) {
    let (recvs, graceful) = {
      let mut inner = self.lock();
      inner.state = PourState::Stopped;
      inner.pending.clear();
      let recvs: Vec<PipeReceiver> = inner.recvs.drain().map(|(_, r)| r).collect();
      (recvs, inner.graceful)
    };
    for recv in recvs {
      if graceful {
        recv.close();
      } else {
        recv.close_and_discard();
      }
    }
    self.done.send_replace(true);
  }

  /// Stops pouring and waits until `pour` has returned.
  ///
  /// If `pour` hasn't started, the inputs are closed and the call returns
  /// right away. A later `pour` then returns immediately after a forced stop,
  /// or drains the closed inputs after a graceful one.
  pub async fn stop(&self, _ctx: &Context) {
    let (state, graceful, to_close) = {
      let mut inner = self.lock();
      inner.stop_requested = true;
      let to_close: Vec<PipeReceiver> = if inner.graceful && inner.state != PourState::Stopped {
        inner.recvs.values().map(PipeReceiver::handle).collect()
      } else {
        Vec::new()
      };
      (inner.state, inner.graceful, to_close)
    };
    for recv in to_close {
      recv.close();
    }
    self.changed.notify_waiters();

    match state {
      PourState::Idle if !graceful => self.finish_pour(),
      PourState::Idle => {}
      PourState::Pouring => {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
      }
      PourState::Stopped => {}
    }
  }

  /// Returns input counters.
  pub fn status(&self) -> SourcesStatus {
    let inner = self.lock();
    SourcesStatus {
      num_received_total: self.num_received.load(Ordering::Relaxed),
      num_errors: self.num_errors.load(Ordering::Relaxed),
      inputs: inner
        .recvs
        .iter()
        .map(|(name, r)| (name.clone(), r.stats()))
        .collect(),
    }
  }
}
