//! # Pipe
//!
//! A bounded, ordered, single-producer/single-consumer queue of [`Tuple`]s
//! connecting one node's output to another node's input.
//!
//! ## Overflow policy
//!
//! - [`DropMode::Block`]: `send` suspends until there is room. Nothing is lost.
//! - [`DropMode::DropNewest`]: `send` never suspends; a record arriving at a
//!   full queue is discarded and counted in `num_dropped`.
//!
//! A capacity of 0 means synchronous hand-off: a blocking `send` returns once
//! the receiver has taken the record, and a `DropNewest` send is accepted
//! only while the receiver is waiting in `recv`, otherwise it is dropped.
//!
//! ## Closing
//!
//! Either end may close the pipe. Closing is idempotent, wakes blocked
//! senders and receivers, and runs the registered close listeners exactly
//! once. After a close, `send` fails with [`TopologyError::Closed`] while
//! `recv` keeps draining buffered records and then reports end-of-stream.
//!
//! ```rust
//! use topoweave::config::DropMode;
//! use topoweave::pipe::pipe;
//! use topoweave::tuple::Tuple;
//!
//! # tokio_test::block_on(async {
//! let (tx, rx) = pipe("in", 4, DropMode::Block);
//! tx.send(Tuple::from_value(serde_json::json!(1))).await.unwrap();
//! tx.close();
//! assert!(rx.recv().await.is_some());
//! assert!(rx.recv().await.is_none());
//! # });
//! ```

use crate::config::DropMode;
use crate::error::{Result, TopologyError};
use crate::tuple::Tuple;
use futures::Stream;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

type CloseListener = Box<dyn FnOnce() + Send>;

struct PipeQueue {
  buf: VecDeque<Tuple>,
  closed: bool,
  /// Number of records ever pushed, used for synchronous hand-off.
  pushed: u64,
  /// Number of records ever popped.
  popped: u64,
  /// Receivers suspended in `recv` waiting for a record.
  parked: usize,
  listeners: Vec<CloseListener>,
}

struct PipeShared {
  id: u64,
  input_name: String,
  capacity: usize,
  drop_mode: DropMode,
  queue: Mutex<PipeQueue>,
  /// Signalled when a record is pushed or the pipe closes.
  readable: Notify,
  /// Signalled when a record is popped or the pipe closes.
  writable: Notify,
  num_sent: AtomicU64,
  num_received: AtomicU64,
  num_dropped: AtomicU64,
}

impl PipeShared {
  fn lock(&self) -> MutexGuard<'_, PipeQueue> {
    // A panic while holding this lock can only come from a bug in this module;
    // the queue itself stays consistent, so keep going with the inner value.
    self.queue.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn close(&self, discard: bool) {
    let listeners = {
      let mut q = self.lock();
      if discard {
        q.buf.clear();
      }
      if q.closed {
        return;
      }
      q.closed = true;
      std::mem::take(&mut q.listeners)
    };
    self.readable.notify_waiters();
    self.writable.notify_waiters();
    for listener in listeners {
      listener();
    }
  }

  fn is_closed(&self) -> bool {
    self.lock().closed
  }

  fn stats(&self) -> PipeStats {
    let queued = self.lock().buf.len();
    PipeStats {
      num_sent: self.num_sent.load(Ordering::Relaxed),
      num_received: self.num_received.load(Ordering::Relaxed),
      num_dropped: self.num_dropped.load(Ordering::Relaxed),
      num_queued: queued,
      queue_size: self.capacity,
      drop_mode: self.drop_mode,
    }
  }
}

/// Counters of a single pipe.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipeStats {
  /// Records accepted into the queue.
  pub num_sent: u64,
  /// Records taken out of the queue by the receiver.
  pub num_received: u64,
  /// Records discarded because the queue was full (`DropNewest` only).
  pub num_dropped: u64,
  /// Records currently buffered.
  pub num_queued: usize,
  /// Configured capacity.
  pub queue_size: usize,
  /// Overflow policy.
  pub drop_mode: DropMode,
}

/// Creates a pipe and returns its sending and receiving ends.
///
/// `input_name` is stamped on every tuple that passes through the pipe.
pub fn pipe(
  input_name: impl Into<String>,
  capacity: usize,
  drop_mode: DropMode,
) -> (PipeSender, PipeReceiver) {
  let shared = Arc::new(PipeShared {
    id: NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed),
    input_name: input_name.into(),
    capacity,
    drop_mode,
    queue: Mutex::new(PipeQueue {
      buf: VecDeque::with_capacity(capacity.min(1024)),
      closed: false,
      pushed: 0,
      popped: 0,
      parked: 0,
      listeners: Vec::new(),
    }),
    readable: Notify::new(),
    writable: Notify::new(),
    num_sent: AtomicU64::new(0),
    num_received: AtomicU64::new(0),
    num_dropped: AtomicU64::new(0),
  });
  (
    PipeSender {
      shared: Arc::clone(&shared),
    },
    PipeReceiver { shared },
  )
}

/// Sending end of a pipe.
pub struct PipeSender {
  shared: Arc<PipeShared>,
}

impl PipeSender {
  /// Unique identifier of the pipe.
  pub fn id(&self) -> u64 {
    self.shared.id
  }

  /// Input name stamped on tuples.
  pub fn input_name(&self) -> &str {
    &self.shared.input_name
  }

  /// Sends a tuple according to the pipe's drop mode.
  ///
  /// # Errors
  ///
  /// Returns [`TopologyError::Closed`] if the pipe is closed, including when
  /// it gets closed while this call waits for room.
  pub async fn send(&self, mut tuple: Tuple) -> Result<()> {
    let shared = &*self.shared;
    tuple.input_name.clone_from(&shared.input_name);

    let seq = loop {
      let writable = shared.writable.notified();
      tokio::pin!(writable);
      writable.as_mut().enable();
      {
        let mut q = shared.lock();
        if q.closed {
          return Err(TopologyError::Closed);
        }
        let limit = match (shared.capacity, shared.drop_mode) {
          (0, DropMode::Block) => 1,
          // Without a buffer a record is only accepted by a parked receiver.
          (0, DropMode::DropNewest) => q.parked,
          (capacity, _) => capacity,
        };
        if q.buf.len() < limit {
          q.buf.push_back(tuple);
          q.pushed += 1;
          break q.pushed;
        }
        if shared.drop_mode == DropMode::DropNewest {
          shared.num_dropped.fetch_add(1, Ordering::Relaxed);
          return Ok(());
        }
      }
      writable.await;
    };
    shared.num_sent.fetch_add(1, Ordering::Relaxed);
    shared.readable.notify_waiters();

    if shared.capacity == 0 && shared.drop_mode == DropMode::Block {
      // Synchronous hand-off: wait until the receiver took this record.
      loop {
        let writable = shared.writable.notified();
        tokio::pin!(writable);
        writable.as_mut().enable();
        {
          let q = shared.lock();
          if q.popped >= seq || q.closed {
            break;
          }
        }
        writable.await;
      }
    }
    Ok(())
  }

  /// Closes the pipe. Buffered records stay available to the receiver.
  pub fn close(&self) {
    self.shared.close(false);
  }

  /// Returns true once either end closed the pipe.
  pub fn is_closed(&self) -> bool {
    self.shared.is_closed()
  }

  /// Registers a listener that runs exactly once when the pipe closes. If the
  /// pipe is already closed the listener runs immediately.
  pub fn on_close(&self, listener: impl FnOnce() + Send + 'static) {
    let mut q = self.shared.lock();
    if q.closed {
      drop(q);
      listener();
    } else {
      q.listeners.push(Box::new(listener));
    }
  }

  /// Returns the pipe counters.
  pub fn stats(&self) -> PipeStats {
    self.shared.stats()
  }

  pub(crate) fn handle(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

/// Receiving end of a pipe.
pub struct PipeReceiver {
  shared: Arc<PipeShared>,
}

impl PipeReceiver {
  /// Unique identifier of the pipe.
  pub fn id(&self) -> u64 {
    self.shared.id
  }

  /// Input name stamped on tuples.
  pub fn input_name(&self) -> &str {
    &self.shared.input_name
  }

  /// Receives the next tuple. Returns `None` once the pipe is closed and its
  /// buffer is drained.
  pub async fn recv(&self) -> Option<Tuple> {
    let shared = &*self.shared;
    loop {
      let readable = shared.readable.notified();
      tokio::pin!(readable);
      readable.as_mut().enable();
      {
        let mut q = shared.lock();
        if let Some(tuple) = q.buf.pop_front() {
          q.popped += 1;
          drop(q);
          shared.num_received.fetch_add(1, Ordering::Relaxed);
          shared.writable.notify_waiters();
          return Some(tuple);
        }
        if q.closed {
          return None;
        }
        q.parked += 1;
      }
      let _parked = scopeguard::guard((), |_| shared.lock().parked -= 1);
      readable.await;
    }
  }

  /// Closes the pipe. Buffered records can still be drained with `recv`.
  pub fn close(&self) {
    self.shared.close(false);
  }

  /// Closes the pipe and discards every buffered record.
  pub fn close_and_discard(&self) {
    self.shared.close(true);
  }

  /// Returns true once either end closed the pipe.
  pub fn is_closed(&self) -> bool {
    self.shared.is_closed()
  }

  /// Returns the pipe counters.
  pub fn stats(&self) -> PipeStats {
    self.shared.stats()
  }

  /// Turns the receiver into a stream that ends at end-of-stream.
  pub fn into_stream(self) -> impl Stream<Item = Tuple> + Send + 'static {
    async_stream::stream! {
      while let Some(tuple) = self.recv().await {
        yield tuple;
      }
    }
  }

  pub(crate) fn handle(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl std::fmt::Debug for PipeSender {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PipeSender")
      .field("id", &self.shared.id)
      .field("input_name", &self.shared.input_name)
      .field("closed", &self.is_closed())
      .finish()
  }
}

impl std::fmt::Debug for PipeReceiver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PipeReceiver")
      .field("id", &self.shared.id)
      .field("input_name", &self.shared.input_name)
      .field("closed", &self.is_closed())
      .finish()
  }
}
