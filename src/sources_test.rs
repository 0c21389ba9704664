//! # Sources Test Suite
//!
//! Test suite for [`Sources`](crate::sources::Sources), the fan-in side of a
//! node.
//!
//! ## Test Coverage
//!
//! This test suite covers:
//!
//! - **Merging**: Per-pipe order across several inputs
//! - **Error Accounting**: Recoverable errors skip records, fatal ones end pouring
//! - **Stopping**: Forced and graceful stop, stop before pouring, stop-on-disconnect
//! - **Parallelism**: Bounded concurrent writes
//! - **Port Bookkeeping**: Duplicate and missing inputs

use crate::config::DropMode;
use crate::context::Context;
use crate::error::{Result, TopologyError};
use crate::pipe::pipe;
use crate::sources::Sources;
use crate::test_util::{RecordingWriter, WAIT, eventually, num, test_context, value_of};
use crate::tuple::Tuple;
use crate::unit::Writer;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;

// ============================================================================
// Test Writers
// ============================================================================

/// Fails with the configured error on value 3.
struct FailOnThree {
  fatal: bool,
  seen: AtomicUsize,
}

#[async_trait]
impl Writer for FailOnThree {
  async fn write(&self, _ctx: &Context, tuple: Tuple) -> Result<()> {
    self.seen.fetch_add(1, Ordering::SeqCst);
    if value_of(&tuple) != 3 {
      return Ok(());
    }
    if self.fatal {
      Err(TopologyError::fatal("three is fatal"))
    } else {
      Err(TopologyError::processing("three is skipped"))
    }
  }
}

fn pour_in_background(
  srcs: &Arc<Sources>,
  writer: &Arc<RecordingWriter>,
) -> tokio::task::JoinHandle<Result<()>> {
  let srcs = Arc::clone(srcs);
  let writer = Arc::clone(writer);
  tokio::spawn(async move { srcs.pour(&test_context(), writer.as_ref(), 1).await })
}

// ============================================================================
// Merging Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn merges_inputs_keeping_per_pipe_order() {
  let srcs = Arc::new(Sources::new("merge"));
  let (tx_a, rx_a) = pipe("a", 4, DropMode::Block);
  let (tx_b, rx_b) = pipe("b", 4, DropMode::Block);
  srcs.add("a", rx_a).unwrap();
  srcs.add("b", rx_b).unwrap();
  srcs.stop_on_disconnect();

  let writer = Arc::new(RecordingWriter::default());
  let pouring = pour_in_background(&srcs, &writer);

  let a = tokio::spawn(async move {
    for n in 0..50 {
      tx_a.send(num(n)).await.unwrap();
    }
    tx_a.close();
  });
  let b = tokio::spawn(async move {
    for n in 100..150 {
      tx_b.send(num(n)).await.unwrap();
    }
    tx_b.close();
  });
  a.await.unwrap();
  b.await.unwrap();
  timeout(WAIT, pouring).await.unwrap().unwrap().unwrap();

  let written = writer.written.lock().unwrap();
  let from_a: Vec<i64> = written.iter().filter(|t| t.input_name == "a").map(value_of).collect();
  let from_b: Vec<i64> = written.iter().filter(|t| t.input_name == "b").map(value_of).collect();
  assert_eq!(from_a, (0..50).collect::<Vec<_>>());
  assert_eq!(from_b, (100..150).collect::<Vec<_>>());
  assert_eq!(srcs.status().num_received_total, 100);
  assert!(srcs.is_empty());
}

// ============================================================================
// Error Accounting Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn recoverable_errors_are_counted_and_skipped() {
  let srcs = Sources::new("errors");
  let (tx, rx) = pipe("in", 8, DropMode::Block);
  srcs.add("up", rx).unwrap();
  srcs.stop_on_disconnect();
  for n in 1..=5 {
    tx.send(num(n)).await.unwrap();
  }
  tx.close();

  let writer = FailOnThree {
    fatal: false,
    seen: AtomicUsize::new(0),
  };
  timeout(WAIT, srcs.pour(&test_context(), &writer, 1))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(writer.seen.load(Ordering::SeqCst), 5);
  assert_eq!(srcs.status().num_errors, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn first_fatal_error_ends_pouring() {
  let srcs = Sources::new("fatal");
  let (tx, rx) = pipe("in", 8, DropMode::Block);
  srcs.add("up", rx).unwrap();
  for n in 1..=5 {
    tx.send(num(n)).await.unwrap();
  }

  let writer = FailOnThree {
    fatal: true,
    seen: AtomicUsize::new(0),
  };
  let err = timeout(WAIT, srcs.pour(&test_context(), &writer, 1))
    .await
    .unwrap()
    .unwrap_err();
  assert!(err.is_fatal());
  assert_eq!(writer.seen.load(Ordering::SeqCst), 3);
  // The inputs are released once pouring ended.
  assert!(tx.is_closed());
}

// ============================================================================
// Stopping Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn forced_stop_discards_queued_records() {
  let srcs = Arc::new(Sources::new("forced"));
  let (tx, rx) = pipe("in", 16, DropMode::Block);
  srcs.add("up", rx).unwrap();

  let writer = Arc::new(RecordingWriter::default());
  let pouring = pour_in_background(&srcs, &writer);
  tx.send(num(0)).await.unwrap();
  assert!(eventually(|| writer.written.lock().unwrap().len() == 1).await);

  timeout(WAIT, srcs.stop(&test_context())).await.unwrap();
  timeout(WAIT, pouring).await.unwrap().unwrap().unwrap();
  assert!(tx.send(num(1)).await.unwrap_err().is_closed());
  assert!(srcs.add("late", pipe("x", 1, DropMode::Block).1).unwrap_err().is_closed());
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_stop_drains_queued_records() {
  let srcs = Arc::new(Sources::new("graceful"));
  srcs.enable_graceful_stop();
  let (tx, rx) = pipe("in", 16, DropMode::Block);
  srcs.add("up", rx).unwrap();

  struct Slow(RecordingWriter);

  #[async_trait]
  impl Writer for Slow {
    async fn write(&self, ctx: &Context, tuple: Tuple) -> Result<()> {
      tokio::time::sleep(Duration::from_millis(2)).await;
      self.0.write(ctx, tuple).await
    }
  }

  let writer = Arc::new(Slow(RecordingWriter::default()));
  let pouring = {
    let srcs = Arc::clone(&srcs);
    let writer = Arc::clone(&writer);
    tokio::spawn(async move { srcs.pour(&test_context(), writer.as_ref(), 1).await })
  };
  for n in 0..10 {
    tx.send(num(n)).await.unwrap();
  }

  timeout(WAIT, srcs.stop(&test_context())).await.unwrap();
  timeout(WAIT, pouring).await.unwrap().unwrap().unwrap();
  let got: Vec<i64> = writer.0.written.lock().unwrap().iter().map(value_of).collect();
  assert_eq!(got, (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn stop_on_disconnect_without_inputs_returns_immediately() {
  let srcs = Sources::new("empty");
  srcs.stop_on_disconnect();
  let writer = RecordingWriter::default();
  timeout(WAIT, srcs.pour(&test_context(), &writer, 1))
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn stop_before_pour_closes_inputs() {
  let srcs = Sources::new("idle");
  let (tx, rx) = pipe("in", 1, DropMode::Block);
  srcs.add("up", rx).unwrap();

  srcs.stop(&test_context()).await;
  assert!(tx.is_closed());
  let writer = RecordingWriter::default();
  timeout(WAIT, srcs.pour(&test_context(), &writer, 1))
    .await
    .unwrap()
    .unwrap();
}

// ============================================================================
// Parallelism Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn parallelism_bounds_concurrent_writes() {
  struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
  }

  #[async_trait]
  impl Writer for Gauge {
    async fn write(&self, _ctx: &Context, _tuple: Tuple) -> Result<()> {
      let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
      self.max.fetch_max(now, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(10)).await;
      self.current.fetch_sub(1, Ordering::SeqCst);
      Ok(())
    }
  }

  let srcs = Sources::new("parallel");
  let (tx, rx) = pipe("in", 32, DropMode::Block);
  srcs.add("up", rx).unwrap();
  srcs.stop_on_disconnect();
  for n in 0..20 {
    tx.send(num(n)).await.unwrap();
  }
  tx.close();

  let gauge = Gauge {
    current: AtomicUsize::new(0),
    max: AtomicUsize::new(0),
  };
  timeout(WAIT, srcs.pour(&test_context(), &gauge, 3))
    .await
    .unwrap()
    .unwrap();
  let max = gauge.max.load(Ordering::SeqCst);
  assert!(max > 1 && max <= 3, "max concurrency was {max}");
  assert_eq!(srcs.status().num_received_total, 20);
}

// ============================================================================
// Port Bookkeeping Tests
// ============================================================================

#[test]
fn duplicate_and_missing_inputs() {
  let srcs = Sources::new("ports");
  srcs.add("up", pipe("in", 1, DropMode::Block).1).unwrap();
  assert!(srcs.add("up", pipe("in", 1, DropMode::Block).1).unwrap_err().is_conflict());
  assert!(srcs.remove("nope").unwrap_err().is_not_exist());

  let (tx, rx) = pipe("in", 1, DropMode::Block);
  srcs.add("other", rx).unwrap();
  srcs.remove("other").unwrap();
  assert!(tx.is_closed());
  assert_eq!(srcs.names(), vec!["up".to_string()]);
}
