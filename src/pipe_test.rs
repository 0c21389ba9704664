//! # Pipe Test Suite
//!
//! Test suite for [`pipe`], the bounded queue between two nodes.
//!
//! ## Test Coverage
//!
//! This test suite covers:
//!
//! - **Overflow Policies**: Lossless `Block` delivery and `DropNewest` accounting
//! - **Synchronous Hand-off**: Capacity 0 under both policies
//! - **Closing**: Waking blocked ends, idempotence, discarding, close listeners

use crate::config::DropMode;
use crate::pipe::pipe;
use crate::test_util::{WAIT, num, value_of};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;

// ============================================================================
// Overflow Policy Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn block_pipe_delivers_every_record_in_order() {
  let (tx, rx) = pipe("in", 2, DropMode::Block);
  let producer = tokio::spawn(async move {
    for n in 0..100 {
      tx.send(num(n)).await.unwrap();
    }
    tx.close();
  });

  let mut got = Vec::new();
  while let Some(t) = timeout(WAIT, rx.recv()).await.unwrap() {
    assert_eq!(t.input_name, "in");
    got.push(value_of(&t));
  }
  producer.await.unwrap();
  assert_eq!(got, (0..100).collect::<Vec<_>>());
  let stats = rx.stats();
  assert_eq!(stats.num_sent, 100);
  assert_eq!(stats.num_received, 100);
  assert_eq!(stats.num_dropped, 0);
}

#[tokio::test]
async fn drop_newest_discards_incoming_records_when_full() {
  let (tx, rx) = pipe("in", 3, DropMode::DropNewest);
  for n in 0..10 {
    tx.send(num(n)).await.unwrap();
  }
  tx.close();

  let mut got = Vec::new();
  while let Some(t) = rx.recv().await {
    got.push(value_of(&t));
  }
  let stats = rx.stats();
  assert_eq!(got, vec![0, 1, 2]);
  assert_eq!(stats.num_dropped, 7);
  assert_eq!(got.len() as u64, 10 - stats.num_dropped);
}

#[tokio::test]
async fn capacity_one_drop_newest_keeps_at_most_one_record() {
  let (tx, rx) = pipe("in", 1, DropMode::DropNewest);
  for n in 0..5 {
    tx.send(num(n)).await.unwrap();
  }
  let stats = tx.stats();
  assert!(stats.num_dropped >= 4);
  assert!(stats.num_queued <= 1);
  assert_eq!(value_of(&rx.recv().await.unwrap()), 0);
}

// ============================================================================
// Synchronous Hand-off Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn zero_capacity_hands_off_synchronously() {
  let (tx, rx) = pipe("in", 0, DropMode::Block);
  let sent = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&sent);
  let producer = tokio::spawn(async move {
    tx.send(num(1)).await.unwrap();
    counter.fetch_add(1, Ordering::SeqCst);
  });

  tokio::time::sleep(Duration::from_millis(50)).await;
  assert_eq!(sent.load(Ordering::SeqCst), 0, "send returned before the record was taken");
  assert_eq!(value_of(&rx.recv().await.unwrap()), 1);
  timeout(WAIT, producer).await.unwrap().unwrap();
  assert_eq!(sent.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_capacity_drop_newest_only_hands_off_to_a_waiting_receiver() {
  let (tx, rx) = pipe("in", 0, DropMode::DropNewest);
  tx.send(num(0)).await.unwrap();
  let stats = tx.stats();
  assert_eq!(stats.num_dropped, 1);
  assert_eq!(stats.num_sent, 0);
  assert_eq!(stats.num_queued, 0);

  // A receiver that gave up waiting no longer counts.
  assert!(timeout(Duration::from_millis(20), rx.recv()).await.is_err());
  tx.send(num(1)).await.unwrap();
  assert_eq!(tx.stats().num_dropped, 2);

  let rx = Arc::new(rx);
  let waiting = Arc::clone(&rx);
  let receiver = tokio::spawn(async move { waiting.recv().await });
  let mut n = 2;
  while !receiver.is_finished() {
    tx.send(num(n)).await.unwrap();
    n += 1;
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  let got = timeout(WAIT, receiver).await.unwrap().unwrap().unwrap();
  assert!(value_of(&got) >= 2);
  let stats = tx.stats();
  assert_eq!(stats.num_sent, 1);
  assert_eq!(stats.num_queued, 0);
  assert_eq!(stats.num_sent + stats.num_dropped, n as u64);
}

// ============================================================================
// Closing Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn close_wakes_a_blocked_sender() {
  let (tx, rx) = pipe("in", 1, DropMode::Block);
  tx.send(num(0)).await.unwrap();
  let blocked = tokio::spawn(async move { tx.send(num(1)).await });

  tokio::time::sleep(Duration::from_millis(20)).await;
  rx.close();
  let res = timeout(WAIT, blocked).await.unwrap().unwrap();
  assert!(res.unwrap_err().is_closed());
}

#[tokio::test(flavor = "multi_thread")]
async fn close_wakes_a_blocked_receiver() {
  let (tx, rx) = pipe("in", 1, DropMode::Block);
  let blocked = tokio::spawn(async move { rx.recv().await });

  tokio::time::sleep(Duration::from_millis(20)).await;
  tx.close();
  assert!(timeout(WAIT, blocked).await.unwrap().unwrap().is_none());
}

#[tokio::test]
async fn close_is_idempotent_and_keeps_buffered_records() {
  let (tx, rx) = pipe("in", 4, DropMode::Block);
  tx.send(num(1)).await.unwrap();
  tx.send(num(2)).await.unwrap();
  tx.close();
  tx.close();
  rx.close();

  assert!(tx.send(num(3)).await.unwrap_err().is_closed());
  assert_eq!(value_of(&rx.recv().await.unwrap()), 1);
  assert_eq!(value_of(&rx.recv().await.unwrap()), 2);
  assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn close_and_discard_drops_buffered_records() {
  let (tx, rx) = pipe("in", 4, DropMode::Block);
  tx.send(num(1)).await.unwrap();
  rx.close_and_discard();
  assert!(rx.recv().await.is_none());
  assert!(tx.is_closed());
}

#[tokio::test]
async fn close_listeners_run_exactly_once() {
  let (tx, rx) = pipe("in", 1, DropMode::Block);
  let calls = Arc::new(AtomicUsize::new(0));
  let c = Arc::clone(&calls);
  tx.on_close(move || {
    c.fetch_add(1, Ordering::SeqCst);
  });

  rx.close();
  tx.close();
  rx.close_and_discard();
  assert_eq!(calls.load(Ordering::SeqCst), 1);

  // Registered after the close: runs right away.
  let c = Arc::clone(&calls);
  tx.on_close(move || {
    c.fetch_add(1, Ordering::SeqCst);
  });
  assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn pipes_get_distinct_ids() {
  let (a, _) = pipe("in", 1, DropMode::Block);
  let (b, _) = pipe("in", 1, DropMode::Block);
  assert_ne!(a.id(), b.id());
}
