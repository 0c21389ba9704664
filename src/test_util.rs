//! Units and helpers shared by the test modules.

use crate::context::Context;
use crate::error::{Result, TopologyError};
use crate::tuple::Tuple;
use crate::unit::{InputConstraints, Processor, Sink, Source, Writer};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Upper bound for every wait in tests.
pub(crate) const WAIT: Duration = Duration::from_secs(5);

pub(crate) fn num(n: i64) -> Tuple {
  Tuple::from_value(n.into())
}

pub(crate) fn value_of(t: &Tuple) -> i64 {
  t.get("value").and_then(|v| v.as_i64()).unwrap_or(-1)
}

pub(crate) fn test_context() -> Context {
  Context::new("test", Default::default())
}

/// Polls `cond` until it holds or [`WAIT`] elapses.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
  let deadline = tokio::time::Instant::now() + WAIT;
  while tokio::time::Instant::now() < deadline {
    if cond() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  cond()
}

/// Emits a fixed list of numbers, then optionally waits until stopped.
pub(crate) struct NumberSource {
  pub values: Vec<i64>,
  pub hold_open: bool,
  pub stopped: Arc<Notify>,
}

impl NumberSource {
  pub(crate) fn new(values: impl IntoIterator<Item = i64>) -> Self {
    Self {
      values: values.into_iter().collect(),
      hold_open: false,
      stopped: Arc::new(Notify::new()),
    }
  }

  pub(crate) fn held_open(mut self) -> Self {
    self.hold_open = true;
    self
  }
}

#[async_trait]
impl Source for NumberSource {
  async fn generate_stream(&self, ctx: &Context, writer: &dyn Writer) -> Result<()> {
    let stopped = self.stopped.notified();
    tokio::pin!(stopped);
    stopped.as_mut().enable();
    for &n in &self.values {
      writer.write(ctx, num(n)).await?;
    }
    if self.hold_open {
      stopped.await;
    }
    Ok(())
  }

  async fn stop(&self, _ctx: &Context) -> Result<()> {
    self.stopped.notify_one();
    Ok(())
  }
}

/// Collects every tuple it receives.
#[derive(Clone, Default)]
pub(crate) struct CollectSink {
  pub received: Arc<Mutex<Vec<Tuple>>>,
  pub closed: Arc<AtomicUsize>,
  pub delay: Option<Duration>,
  pub accepted: Option<Vec<&'static str>>,
}

impl CollectSink {
  pub(crate) fn values(&self) -> Vec<i64> {
    self.received.lock().unwrap().iter().map(value_of).collect()
  }

  pub(crate) fn len(&self) -> usize {
    self.received.lock().unwrap().len()
  }
}

#[async_trait]
impl Sink for CollectSink {
  async fn write(&self, _ctx: &Context, tuple: Tuple) -> Result<()> {
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    self.received.lock().unwrap().push(tuple);
    Ok(())
  }

  fn input_constraints(&self) -> Option<InputConstraints> {
    self.accepted.as_ref().map(|names| InputConstraints::new(names.iter().copied()))
  }

  async fn close(&self, _ctx: &Context) -> Result<()> {
    self.closed.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  fn status(&self) -> Option<serde_json::Value> {
    Some(serde_json::json!({ "received": self.len() }))
  }
}

/// Outcome of [`PassThrough::terminate`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum OnTerminate {
  #[default]
  Succeed,
  Fail,
  Panic,
}

/// Forwards tuples, optionally misbehaving on a given record.
#[derive(Clone, Default)]
pub(crate) struct PassThrough {
  pub calls: Arc<AtomicUsize>,
  pub terminated: Arc<AtomicUsize>,
  /// 1-based call number on which `process` panics.
  pub panic_on: Option<usize>,
  /// Values rejected with a recoverable error.
  pub reject: Vec<i64>,
  pub on_terminate: OnTerminate,
  pub panic_on_status: bool,
}

#[async_trait]
impl Processor for PassThrough {
  async fn process(&self, ctx: &Context, tuple: Tuple, writer: &dyn Writer) -> Result<()> {
    let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
    if self.panic_on == Some(call) {
      panic!("processor failed on call {call}");
    }
    if self.reject.contains(&value_of(&tuple)) {
      return Err(TopologyError::processing(format!("rejected {}", value_of(&tuple))));
    }
    writer.write(ctx, tuple).await
  }

  async fn terminate(&self, _ctx: &Context) -> Result<()> {
    self.terminated.fetch_add(1, Ordering::SeqCst);
    match self.on_terminate {
      OnTerminate::Succeed => Ok(()),
      OnTerminate::Fail => Err(TopologyError::fatal("cannot flush on terminate")),
      OnTerminate::Panic => panic!("terminate blew up"),
    }
  }

  fn status(&self) -> Option<serde_json::Value> {
    if self.panic_on_status {
      panic!("status blew up");
    }
    None
  }
}

/// Writer recording what a unit emits.
#[derive(Default)]
pub(crate) struct RecordingWriter {
  pub written: Mutex<Vec<Tuple>>,
}

#[async_trait]
impl Writer for RecordingWriter {
  async fn write(&self, _ctx: &Context, tuple: Tuple) -> Result<()> {
    self.written.lock().unwrap().push(tuple);
    Ok(())
  }
}
