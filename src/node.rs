//! # Node
//!
//! A named vertex of a topology wrapping one processing unit together with
//! its input ([`Sources`]) and output ([`Destinations`]) port sets.
//!
//! ## Node Types
//!
//! - **Source**: runs a [`Source`] unit; outputs only
//! - **Box**: runs a [`Processor`] unit; inputs and outputs
//! - **Sink**: runs a [`Sink`] unit; inputs only
//!
//! ## Lifecycle
//!
//! `Created → Starting → Running → Stopping → Stopped`, each transition at
//! most once. [`Node::start`] spawns the run loop on its own tokio task. When
//! the loop exits, for whatever reason, the node always:
//!
//! 1. terminates the unit (keeping the first error as the run error),
//! 2. closes its destinations, so downstream nodes see the disconnect,
//! 3. moves to `Stopped`,
//! 4. removes itself from the topology if remove-on-stop is armed.
//!
//! Unit failures, including panics, stay inside the node and are reported
//! by [`Node::status`].

use crate::config::{ConnectionConfig, NodeConfig};
use crate::context::Context;
use crate::destinations::{DestinationEvent, Destinations, DestinationsStatus};
use crate::error::{Result, TopologyError};
use crate::pipe::pipe;
use crate::sources::{Sources, SourcesStatus};
use crate::state::{NodeState, StateHolder, StopPreparation};
use crate::supervision::{panic_message, supervise};
use crate::topology::TopologyShared;
use crate::tuple::Tuple;
use crate::unit::{InputConstraints, Processor, Sink, Source, Writer};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{Instrument, debug, error, info, warn};

/// Kind of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
  /// Generates tuples.
  Source,
  /// Transforms tuples.
  Box,
  /// Consumes tuples.
  Sink,
}

impl NodeType {
  /// Returns the lowercase name of the type.
  pub fn as_str(self) -> &'static str {
    match self {
      NodeType::Source => "source",
      NodeType::Box => "box",
      NodeType::Sink => "sink",
    }
  }
}

impl fmt::Display for NodeType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Set of connection directions, combined with `|`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ConnDir(u8);

impl ConnDir {
  /// No direction.
  pub const NONE: ConnDir = ConnDir(0);
  /// Upstream connections (the node's inputs).
  pub const INBOUND: ConnDir = ConnDir(0b01);
  /// Downstream connections (the node's outputs).
  pub const OUTBOUND: ConnDir = ConnDir(0b10);
  /// Both directions.
  pub const BOTH: ConnDir = ConnDir(0b11);

  /// Returns true if every direction of `other` is in `self`.
  pub fn contains(self, other: ConnDir) -> bool {
    self.0 & other.0 == other.0 && other.0 != 0
  }
}

impl BitOr for ConnDir {
  type Output = ConnDir;

  fn bitor(self, rhs: ConnDir) -> ConnDir {
    ConnDir(self.0 | rhs.0)
  }
}

impl BitOrAssign for ConnDir {
  fn bitor_assign(&mut self, rhs: ConnDir) {
    self.0 |= rhs.0;
  }
}

/// The unit a node runs.
#[derive(Clone)]
pub(crate) enum Unit {
  /// Source unit.
  Source(Arc<dyn Source>),
  /// Box unit.
  Box(Arc<dyn Processor>),
  /// Sink unit.
  Sink(Arc<dyn Sink>),
}

impl Unit {
  fn node_type(&self) -> NodeType {
    match self {
      Unit::Source(_) => NodeType::Source,
      Unit::Box(_) => NodeType::Box,
      Unit::Sink(_) => NodeType::Sink,
    }
  }

  fn input_constraints(&self) -> Option<InputConstraints> {
    match self {
      Unit::Source(_) => None,
      Unit::Box(b) => b.input_constraints(),
      Unit::Sink(s) => s.input_constraints(),
    }
  }

  fn status(&self) -> Option<serde_json::Value> {
    match self {
      Unit::Source(s) => s.status(),
      Unit::Box(b) => b.status(),
      Unit::Sink(s) => s.status(),
    }
  }
}

/// Behaviour flags of a node as reported by [`NodeStatus`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Behaviors {
  /// Stop once every input is gone.
  pub stop_on_inbound_disconnect: bool,
  /// Stop once every output is gone.
  pub stop_on_outbound_disconnect: bool,
  /// Drain queued tuples when stopping.
  pub graceful_stop: bool,
  /// Leave the topology once stopped.
  pub remove_on_stop: bool,
}

/// Point-in-time snapshot of a node.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeStatus {
  /// Current state.
  pub state: NodeState,
  /// Node type.
  pub node_type: NodeType,
  /// Input counters; absent for sources.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub input_stats: Option<SourcesStatus>,
  /// Output counters; absent for sinks.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub output_stats: Option<DestinationsStatus>,
  /// Behaviour flags.
  pub behaviors: Behaviors,
  /// Run error, reported once the node has stopped.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  /// Status reported by the unit itself.
  #[serde(rename = "box", skip_serializing_if = "Option::is_none")]
  pub unit: Option<serde_json::Value>,
}

#[derive(Default)]
struct NodeFlags {
  graceful_stop: bool,
  stop_on_disconnect: ConnDir,
  remove_on_stop: bool,
  run_err: Option<Arc<TopologyError>>,
}

/// A node of a topology. Obtained from [`Topology`](crate::topology::Topology).
pub struct Node {
  name: String,
  node_type: NodeType,
  unit: Unit,
  parallelism: usize,
  ctx: Context,
  topology: Weak<TopologyShared>,
  srcs: Sources,
  dsts: Destinations,
  state: StateHolder,
  flags: Mutex<NodeFlags>,
}

impl Node {
  pub(crate) fn new(
    name: &str,
    unit: Unit,
    config: &NodeConfig,
    ctx: Context,
    topology: Weak<TopologyShared>,
  ) -> Arc<Node> {
    Arc::new_cyclic(|weak: &Weak<Node>| {
      let dsts = Destinations::new(name);
      let weak = weak.clone();
      dsts.set_callback(Arc::new(move |event: DestinationEvent| {
        if let Some(node) = weak.upgrade() {
          node.on_destination_event(event);
        }
      }));
      Node {
        name: name.to_string(),
        node_type: unit.node_type(),
        unit,
        parallelism: config.parallelism.max(1),
        ctx,
        topology,
        srcs: Sources::new(name),
        dsts,
        state: StateHolder::new(),
        flags: Mutex::new(NodeFlags {
          remove_on_stop: config.remove_on_stop,
          ..NodeFlags::default()
        }),
      }
    })
  }

  fn flags(&self) -> MutexGuard<'_, NodeFlags> {
    self.flags.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Returns the node name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Returns the node type.
  pub fn node_type(&self) -> NodeType {
    self.node_type
  }

  /// Returns the current state.
  pub fn state(&self) -> NodeState {
    self.state.get()
  }

  /// Waits until the node reaches or passes `target`.
  pub async fn wait(&self, target: NodeState) -> NodeState {
    self.state.wait(target).await
  }

  /// Returns the error that ended the run loop, if any.
  pub fn run_error(&self) -> Option<Arc<TopologyError>> {
    self.flags().run_err.clone()
  }

  /// Returns the input port set.
  pub fn sources(&self) -> &Sources {
    &self.srcs
  }

  /// Returns the output port set.
  pub fn destinations(&self) -> &Destinations {
    &self.dsts
  }

  fn topology(&self) -> Result<Arc<TopologyShared>> {
    self.topology.upgrade().ok_or_else(|| {
      TopologyError::IllegalState(format!("the topology of node '{}' is gone", self.name))
    })
  }

  /// Connects the output of node `upstream` to this node's input.
  ///
  /// Creates a pipe configured by `config`, registers its sending end on the
  /// upstream node's destinations and its receiving end on this node's
  /// sources. If the second registration fails, the first is rolled back.
  ///
  /// # Errors
  ///
  /// - [`TopologyError::Validation`] for an invalid config, an input name the
  ///   unit doesn't accept, a self-connection, a source as the downstream or
  ///   a sink as the upstream
  /// - [`TopologyError::NotExist`] if `upstream` isn't in the topology
  /// - [`TopologyError::Conflict`] if the two nodes are already connected
  /// - [`TopologyError::Closed`] if either side is stopping or stopped
  pub fn input(&self, upstream: &str, config: &ConnectionConfig) -> Result<()> {
    if self.node_type == NodeType::Source {
      return Err(TopologyError::Validation(format!(
        "source '{}' cannot have inputs",
        self.name
      )));
    }
    config.validate()?;
    if upstream == self.name {
      return Err(TopologyError::Validation(format!(
        "node '{}' cannot be connected to itself",
        self.name
      )));
    }
    let input_name = config.input_name();
    if let Some(constraints) = self.unit.input_constraints() {
      if !constraints.accepts(input_name) {
        return Err(TopologyError::Validation(format!(
          "node '{}' does not accept input '{}'",
          self.name, input_name
        )));
      }
    }

    let upstream_node = self.topology()?.lookup(upstream)?;
    if upstream_node.node_type == NodeType::Sink {
      return Err(TopologyError::Validation(format!(
        "sink '{}' cannot be connected to other nodes",
        upstream
      )));
    }

    let capacity = config.capacity_or(self.ctx.config().default_capacity);
    let (sender, receiver) = pipe(input_name, capacity, config.drop_mode);
    upstream_node.dsts.add(&self.name, sender)?;
    if let Err(err) = self.srcs.add(upstream, receiver) {
      upstream_node.dsts.discard(&self.name);
      return Err(err);
    }
    debug!(
      node_type = %self.node_type,
      node_name = %self.name,
      upstream = upstream,
      input_name = input_name,
      capacity = capacity,
      "Connected input"
    );
    Ok(())
  }

  /// Starts the run loop on a new tokio task.
  ///
  /// # Errors
  ///
  /// Returns [`TopologyError::IllegalState`] if the node was already started
  /// or stopped.
  pub fn start(self: &Arc<Self>) -> Result<()> {
    self.state.prepare_for_running(self.node_type.as_str())?;
    let node = Arc::clone(self);
    let span = self.ctx.node_span(self.node_type.as_str(), &self.name);
    tokio::spawn(async move { node.run().await }.instrument(span));
    Ok(())
  }

  async fn run(self: Arc<Self>) {
    if let Err(err) = self.state.set(NodeState::Running) {
      error!(error = %err, "Cannot mark the node as running");
    }
    info!("Node started");

    let ctx = &self.ctx;
    let run_err = match &self.unit {
      Unit::Source(source) => {
        let writer = SourceWriter { node: &*self };
        match supervise(source.generate_stream(ctx, &writer)).await {
          Err(err) if err.is_closed() && self.state.get() >= NodeState::Stopping => None,
          res => res.err(),
        }
      }
      Unit::Box(processor) => {
        let writer = BoxWriter {
          processor: processor.as_ref(),
          dsts: &self.dsts,
        };
        self.srcs.pour(ctx, &writer, self.parallelism).await.err()
      }
      Unit::Sink(sink) => {
        let writer = SinkWriter {
          sink: sink.as_ref(),
        };
        self.srcs.pour(ctx, &writer, self.parallelism).await.err()
      }
    };
    self.shutdown(run_err).await;
  }

  /// Terminates the unit, closes the destinations, moves to `Stopped` and
  /// honours remove-on-stop.
  async fn shutdown(&self, mut run_err: Option<TopologyError>) {
    // A loop that exits on its own still passes through `Stopping`.
    let _ = self.state.set(NodeState::Stopping);
    let ctx = &self.ctx;
    let terminated = match &self.unit {
      Unit::Source(_) => Ok(()),
      Unit::Box(processor) => supervise(processor.terminate(ctx)).await,
      Unit::Sink(sink) => supervise(sink.close(ctx)).await,
    };
    if let Err(err) = terminated {
      if run_err.is_none() {
        run_err = Some(err);
      } else {
        error!(
          node_type = %self.node_type,
          node_name = %self.name,
          error = %err,
          "Cannot terminate the unit"
        );
      }
    }

    self.dsts.close(ctx);

    let remove_on_stop = {
      let mut flags = self.flags();
      if let Some(err) = &run_err {
        error!(node_type = %self.node_type, node_name = %self.name, error = %err, "Node stopped with an error");
      }
      flags.run_err = run_err.map(Arc::new);
      flags.remove_on_stop
    };
    if let Err(err) = self.state.set(NodeState::Stopped) {
      error!(error = %err, "Cannot mark the node as stopped");
    }
    info!(node_type = %self.node_type, node_name = %self.name, "Node stopped");

    if remove_on_stop {
      self.remove_from_topology().await;
    }
  }

  async fn remove_from_topology(&self) {
    let Ok(topology) = self.topology() else {
      return;
    };
    match topology.remove_node(self.name.clone()).await {
      Ok(()) => {}
      Err(err) if err.is_not_exist() => {}
      Err(err) => {
        warn!(node_name = %self.name, error = %err, "Cannot remove the stopped node");
      }
    }
  }

  /// Stops the node and waits until it reaches `Stopped`.
  ///
  /// Idempotent; concurrent callers all return once the node has stopped.
  /// Errors are reported through [`Node::status`], never here.
  pub async fn stop(&self) {
    match self.state.prepare_for_stopping().await {
      StopPreparation::AlreadyStopped => {}
      StopPreparation::NeverStarted => {
        self.srcs.stop(&self.ctx).await;
        self.shutdown(None).await;
      }
      StopPreparation::Proceed => {
        let graceful = self.flags().graceful_stop;
        if graceful {
          self.skip_idle_destinations();
        } else {
          self.dsts.interrupt();
        }
        if let Unit::Source(source) = &self.unit {
          if let Err(err) = supervise(source.stop(&self.ctx)).await {
            warn!(node_name = %self.name, error = %err, "Cannot stop the source");
          }
        }
        self.srcs.stop(&self.ctx).await;
        self.state.wait(NodeState::Stopped).await;
      }
    }
  }

  /// Skips destinations whose node was never started. Nothing reads their
  /// pipes, so a graceful drain would block on them for good.
  fn skip_idle_destinations(&self) {
    let Ok(topology) = self.topology() else {
      return;
    };
    for name in self.dsts.names() {
      let idle = topology
        .lookup(&name)
        .is_ok_and(|node| node.state() == NodeState::Created);
      if idle && self.dsts.skip(&name).is_ok() {
        debug!(
          node_name = %self.name,
          destination = %name,
          "Skipping a destination that never started"
        );
      }
    }
  }

  /// Makes later stops drain queued tuples. Cannot be undone.
  pub fn enable_graceful_stop(&self) {
    self.flags().graceful_stop = true;
    self.srcs.enable_graceful_stop();
  }

  /// Arms automatic stopping when every connection in `dir` is gone.
  ///
  /// Directions accumulate across calls. With [`ConnDir::OUTBOUND`], a node
  /// that has no destinations at the time of the call stops right away.
  pub async fn stop_on_disconnect(&self, dir: ConnDir) {
    let dir = {
      let mut flags = self.flags();
      flags.stop_on_disconnect |= dir;
      flags.stop_on_disconnect
    };
    if dir.contains(ConnDir::INBOUND) && self.node_type != NodeType::Source {
      self.srcs.stop_on_disconnect();
    }
    if dir.contains(ConnDir::OUTBOUND) && self.node_type != NodeType::Sink && self.dsts.is_empty() {
      self.stop().await;
    }
  }

  fn on_destination_event(self: &Arc<Self>, event: DestinationEvent) {
    let DestinationEvent::Disconnected { remaining: 0, .. } = event else {
      return;
    };
    let armed = self.flags().stop_on_disconnect.contains(ConnDir::OUTBOUND);
    if !armed || self.state.get() >= NodeState::Stopping {
      return;
    }
    // The event may fire from inside this node's own run loop or from a
    // peer's control call; stopping here would wait on ourselves.
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        let node = Arc::clone(self);
        handle.spawn(async move { node.stop().await });
      }
      Err(_) => warn!(
        node_name = %self.name,
        "Outbound disconnect observed outside a runtime, cannot stop the node"
      ),
    }
  }

  /// Arms remove-on-stop. A node that is already stopped is removed now.
  pub async fn remove_on_stop(&self) {
    let stopped = {
      let mut flags = self.flags();
      flags.remove_on_stop = true;
      self.state.get() == NodeState::Stopped
    };
    if stopped {
      self.remove_from_topology().await;
    }
  }

  /// Returns a snapshot of the node taken under the node lock.
  ///
  /// The unit's own report is collected first, outside the lock. A unit that
  /// panics while reporting is described by an `{"error": ..}` placeholder.
  pub fn status(&self) -> NodeStatus {
    let unit = match panic::catch_unwind(AssertUnwindSafe(|| self.unit.status())) {
      Ok(unit) => unit,
      Err(payload) => {
        let msg = panic_message(payload.as_ref());
        warn!(node_name = %self.name, panic = %msg, "Unit panicked while reporting its status");
        Some(serde_json::json!({ "error": format!("status unavailable: {msg}") }))
      }
    };
    let flags = self.flags();
    let state = self.state.get();
    NodeStatus {
      state,
      node_type: self.node_type,
      input_stats: (self.node_type != NodeType::Source).then(|| self.srcs.status()),
      output_stats: (self.node_type != NodeType::Sink).then(|| self.dsts.status()),
      behaviors: Behaviors {
        stop_on_inbound_disconnect: flags.stop_on_disconnect.contains(ConnDir::INBOUND),
        stop_on_outbound_disconnect: flags.stop_on_disconnect.contains(ConnDir::OUTBOUND),
        graceful_stop: flags.graceful_stop,
        remove_on_stop: flags.remove_on_stop,
      },
      error: match (&flags.run_err, state) {
        (Some(err), NodeState::Stopped) => Some(err.to_string()),
        _ => None,
      },
      unit,
    }
  }
}

impl fmt::Debug for Node {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Node")
      .field("name", &self.name)
      .field("node_type", &self.node_type)
      .field("state", &self.state.get())
      .finish()
  }
}

struct SourceWriter<'a> {
  node: &'a Node,
}

#[async_trait]
impl Writer for SourceWriter<'_> {
  async fn write(&self, ctx: &Context, tuple: Tuple) -> Result<()> {
    if self.node.state.get() >= NodeState::Stopping {
      return Err(TopologyError::Closed);
    }
    self.node.dsts.write(ctx, tuple).await
  }
}

struct BoxWriter<'a> {
  processor: &'a dyn Processor,
  dsts: &'a Destinations,
}

#[async_trait]
impl Writer for BoxWriter<'_> {
  async fn write(&self, ctx: &Context, tuple: Tuple) -> Result<()> {
    supervise(self.processor.process(ctx, tuple, &DestinationWriter(self.dsts))).await
  }
}

struct DestinationWriter<'a>(&'a Destinations);

#[async_trait]
impl Writer for DestinationWriter<'_> {
  async fn write(&self, ctx: &Context, tuple: Tuple) -> Result<()> {
    self.0.write(ctx, tuple).await
  }
}

struct SinkWriter<'a> {
  sink: &'a dyn Sink,
}

#[async_trait]
impl Writer for SinkWriter<'_> {
  async fn write(&self, ctx: &Context, tuple: Tuple) -> Result<()> {
    supervise(self.sink.write(ctx, tuple)).await
  }
}
