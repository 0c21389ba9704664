//! # Topology
//!
//! A named registry of nodes and the operations that build, start and tear
//! down the graph they form.
//!
//! Nodes are registered in the `Created` state and are not started until
//! [`Topology::start`] or [`Topology::start_node`] is called, so a graph can
//! be wired completely before any tuple flows.
//!
//! ## Shutdown order
//!
//! [`Topology::stop`] drains the graph from its roots:
//!
//! 1. graceful stop is enabled on every box and sink,
//! 2. sources are stopped,
//! 3. boxes are stopped in waves, upstream first; boxes on a cycle are
//!    stopped together,
//! 4. sinks are stopped.
//!
//! Each wave only starts once the previous one reached `Stopped`, so every
//! tuple a source emitted before the stop reaches the sinks.
//!
//! ## Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use topoweave::config::{ConnectionConfig, NodeConfig, TopologyConfig};
//! use topoweave::context::Context;
//! use topoweave::error::Result;
//! use topoweave::topology::Topology;
//! use topoweave::tuple::Tuple;
//! use topoweave::unit::{Sink, Source, Writer};
//!
//! struct Numbers;
//!
//! #[async_trait]
//! impl Source for Numbers {
//!   async fn generate_stream(&self, ctx: &Context, w: &dyn Writer) -> Result<()> {
//!     for n in 0..3 {
//!       w.write(ctx, Tuple::from_value(n.into())).await?;
//!     }
//!     Ok(())
//!   }
//! }
//!
//! struct Discard;
//!
//! #[async_trait]
//! impl Sink for Discard {
//!   async fn write(&self, _ctx: &Context, _t: Tuple) -> Result<()> {
//!     Ok(())
//!   }
//! }
//!
//! # tokio_test::block_on(async {
//! let topology = Topology::new("demo", TopologyConfig::default()).unwrap();
//! topology.add_source("numbers", Numbers, NodeConfig::default()).unwrap();
//! topology.add_sink("discard", Discard, NodeConfig::default()).unwrap();
//! topology.connect("numbers", "discard", &ConnectionConfig::default()).unwrap();
//! topology.start().unwrap();
//! topology.stop().await;
//! # });
//! ```

use crate::config::{ConnectionConfig, NodeConfig, TopologyConfig, validate_name};
use crate::context::Context;
use crate::error::{Result, TopologyError};
use crate::node::{Node, NodeStatus, NodeType, Unit};
use crate::state::{NodeState, StateHolder, StopPreparation};
use crate::unit::{Processor, Sink, Source};
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Point-in-time snapshot of a topology.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TopologyStatus {
  /// Topology name.
  pub name: String,
  /// Aggregate state.
  pub state: NodeState,
  /// Status of every registered node, keyed by name.
  pub nodes: BTreeMap<String, NodeStatus>,
}

pub(crate) struct TopologyShared {
  name: String,
  ctx: Context,
  state: StateHolder,
  nodes: Mutex<HashMap<String, Arc<Node>>>,
}

impl TopologyShared {
  fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Node>>> {
    self.nodes.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub(crate) fn lookup(&self, name: &str) -> Result<Arc<Node>> {
    self
      .lock()
      .get(name)
      .cloned()
      .ok_or_else(|| TopologyError::not_exist("node", name))
  }

  /// Stops node `name` and unregisters it.
  ///
  /// Boxed because a node stopping with remove-on-stop armed calls back into
  /// this method.
  pub(crate) fn remove_node(self: &Arc<Self>, name: String) -> BoxFuture<'static, Result<()>> {
    let shared = Arc::clone(self);
    async move {
      let node = shared.lookup(&name)?;
      node.stop().await;
      let removed = {
        let mut nodes = shared.lock();
        if nodes.get(&name).is_some_and(|n| Arc::ptr_eq(n, &node)) {
          nodes.remove(&name);
          true
        } else {
          false
        }
      };
      if removed {
        info!(topology = %shared.name, node_type = %node.node_type(), node_name = %name, "Node removed");
      }
      Ok(())
    }
    .boxed()
  }
}

/// A named graph of nodes.
///
/// Cloning yields another handle to the same topology.
#[derive(Clone)]
pub struct Topology {
  shared: Arc<TopologyShared>,
}

impl Topology {
  /// Creates an empty topology.
  ///
  /// # Errors
  ///
  /// Returns [`TopologyError::Validation`] if `name` is not a valid name.
  pub fn new(name: &str, config: TopologyConfig) -> Result<Self> {
    validate_name(name)?;
    Ok(Self {
      shared: Arc::new(TopologyShared {
        name: name.to_string(),
        ctx: Context::new(name, config),
        state: StateHolder::new(),
        nodes: Mutex::new(HashMap::new()),
      }),
    })
  }

  /// Returns the topology name.
  pub fn name(&self) -> &str {
    &self.shared.name
  }

  /// Returns the context shared by every node.
  pub fn context(&self) -> &Context {
    &self.shared.ctx
  }

  /// Returns the aggregate state.
  pub fn state(&self) -> NodeState {
    self.shared.state.get()
  }

  fn ensure_open(&self) -> Result<()> {
    if self.shared.state.get() >= NodeState::Stopping {
      return Err(TopologyError::IllegalState(format!(
        "topology '{}' is already stopped",
        self.shared.name
      )));
    }
    Ok(())
  }

  fn add_node(&self, name: &str, unit: Unit, config: NodeConfig) -> Result<Arc<Node>> {
    validate_name(name)?;
    config.validate()?;
    let node = {
      let mut nodes = self.shared.lock();
      // Checked under the registry lock so `stop` never misses a node.
      self.ensure_open()?;
      if nodes.contains_key(name) {
        return Err(TopologyError::conflict("node", name));
      }
      let node = Node::new(
        name,
        unit,
        &config,
        self.shared.ctx.clone(),
        Arc::downgrade(&self.shared),
      );
      nodes.insert(name.to_string(), Arc::clone(&node));
      node
    };
    info!(
      topology = %self.shared.name,
      node_type = %node.node_type(),
      node_name = name,
      "Node added"
    );
    Ok(node)
  }

  /// Registers a source node.
  ///
  /// # Errors
  ///
  /// - [`TopologyError::Validation`] for a bad name or config
  /// - [`TopologyError::Conflict`] if a node with that name exists
  /// - [`TopologyError::IllegalState`] if the topology is stopping or stopped
  pub fn add_source<S: Source + 'static>(&self, name: &str, source: S, config: NodeConfig) -> Result<Arc<Node>> {
    self.add_node(name, Unit::Source(Arc::new(source)), config)
  }

  /// Registers a box node. Fails like [`Topology::add_source`].
  pub fn add_box<P: Processor + 'static>(&self, name: &str, processor: P, config: NodeConfig) -> Result<Arc<Node>> {
    self.add_node(name, Unit::Box(Arc::new(processor)), config)
  }

  /// Registers a sink node. Fails like [`Topology::add_source`].
  pub fn add_sink<S: Sink + 'static>(&self, name: &str, sink: S, config: NodeConfig) -> Result<Arc<Node>> {
    self.add_node(name, Unit::Sink(Arc::new(sink)), config)
  }

  /// Connects the output of `from` to the input of `to`.
  ///
  /// # Errors
  ///
  /// Everything [`Node::input`] returns, [`TopologyError::NotExist`] if `to`
  /// is unknown, and [`TopologyError::IllegalState`] once the topology is
  /// stopping.
  pub fn connect(&self, from: &str, to: &str, config: &ConnectionConfig) -> Result<()> {
    self.ensure_open()?;
    self.node(to)?.input(from, config)
  }

  /// Returns node `name`.
  ///
  /// # Errors
  ///
  /// Returns [`TopologyError::NotExist`] if there is no such node.
  pub fn node(&self, name: &str) -> Result<Arc<Node>> {
    self.shared.lookup(name)
  }

  /// Returns every registered node, ordered by name.
  pub fn nodes(&self) -> Vec<Arc<Node>> {
    let mut nodes: Vec<Arc<Node>> = self.shared.lock().values().cloned().collect();
    nodes.sort_by(|a, b| a.name().cmp(b.name()));
    nodes
  }

  /// Starts every node still in the `Created` state and moves the topology
  /// to `Running`.
  ///
  /// # Errors
  ///
  /// Returns [`TopologyError::IllegalState`] if the topology is stopping or
  /// stopped.
  pub fn start(&self) -> Result<()> {
    self.ensure_open()?;
    self.shared.state.transition(NodeState::Created, NodeState::Starting);
    for node in self.nodes() {
      if node.state() != NodeState::Created {
        continue;
      }
      if let Err(err) = node.start() {
        // Lost a race with a concurrent start or stop of the same node.
        debug!(topology = %self.shared.name, node_name = node.name(), error = %err, "Node not started");
      }
    }
    self.shared.state.set(NodeState::Running)?;
    info!(topology = %self.shared.name, "Topology started");
    Ok(())
  }

  /// Starts node `name`.
  ///
  /// # Errors
  ///
  /// [`TopologyError::NotExist`] for an unknown node,
  /// [`TopologyError::IllegalState`] if it was already started.
  pub fn start_node(&self, name: &str) -> Result<()> {
    self.node(name)?.start()
  }

  /// Stops node `name`, unregisters it and releases its pipes.
  ///
  /// # Errors
  ///
  /// Returns [`TopologyError::NotExist`] if there is no such node.
  pub async fn remove(&self, name: &str) -> Result<()> {
    self.shared.remove_node(name.to_string()).await
  }

  /// Stops every node in dependency order and moves the topology to
  /// `Stopped`. Idempotent; concurrent callers return once it has stopped.
  pub async fn stop(&self) {
    match self.shared.state.prepare_for_stopping().await {
      StopPreparation::AlreadyStopped => return,
      StopPreparation::NeverStarted | StopPreparation::Proceed => {}
    }
    info!(topology = %self.shared.name, "Stopping topology");

    // Nodes that never ran release their pipes first, so running upstreams
    // see closed destinations instead of full ones.
    let (idle, nodes): (Vec<_>, Vec<_>) = self
      .nodes()
      .into_iter()
      .partition(|n| n.state() == NodeState::Created);
    join_all(idle.iter().map(|n| n.stop())).await;

    let mut sources = Vec::new();
    let mut boxes = Vec::new();
    let mut sinks = Vec::new();
    for node in nodes {
      match node.node_type() {
        NodeType::Source => sources.push(node),
        NodeType::Box => {
          node.enable_graceful_stop();
          boxes.push(node);
        }
        NodeType::Sink => {
          node.enable_graceful_stop();
          sinks.push(node);
        }
      }
    }

    join_all(sources.iter().map(|n| n.stop())).await;

    let upstreams: BTreeMap<String, BTreeSet<String>> = boxes
      .iter()
      .map(|n| (n.name().to_string(), n.sources().names().into_iter().collect()))
      .collect();
    let by_name: HashMap<&str, &Arc<Node>> = boxes.iter().map(|n| (n.name(), n)).collect();
    for wave in stop_waves(&upstreams) {
      debug!(topology = %self.shared.name, wave = ?wave, "Stopping boxes");
      join_all(wave.iter().filter_map(|name| by_name.get(name.as_str())).map(|n| n.stop())).await;
    }

    join_all(sinks.iter().map(|n| n.stop())).await;

    if let Err(err) = self.shared.state.set(NodeState::Stopped) {
      warn!(topology = %self.shared.name, error = %err, "Cannot mark the topology as stopped");
    }
    info!(topology = %self.shared.name, "Topology stopped");
  }

  /// Returns a snapshot of the topology and all its nodes.
  pub fn status(&self) -> TopologyStatus {
    TopologyStatus {
      name: self.shared.name.clone(),
      state: self.shared.state.get(),
      nodes: self
        .nodes()
        .into_iter()
        .map(|n| (n.name().to_string(), n.status()))
        .collect(),
    }
  }
}

impl std::fmt::Debug for Topology {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Topology")
      .field("name", &self.shared.name)
      .field("state", &self.shared.state.get())
      .finish()
  }
}

/// Groups nodes into stop waves, upstream first.
///
/// `upstreams` maps every node to the names of its upstream nodes; names that
/// aren't keys of the map are ignored. Nodes on a common cycle land in the
/// same wave.
pub(crate) fn stop_waves(upstreams: &BTreeMap<String, BTreeSet<String>>) -> Vec<Vec<String>> {
  let mut downstreams: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
  for (node, ups) in upstreams {
    for up in ups.iter().filter(|u| upstreams.contains_key(*u)) {
      downstreams.entry(up.as_str()).or_default().push(node.as_str());
    }
  }
  let reach = |start: &str| -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![start];
    while let Some(n) = stack.pop() {
      for &d in downstreams.get(n).into_iter().flatten() {
        if seen.insert(d.to_string()) {
          stack.push(d);
        }
      }
    }
    seen
  };
  let reachable: BTreeMap<&str, BTreeSet<String>> =
    upstreams.keys().map(|n| (n.as_str(), reach(n))).collect();
  // Strongly connected component of `n`, `n` included.
  let component = |n: &str| -> BTreeSet<String> {
    let mut c: BTreeSet<String> = reachable[n]
      .iter()
      .filter(|m| reachable[m.as_str()].contains(n))
      .cloned()
      .collect();
    c.insert(n.to_string());
    c
  };

  let mut remaining: BTreeSet<String> = upstreams.keys().cloned().collect();
  let mut waves = Vec::new();
  while !remaining.is_empty() {
    let mut wave: Vec<String> = remaining
      .iter()
      .filter(|n| {
        let comp = component(n.as_str());
        comp.iter().all(|member| {
          upstreams[member]
            .iter()
            .all(|u| !remaining.contains(u) || comp.contains(u))
        })
      })
      .cloned()
      .collect();
    if wave.is_empty() {
      wave = remaining.iter().cloned().collect();
    }
    for n in &wave {
      remaining.remove(n);
    }
    waves.push(wave);
  }
  waves
}
