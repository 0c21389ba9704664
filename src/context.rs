//! # Context
//!
//! Every call into a user-supplied unit receives a [`Context`]. It identifies
//! the topology the call belongs to and exposes its configuration. Contexts
//! are cheap to clone and are shared by all nodes of a topology.

use crate::config::TopologyConfig;
use std::sync::Arc;

/// Execution context shared by all nodes of one topology.
#[derive(Clone, Debug)]
pub struct Context {
  topology: Arc<str>,
  config: Arc<TopologyConfig>,
}

impl Context {
  /// Creates a context for the named topology.
  pub fn new(topology: &str, config: TopologyConfig) -> Self {
    Self {
      topology: Arc::from(topology),
      config: Arc::new(config),
    }
  }

  /// Returns the topology name.
  pub fn topology_name(&self) -> &str {
    &self.topology
  }

  /// Returns the topology configuration.
  pub fn config(&self) -> &TopologyConfig {
    &self.config
  }

  /// Creates the tracing span under which a node's run loop executes.
  pub(crate) fn node_span(&self, node_type: &str, node_name: &str) -> tracing::Span {
    tracing::info_span!(
      "node",
      topology = %self.topology,
      node_type = node_type,
      node_name = node_name
    )
  }
}
