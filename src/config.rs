//! # Configuration
//!
//! Serde-backed configuration for topologies, nodes and connections.
//!
//! Every struct has defaults for each field, so an empty JSON object is a
//! valid configuration:
//!
//! ```rust
//! use topoweave::config::{ConnectionConfig, DropMode, TopologyConfig};
//!
//! let config = TopologyConfig::from_json(r#"{"default_capacity": 16}"#).unwrap();
//! assert_eq!(config.default_capacity, 16);
//!
//! let conn: ConnectionConfig =
//!   serde_json::from_str(r#"{"capacity": 1, "drop_mode": "drop_newest"}"#).unwrap();
//! assert_eq!(conn.drop_mode, DropMode::DropNewest);
//! ```

use crate::error::{Result, TopologyError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Input name used when a connection doesn't specify one.
pub const DEFAULT_INPUT_NAME: &str = "*";

/// Pipe capacity used when neither the connection nor the topology sets one.
pub const DEFAULT_CAPACITY: usize = 1024;

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]{0,126}$").expect("name pattern is a valid regex")
});

/// Validates a node or topology name.
///
/// Names start with an ASCII letter followed by letters, digits or
/// underscores, 127 characters at most.
pub fn validate_name(name: &str) -> Result<()> {
  if NAME_PATTERN.is_match(name) {
    Ok(())
  } else {
    Err(TopologyError::Validation(format!(
      "'{}' is not a valid name: it must start with a letter and contain only \
       letters, digits and underscores (at most 127 characters)",
      name
    )))
  }
}

/// What a pipe does when a record arrives and its queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropMode {
  /// Suspend the sender until space is available.
  #[default]
  Block,
  /// Discard the incoming record and count it as dropped.
  DropNewest,
}

impl DropMode {
  /// Returns the snake_case name used in status output.
  pub fn as_str(self) -> &'static str {
    match self {
      DropMode::Block => "block",
      DropMode::DropNewest => "drop_newest",
    }
  }
}

/// Topology-wide settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TopologyConfig {
  /// Capacity of pipes whose connection config doesn't set one.
  pub default_capacity: usize,
}

impl Default for TopologyConfig {
  fn default() -> Self {
    Self {
      default_capacity: DEFAULT_CAPACITY,
    }
  }
}

impl TopologyConfig {
  /// Parses a configuration from a JSON document.
  pub fn from_json(json: &str) -> Result<Self> {
    serde_json::from_str(json)
      .map_err(|e| TopologyError::Validation(format!("invalid topology config: {}", e)))
  }
}

/// Per-node settings given when the node is added to a topology.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
  /// Remove the node from its topology once it has stopped.
  pub remove_on_stop: bool,
  /// Maximum number of records handed to the unit concurrently.
  pub parallelism: usize,
}

impl Default for NodeConfig {
  fn default() -> Self {
    Self {
      remove_on_stop: false,
      parallelism: 1,
    }
  }
}

impl NodeConfig {
  /// Checks the configuration for invalid values.
  pub fn validate(&self) -> Result<()> {
    if self.parallelism == 0 {
      return Err(TopologyError::Validation(
        "parallelism must be at least 1".to_string(),
      ));
    }
    Ok(())
  }
}

/// Settings of a single connection (one pipe).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
  /// Name under which records arrive at the downstream node. Defaults to
  /// [`DEFAULT_INPUT_NAME`].
  pub input_name: Option<String>,
  /// Pipe capacity; 0 means synchronous hand-off.
  pub capacity: Option<usize>,
  /// Overflow policy.
  pub drop_mode: DropMode,
}

impl ConnectionConfig {
  /// Sets the input name.
  pub fn with_input_name(mut self, name: impl Into<String>) -> Self {
    self.input_name = Some(name.into());
    self
  }

  /// Sets the pipe capacity.
  pub fn with_capacity(mut self, capacity: usize) -> Self {
    self.capacity = Some(capacity);
    self
  }

  /// Sets the overflow policy.
  pub fn with_drop_mode(mut self, mode: DropMode) -> Self {
    self.drop_mode = mode;
    self
  }

  /// Returns the effective input name.
  pub fn input_name(&self) -> &str {
    self.input_name.as_deref().unwrap_or(DEFAULT_INPUT_NAME)
  }

  /// Returns the effective capacity given the topology default.
  pub fn capacity_or(&self, default: usize) -> usize {
    self.capacity.unwrap_or(default)
  }

  /// Checks the configuration for invalid values.
  pub fn validate(&self) -> Result<()> {
    let name = self.input_name();
    if name.is_empty() {
      return Err(TopologyError::Validation(
        "input name must not be empty".to_string(),
      ));
    }
    if name.chars().any(char::is_whitespace) {
      return Err(TopologyError::Validation(format!(
        "input name '{}' must not contain whitespace",
        name
      )));
    }
    Ok(())
  }
}
