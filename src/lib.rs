//! # Topoweave
//!
//! A continuous stream-processing runtime: tuples flow through a directed
//! graph of nodes connected by bounded pipes, every node running on its own
//! tokio task.
//!
//! ## Building Blocks
//!
//! - **Units** ([`unit`]): user logic. [`Source`]s generate tuples,
//!   [`Processor`]s (boxes) transform them, [`Sink`]s consume them
//! - **Pipes** ([`pipe`]): bounded, ordered queues with `block` or
//!   `drop_newest` overflow policies
//! - **Nodes** ([`node`]): a unit plus its fan-in ([`sources`]) and fan-out
//!   ([`destinations`]) port sets and a forward-only lifecycle
//! - **Topology** ([`topology`]): the named registry that wires nodes,
//!   starts them and shuts the graph down without losing queued tuples
//!
//! Failures in user units, panics included, stay inside their node and are
//! reported through [`NodeStatus`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use topoweave::{ConnectionConfig, NodeConfig, Topology, TopologyConfig};
//! # use topoweave::{Context, Result, Sink, Source, Tuple, Writer};
//! # use async_trait::async_trait;
//! # struct Ticker;
//! # #[async_trait]
//! # impl Source for Ticker {
//! #   async fn generate_stream(&self, _: &Context, _: &dyn Writer) -> Result<()> { Ok(()) }
//! # }
//! # struct Printer;
//! # #[async_trait]
//! # impl Sink for Printer {
//! #   async fn write(&self, _: &Context, _: Tuple) -> Result<()> { Ok(()) }
//! # }
//!
//! # async fn run() -> Result<()> {
//! let topology = Topology::new("quick_start", TopologyConfig::default())?;
//! topology.add_source("ticker", Ticker, NodeConfig::default())?;
//! topology.add_sink("printer", Printer, NodeConfig::default())?;
//! topology.connect("ticker", "printer", &ConnectionConfig::default())?;
//! topology.start()?;
//! // ...
//! topology.stop().await;
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Topology, node and connection configuration.
pub mod config;
/// Per-topology context handed to every unit call.
pub mod context;
/// Fan-out port set of a node.
pub mod destinations;
/// Error taxonomy.
pub mod error;
/// Tracing subscriber bootstrap.
pub mod logging;
/// Nodes and their run loops.
pub mod node;
/// Bounded pipes between nodes.
pub mod pipe;
/// Fan-in port set of a node.
pub mod sources;
/// Forward-only lifecycle state machine.
pub mod state;
/// Persistence contract for unit state.
pub mod storage;
/// Panic containment for unit calls.
pub mod supervision;
/// Named graphs of nodes.
pub mod topology;
/// The record type.
pub mod tuple;
/// Traits implemented by user logic.
pub mod unit;

pub use config::{ConnectionConfig, DropMode, NodeConfig, TopologyConfig};
pub use context::Context;
pub use error::{Result, TopologyError};
pub use node::{ConnDir, Node, NodeStatus, NodeType};
pub use state::NodeState;
pub use storage::{FileStateStorage, InMemoryStateStorage, StateStorage, StateWriter};
pub use topology::{Topology, TopologyStatus};
pub use tuple::Tuple;
pub use unit::{InputConstraints, Processor, Sink, Source, Writer};

#[cfg(test)]
mod pipe_test;
#[cfg(test)]
mod sources_test;
#[cfg(test)]
mod test_util;
