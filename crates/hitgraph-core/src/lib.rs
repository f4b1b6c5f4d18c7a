//! Heterogeneous event graphs for hit-level reconstruction.
//!
//! `hitgraph-core` holds the data side of the network: typed node and edge
//! stores for one detector event, and the collation of many events into a
//! single batch that can be split back apart after the model has attached
//! its outputs.
//!
//! # Modules
//!
//! - [`hetero`]: node/edge types, node stores, one-event graphs
//! - [`batch`]: collation, batch-membership vectors, unbatching
//!
//! # Example
//!
//! ```rust
//! use candle_core::{DType, Device, Tensor};
//! use hitgraph_core::{HeteroBatch, HeteroGraph, NodeType};
//!
//! # fn main() -> hitgraph_core::Result<()> {
//! let device = Device::Cpu;
//! let u = NodeType::new("u");
//!
//! let mut events = Vec::new();
//! for n in [2, 3] {
//!     let mut g = HeteroGraph::new();
//!     g.add_node_store(u.clone(), n);
//!     g.set_attr(&u, "x", Tensor::zeros((n, 4), DType::F32, &device)?)?;
//!     events.push(g);
//! }
//!
//! let batch = HeteroBatch::from_data_list(&events)?;
//! assert_eq!(batch.num_nodes(&u), 5);
//! assert_eq!(batch.to_data_list()?.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod error;
pub mod hetero;

pub use batch::{canonical_order, unbatch, HeteroBatch, TaskOutputs};
pub use error::{Error, Result};
pub use hetero::{edge_index_from_pairs, EdgeType, HeteroGraph, NodeStore, NodeType, EVENT, NEXUS};
