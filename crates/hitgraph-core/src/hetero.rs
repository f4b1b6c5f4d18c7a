//! Heterogeneous event graphs.
//!
//! One detector event is a graph with several node types: one per readout
//! plane (2D hits), the shared 3D space points (`"sp"`, the nexus), and a
//! single-row event store (`"evt"`) that carries event-level targets and
//! predictions.
//!
//! Edges are stored in COO form as `(2, E)` `u32` tensors: row 0 holds
//! source indices (local to the source node type), row 1 target indices.
//!
//! # Example
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use hitgraph_core::hetero::{edge_index_from_pairs, EdgeType, HeteroGraph, NodeType};
//!
//! # fn main() -> hitgraph_core::Result<()> {
//! let device = Device::Cpu;
//! let mut g = HeteroGraph::new();
//!
//! let u = NodeType::new("u");
//! g.add_node_store(u.clone(), 3);
//! g.set_attr(&u, "x", Tensor::zeros((3, 4), candle_core::DType::F32, &device)?)?;
//! g.add_edges(EdgeType::plane("u"), edge_index_from_pairs(&[(0, 1), (1, 2)], &device)?)?;
//!
//! assert_eq!(g.num_nodes(&u), 3);
//! assert_eq!(g.num_edges(&EdgeType::plane("u")), 2);
//! # Ok(())
//! # }
//! ```

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Node type of the 3D space points shared between planes.
pub const NEXUS: &str = "sp";

/// Node type of the one-row-per-event store.
pub const EVENT: &str = "evt";

/// A node type identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeType(pub String);

impl NodeType {
    /// Create a new node type.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The nexus (space point) node type.
    pub fn nexus() -> Self {
        Self::new(NEXUS)
    }

    /// The event node type.
    pub fn event() -> Self {
        Self::new(EVENT)
    }

    /// Get the type name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S: Into<String>> From<S> for NodeType {
    fn from(s: S) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An edge type identifier, represented as (src_type, relation, dst_type).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeType {
    /// Source node type.
    pub src_type: NodeType,
    /// Relation name.
    pub relation: String,
    /// Destination node type.
    pub dst_type: NodeType,
}

impl EdgeType {
    /// Create a new edge type.
    pub fn new(
        src_type: impl Into<NodeType>,
        relation: impl Into<String>,
        dst_type: impl Into<NodeType>,
    ) -> Self {
        Self {
            src_type: src_type.into(),
            relation: relation.into(),
            dst_type: dst_type.into(),
        }
    }

    /// Hit-to-hit adjacency inside one plane: `(p, "plane", p)`.
    pub fn plane(plane: &str) -> Self {
        Self::new(plane, "plane", plane)
    }

    /// Hit-to-space-point links: `(p, "nexus", "sp")`.
    pub fn nexus(plane: &str) -> Self {
        Self::new(plane, "nexus", NEXUS)
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.src_type, self.relation, self.dst_type)
    }
}

/// Build a `(2, E)` edge index from `(src, dst)` pairs.
pub fn edge_index_from_pairs(pairs: &[(u32, u32)], device: &Device) -> Result<Tensor> {
    if pairs.is_empty() {
        return Ok(Tensor::zeros((2, 0), DType::U32, device)?);
    }
    let src: Vec<u32> = pairs.iter().map(|&(s, _)| s).collect();
    let dst: Vec<u32> = pairs.iter().map(|&(_, d)| d).collect();
    let n = pairs.len();
    let src = Tensor::from_vec(src, n, device)?;
    let dst = Tensor::from_vec(dst, n, device)?;
    Ok(Tensor::stack(&[src, dst], 0)?)
}

/// Node store for a specific node type: a node count plus named tensors
/// whose leading dimension is usually that count.
#[derive(Debug, Clone, Default)]
pub struct NodeStore {
    num_nodes: usize,
    attrs: BTreeMap<String, Tensor>,
}

impl NodeStore {
    /// Create a store with `num_nodes` nodes and no attributes.
    pub fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            attrs: BTreeMap::new(),
        }
    }

    /// Number of nodes.
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Get an attribute.
    pub fn get(&self, attr: &str) -> Option<&Tensor> {
        self.attrs.get(attr)
    }

    /// Set (or replace) an attribute.
    pub fn set(&mut self, attr: impl Into<String>, value: Tensor) {
        self.attrs.insert(attr.into(), value);
    }

    /// Iterate over `(name, tensor)` pairs in name order.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A heterogeneous graph with typed nodes and edges.
///
/// Similar to PyTorch Geometric's HeteroData, this stores separate
/// node and edge stores for each type.
#[derive(Debug, Clone, Default)]
pub struct HeteroGraph {
    /// Nodes by type.
    node_stores: BTreeMap<NodeType, NodeStore>,
    /// Edges by type, `(2, E)` u32.
    edge_stores: BTreeMap<EdgeType, Tensor>,
}

impl HeteroGraph {
    /// Create an empty heterogeneous graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all node types.
    pub fn node_types(&self) -> impl Iterator<Item = &NodeType> {
        self.node_stores.keys()
    }

    /// Get all edge types.
    pub fn edge_types(&self) -> impl Iterator<Item = &EdgeType> {
        self.edge_stores.keys()
    }

    /// Add (or reset) a node store with `num_nodes` nodes.
    pub fn add_node_store(&mut self, node_type: NodeType, num_nodes: usize) -> &mut NodeStore {
        let store = self.node_stores.entry(node_type).or_default();
        *store = NodeStore::new(num_nodes);
        store
    }

    /// Add the edges of one type, replacing any existing ones.
    ///
    /// Indices are converted to `u32`.
    pub fn add_edges(&mut self, edge_type: EdgeType, edge_index: Tensor) -> Result<()> {
        match edge_index.dims() {
            [2, _] => {}
            _ => return Err(Error::EdgeShape(edge_type.to_string())),
        }
        let edge_index = edge_index.to_dtype(DType::U32)?;
        self.edge_stores.insert(edge_type, edge_index);
        Ok(())
    }

    /// Get node store for a type.
    pub fn node_store(&self, node_type: &NodeType) -> Option<&NodeStore> {
        self.node_stores.get(node_type)
    }

    /// Node store for a type, or [`Error::MissingNodeStore`].
    pub fn try_node_store(&self, node_type: &NodeType) -> Result<&NodeStore> {
        self.node_stores
            .get(node_type)
            .ok_or_else(|| Error::MissingNodeStore(node_type.to_string()))
    }

    /// Set an attribute on an existing node store.
    pub fn set_attr(&mut self, node_type: &NodeType, attr: &str, value: Tensor) -> Result<()> {
        let store = self
            .node_stores
            .get_mut(node_type)
            .ok_or_else(|| Error::MissingNodeStore(node_type.to_string()))?;
        store.set(attr, value);
        Ok(())
    }

    /// Get an attribute, or [`Error::MissingAttr`].
    pub fn attr(&self, node_type: &NodeType, attr: &str) -> Result<&Tensor> {
        self.try_node_store(node_type)?
            .get(attr)
            .ok_or_else(|| Error::MissingAttr {
                store: node_type.to_string(),
                attr: attr.to_string(),
            })
    }

    /// Edge index for a type, or [`Error::MissingEdgeStore`].
    pub fn edge_index(&self, edge_type: &EdgeType) -> Result<&Tensor> {
        self.edge_stores
            .get(edge_type)
            .ok_or_else(|| Error::MissingEdgeStore(edge_type.to_string()))
    }

    /// Number of nodes of a given type.
    pub fn num_nodes(&self, node_type: &NodeType) -> usize {
        self.node_stores
            .get(node_type)
            .map(|s| s.num_nodes())
            .unwrap_or(0)
    }

    /// Number of edges of a given type.
    pub fn num_edges(&self, edge_type: &EdgeType) -> usize {
        self.edge_stores
            .get(edge_type)
            .map(|e| e.dims()[1])
            .unwrap_or(0)
    }

    /// Total number of nodes across all types.
    pub fn total_nodes(&self) -> usize {
        self.node_stores.values().map(|s| s.num_nodes()).sum()
    }

    /// Total number of edges across all types.
    pub fn total_edges(&self) -> usize {
        self.edge_stores.values().map(|e| e.dims()[1]).sum()
    }
}
