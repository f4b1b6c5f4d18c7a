//! Collating events into batches and splitting them apart again.
//!
//! A [`HeteroBatch`] concatenates independent events into one
//! [`HeteroGraph`]:
//!
//! - node attributes are concatenated along dim 0,
//! - edge indices are offset by the cumulative node counts of their
//!   endpoint types,
//! - every node type gets a `u32` batch-membership vector mapping each node
//!   to its event.
//!
//! Row slices are recorded per attribute, so attributes attached after
//! collation (decoder outputs, which may be per-node or per-event) can be
//! split back into their events with [`HeteroBatch::to_data_list`].
//!
//! # Canonical ordering
//!
//! Inside one event nodes are always visited by ascending batch index
//! ([`canonical_order`]). Order-sensitive pooling relies on this.

use candle_core::{Device, Tensor};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::hetero::{EdgeType, HeteroGraph, NodeType};

/// Model outputs keyed by attribute name, then node type name.
///
/// `outputs["x_semantic"]["u"]` is the semantic score tensor of plane `u`.
pub type TaskOutputs = BTreeMap<String, BTreeMap<String, Tensor>>;

/// Group node indices by event, keeping ascending index order inside each
/// event.
pub fn canonical_order(batch: &[u32], num_graphs: usize) -> Result<Vec<Vec<u32>>> {
    let mut groups = vec![Vec::new(); num_graphs];
    for (i, &b) in batch.iter().enumerate() {
        let group = groups.get_mut(b as usize).ok_or_else(|| {
            Error::Inconsistent(format!(
                "node {i} belongs to event {b} but the batch has {num_graphs} events"
            ))
        })?;
        group.push(i as u32);
    }
    Ok(groups)
}

/// Split the rows of `t` by event membership.
///
/// Returns one tensor per event (possibly with zero rows), rows in
/// canonical order. Differentiable: pieces are index-selects of `t`.
pub fn unbatch(t: &Tensor, batch: &[u32], num_graphs: usize) -> Result<Vec<Tensor>> {
    let groups = canonical_order(batch, num_graphs)?;
    groups
        .into_iter()
        .map(|idx| {
            if idx.is_empty() {
                return Ok(t.narrow(0, 0, 0)?);
            }
            let n = idx.len();
            let idx = Tensor::from_vec(idx, n, t.device())?;
            Ok(t.index_select(&idx, 0)?)
        })
        .collect()
}

/// Concatenate along dim 0, skipping empty pieces.
fn cat_rows(parts: &[Tensor]) -> Result<Tensor> {
    let non_empty: Vec<&Tensor> = parts.iter().filter(|t| t.dims()[0] > 0).collect();
    match (non_empty.len(), parts.first()) {
        (0, Some(first)) => Ok(first.clone()),
        (0, None) => Err(Error::EmptyBatch),
        _ => Ok(Tensor::cat(&non_empty, 0)?),
    }
}

fn cumulative(counts: impl Iterator<Item = usize>) -> Vec<usize> {
    let mut ptr = vec![0];
    let mut acc = 0;
    for c in counts {
        acc += c;
        ptr.push(acc);
    }
    ptr
}

fn offset_edges(edge_index: &Tensor, src_offset: i64, dst_offset: i64) -> Result<Tensor> {
    let rows = edge_index.to_vec2::<u32>()?;
    let shift = |row: &[u32], by: i64| -> Vec<u32> {
        row.iter().map(|&v| (v as i64 + by) as u32).collect()
    };
    let n = rows[0].len();
    let device = edge_index.device();
    let src = Tensor::from_vec(shift(&rows[0], src_offset), n, device)?;
    let dst = Tensor::from_vec(shift(&rows[1], dst_offset), n, device)?;
    Ok(Tensor::stack(&[src, dst], 0)?)
}

/// A set of independent events concatenated into one heterogeneous graph.
#[derive(Debug, Clone)]
pub struct HeteroBatch {
    graph: HeteroGraph,
    num_graphs: usize,
    /// Per node type: event membership of every node, `(N,)` u32.
    batch: BTreeMap<NodeType, Tensor>,
    /// Per node type: cumulative node counts, length `num_graphs + 1`.
    node_ptr: BTreeMap<NodeType, Vec<usize>>,
    /// Per edge type: cumulative edge counts.
    edge_ptr: BTreeMap<EdgeType, Vec<usize>>,
    /// Per attribute: cumulative row counts.
    attr_ptr: BTreeMap<(NodeType, String), Vec<usize>>,
}

impl HeteroBatch {
    /// Collate events. All events must share node types, edge types and
    /// attribute names.
    pub fn from_data_list(graphs: &[HeteroGraph]) -> Result<Self> {
        let first = graphs.first().ok_or(Error::EmptyBatch)?;
        let device = graph_device(first);
        let num_graphs = graphs.len();

        let mut graph = HeteroGraph::new();
        let mut batch = BTreeMap::new();
        let mut node_ptr = BTreeMap::new();
        let mut attr_ptr = BTreeMap::new();

        for node_type in first.node_types() {
            let stores = graphs
                .iter()
                .map(|g| g.try_node_store(node_type))
                .collect::<Result<Vec<_>>>()?;
            let ptr = cumulative(stores.iter().map(|s| s.num_nodes()));
            let total = ptr[num_graphs];

            let membership: Vec<u32> = stores
                .iter()
                .enumerate()
                .flat_map(|(b, s)| std::iter::repeat(b as u32).take(s.num_nodes()))
                .collect();
            batch.insert(
                node_type.clone(),
                Tensor::from_vec(membership, total, &device)?,
            );

            let collated = graph.add_node_store(node_type.clone(), total);
            for (attr, _) in stores[0].attrs() {
                let parts = stores
                    .iter()
                    .map(|s| {
                        s.get(attr).cloned().ok_or_else(|| Error::MissingAttr {
                            store: node_type.to_string(),
                            attr: attr.to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let rows = cumulative(parts.iter().map(|t| t.dims()[0]));
                collated.set(attr, cat_rows(&parts)?);
                attr_ptr.insert((node_type.clone(), attr.to_string()), rows);
            }
            node_ptr.insert(node_type.clone(), ptr);
        }

        let mut edge_ptr = BTreeMap::new();
        for edge_type in first.edge_types() {
            let src_ptr = node_ptr
                .get(&edge_type.src_type)
                .ok_or_else(|| Error::MissingNodeStore(edge_type.src_type.to_string()))?;
            let dst_ptr = node_ptr
                .get(&edge_type.dst_type)
                .ok_or_else(|| Error::MissingNodeStore(edge_type.dst_type.to_string()))?;

            let mut parts = Vec::with_capacity(num_graphs);
            for (b, g) in graphs.iter().enumerate() {
                let e = g.edge_index(edge_type)?;
                parts.push(offset_edges(e, src_ptr[b] as i64, dst_ptr[b] as i64)?);
            }
            let ptr = cumulative(parts.iter().map(|e| e.dims()[1]));
            let non_empty: Vec<&Tensor> = parts.iter().filter(|e| e.dims()[1] > 0).collect();
            let joined = if non_empty.is_empty() {
                parts[0].clone()
            } else {
                Tensor::cat(&non_empty, 1)?
            };
            graph.add_edges(edge_type.clone(), joined)?;
            edge_ptr.insert(edge_type.clone(), ptr);
        }

        tracing::debug!(
            num_graphs,
            total_nodes = graph.total_nodes(),
            total_edges = graph.total_edges(),
            "collated batch"
        );

        Ok(Self {
            graph,
            num_graphs,
            batch,
            node_ptr,
            edge_ptr,
            attr_ptr,
        })
    }

    /// Number of events in the batch.
    pub fn num_graphs(&self) -> usize {
        self.num_graphs
    }

    /// The collated graph.
    pub fn graph(&self) -> &HeteroGraph {
        &self.graph
    }

    /// Number of nodes of a type across all events.
    pub fn num_nodes(&self, node_type: &NodeType) -> usize {
        self.graph.num_nodes(node_type)
    }

    /// Event membership of every node of a type.
    pub fn batch_vector(&self, node_type: &NodeType) -> Result<&Tensor> {
        self.batch
            .get(node_type)
            .ok_or_else(|| Error::MissingNodeStore(node_type.to_string()))
    }

    /// Get a collated attribute.
    pub fn attr(&self, node_type: &NodeType, attr: &str) -> Result<&Tensor> {
        self.graph.attr(node_type, attr)
    }

    /// Get a collated edge index.
    pub fn edge_index(&self, edge_type: &EdgeType) -> Result<&Tensor> {
        self.graph.edge_index(edge_type)
    }

    /// Attach decoder outputs to the batch.
    ///
    /// Each tensor is aligned by its leading size: a tensor with one row per
    /// node of its store is split by that store's membership, a tensor with
    /// one row per event is split row by row. Anything else is an
    /// [`Error::Unbatch`]. The per-event pieces are concatenated back and
    /// stored under the attribute name.
    pub fn attach_outputs(&mut self, outputs: &TaskOutputs) -> Result<()> {
        for (attr, stores) in outputs {
            for (store, t) in stores {
                let node_type = NodeType::new(store.as_str());
                let num_nodes = self.graph.try_node_store(&node_type)?.num_nodes();
                let rows = t.dims().first().copied().unwrap_or(0);

                let membership: Vec<u32> = if rows == num_nodes {
                    self.batch_vector(&node_type)?.to_vec1::<u32>()?
                } else if rows == self.num_graphs {
                    (0..self.num_graphs as u32).collect()
                } else {
                    return Err(Error::Unbatch {
                        attr: attr.clone(),
                        store: store.clone(),
                        rows,
                        num_nodes,
                        num_graphs: self.num_graphs,
                    });
                };

                let pieces = unbatch(t, &membership, self.num_graphs)?;
                let ptr = cumulative(pieces.iter().map(|p| p.dims()[0]));
                self.graph.set_attr(&node_type, attr, cat_rows(&pieces)?)?;
                self.attr_ptr.insert((node_type, attr.clone()), ptr);
            }
        }
        Ok(())
    }

    /// Split the batch back into its events.
    pub fn to_data_list(&self) -> Result<Vec<HeteroGraph>> {
        let mut graphs = vec![HeteroGraph::new(); self.num_graphs];

        for node_type in self.graph.node_types() {
            let store = self.graph.try_node_store(node_type)?;
            let ptr = &self.node_ptr[node_type];
            for (b, g) in graphs.iter_mut().enumerate() {
                let out = g.add_node_store(node_type.clone(), ptr[b + 1] - ptr[b]);
                for (attr, t) in store.attrs() {
                    let rows = self
                        .attr_ptr
                        .get(&(node_type.clone(), attr.to_string()))
                        .ok_or_else(|| Error::MissingAttr {
                            store: node_type.to_string(),
                            attr: attr.to_string(),
                        })?;
                    out.set(attr, t.narrow(0, rows[b], rows[b + 1] - rows[b])?);
                }
            }
        }

        for edge_type in self.graph.edge_types() {
            let e = self.graph.edge_index(edge_type)?;
            let ptr = &self.edge_ptr[edge_type];
            let src_ptr = &self.node_ptr[&edge_type.src_type];
            let dst_ptr = &self.node_ptr[&edge_type.dst_type];
            for (b, g) in graphs.iter_mut().enumerate() {
                let part = e.narrow(1, ptr[b], ptr[b + 1] - ptr[b])?;
                let part = offset_edges(&part, -(src_ptr[b] as i64), -(dst_ptr[b] as i64))?;
                g.add_edges(edge_type.clone(), part)?;
            }
        }

        Ok(graphs)
    }
}

fn graph_device(g: &HeteroGraph) -> Device {
    g.node_types()
        .filter_map(|t| g.node_store(t))
        .flat_map(|s| s.attrs().map(|(_, t)| t.device().clone()))
        .next()
        .unwrap_or(Device::Cpu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hetero::edge_index_from_pairs;
    use candle_core::DType;
    use proptest::prelude::*;

    fn event(n_u: usize, offset: f32, device: &Device) -> HeteroGraph {
        let mut g = HeteroGraph::new();
        let u = NodeType::new("u");
        g.add_node_store(u.clone(), n_u);
        let x: Vec<f32> = (0..n_u * 2).map(|i| offset + i as f32).collect();
        g.set_attr(&u, "x", Tensor::from_vec(x, (n_u, 2), device).unwrap())
            .unwrap();
        g.add_node_store(NodeType::nexus(), 1);
        g.add_node_store(NodeType::event(), 1);
        let pairs: Vec<(u32, u32)> = (1..n_u as u32).map(|i| (i - 1, i)).collect();
        g.add_edges(EdgeType::plane("u"), edge_index_from_pairs(&pairs, device).unwrap())
            .unwrap();
        let links: Vec<(u32, u32)> = (0..n_u as u32).map(|i| (i, 0)).collect();
        g.add_edges(EdgeType::nexus("u"), edge_index_from_pairs(&links, device).unwrap())
            .unwrap();
        g
    }

    #[test]
    fn test_collate_offsets_edges() {
        let device = Device::Cpu;
        let batch =
            HeteroBatch::from_data_list(&[event(3, 0.0, &device), event(2, 100.0, &device)])
                .unwrap();

        assert_eq!(batch.num_graphs(), 2);
        assert_eq!(batch.num_nodes(&NodeType::new("u")), 5);

        let plane = batch.edge_index(&EdgeType::plane("u")).unwrap();
        assert_eq!(plane.to_vec2::<u32>().unwrap(), vec![vec![0, 1, 3], vec![1, 2, 4]]);

        let nexus = batch.edge_index(&EdgeType::nexus("u")).unwrap();
        assert_eq!(
            nexus.to_vec2::<u32>().unwrap(),
            vec![vec![0, 1, 2, 3, 4], vec![0, 0, 0, 1, 1]]
        );

        let membership = batch.batch_vector(&NodeType::new("u")).unwrap();
        assert_eq!(membership.to_vec1::<u32>().unwrap(), vec![0, 0, 0, 1, 1]);
    }

    #[test]
    fn test_unbatch_rejects_misaligned_output() {
        let device = Device::Cpu;
        let mut batch =
            HeteroBatch::from_data_list(&[event(3, 0.0, &device), event(2, 0.0, &device)])
                .unwrap();

        let mut outputs = TaskOutputs::new();
        outputs.entry("x_semantic".into()).or_default().insert(
            "u".into(),
            Tensor::zeros((4, 5), DType::F32, &device).unwrap(),
        );
        let err = batch.attach_outputs(&outputs).unwrap_err();
        assert!(matches!(err, Error::Unbatch { rows: 4, num_nodes: 5, num_graphs: 2, .. }));
    }

    #[test]
    fn test_canonical_order_is_stable() {
        let groups = canonical_order(&[1, 0, 1, 0, 0], 3).unwrap();
        assert_eq!(groups, vec![vec![1, 3, 4], vec![0, 2], vec![]]);
        assert!(canonical_order(&[0, 3], 2).is_err());
    }

    proptest! {
        #[test]
        fn prop_canonical_order_partitions(batch in proptest::collection::vec(0u32..4, 0..40)) {
            let groups = canonical_order(&batch, 4).unwrap();
            let mut seen: Vec<u32> = groups.iter().flatten().copied().collect();
            for (b, group) in groups.iter().enumerate() {
                prop_assert!(group.windows(2).all(|w| w[0] < w[1]));
                prop_assert!(group.iter().all(|&i| batch[i as usize] == b as u32));
            }
            seen.sort_unstable();
            prop_assert_eq!(seen, (0..batch.len() as u32).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_empty_data_list() {
        assert!(matches!(
            HeteroBatch::from_data_list(&[]),
            Err(Error::EmptyBatch)
        ));
    }
}
