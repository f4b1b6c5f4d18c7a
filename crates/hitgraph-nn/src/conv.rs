//! Class-grouped message passing.
//!
//! One layer implements the message-passing paradigm with a learned,
//! per-class edge weight:
//!
//! 1. **Edge weight**: `softmax_c(edge_net(stop_grad([x_i, x_j])))`, one scalar
//!    per class per edge, normalised across classes
//! 2. **Message**: the weight scales class block `c` of the source state `x_j`
//! 3. **Aggregate**: sum or mean over incoming edges
//! 4. **Update**: `node_net([x_i, aggr])`
//!
//! ```text
//! h_i' = node_net( h_i || AGG_{j -> i}( w_ij (.) h_j ) )
//! ```
//!
//! The edge network only sees a detached copy of the endpoint states: it
//! learns its own weights, but is never a gradient path into the node
//! history. Messages themselves are not detached.
//!
//! Sources and targets may be different node types (plane hits and space
//! points). A target type without state of its own passes `None` and the
//! concatenations drop its block.

use candle_core::{DType, Tensor, D};
use candle_nn::VarBuilder;

use crate::error::{Error, Result};
use crate::linear::{cat_classes, ClassLinear};

/// Aggregation over incoming messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregator {
    /// Sum of incoming messages (plane convolutions).
    Sum,
    /// Mean of incoming messages; nodes without edges get zero (nexus).
    Mean,
}

/// Widths of one [`ClassConv`]; all per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvDims {
    /// Source node features.
    pub src: usize,
    /// Target node features, 0 if targets carry no state.
    pub dst: usize,
    /// Updated target features.
    pub out: usize,
    /// Hidden width of the edge network.
    pub edge: usize,
}

/// Class-grouped message-passing layer.
#[derive(Debug, Clone)]
pub struct ClassConv {
    edge_hidden: ClassLinear,
    edge_out: ClassLinear,
    node_hidden: ClassLinear,
    node_out: ClassLinear,
    dims: ConvDims,
    num_classes: usize,
    aggr: Aggregator,
}

impl ClassConv {
    /// Create a new layer.
    ///
    /// # Arguments
    /// - `dims`: per-class widths
    /// - `num_classes`: class count `C` partitioning every input
    /// - `aggr`: aggregation over incoming edges
    /// - `vb`: variable builder
    pub fn new(dims: ConvDims, num_classes: usize, aggr: Aggregator, vb: VarBuilder) -> Result<Self> {
        let both = dims.src + dims.dst;
        Ok(Self {
            edge_hidden: ClassLinear::new(both, dims.edge, num_classes, vb.pp("edge_net.0"))?,
            edge_out: ClassLinear::new(dims.edge, 1, num_classes, vb.pp("edge_net.2"))?,
            node_hidden: ClassLinear::new(both, dims.out, num_classes, vb.pp("node_net.0"))?,
            node_out: ClassLinear::new(dims.out, dims.out, num_classes, vb.pp("node_net.2"))?,
            dims,
            num_classes,
            aggr,
        })
    }

    pub fn dims(&self) -> ConvDims {
        self.dims
    }

    /// Same-type convolution: sources and targets are the rows of `x`.
    pub fn forward(&self, x: &Tensor, edge_index: &Tensor) -> Result<Tensor> {
        self.forward_bipartite(x, Some(x), x.dim(0)?, edge_index)
    }

    /// Full layer between two node types.
    ///
    /// # Arguments
    /// - `x_src`: `(N_src, C * src)`
    /// - `x_dst`: `(N_dst, C * dst)`, or `None` for stateless targets
    /// - `num_dst`: `N_dst`
    /// - `edge_index`: `(2, E)` u32, row 0 source, row 1 target
    ///
    /// # Returns
    /// - `(N_dst, C * out)`
    pub fn forward_bipartite(
        &self,
        x_src: &Tensor,
        x_dst: Option<&Tensor>,
        num_dst: usize,
        edge_index: &Tensor,
    ) -> Result<Tensor> {
        let aggr = self.aggregate(x_src, x_dst, num_dst, edge_index)?;
        self.update(x_dst, &aggr)
    }

    /// Per-class edge weights `(E, C)`, rows summing to one.
    pub fn edge_weights(
        &self,
        x_src: &Tensor,
        x_dst: Option<&Tensor>,
        edge_index: &Tensor,
    ) -> Result<Tensor> {
        let src = edge_index.get(0)?;
        let x_j = x_src.index_select(&src, 0)?;
        let input = match x_dst {
            Some(x_dst) => {
                let x_i = x_dst.index_select(&edge_index.get(1)?, 0)?;
                cat_classes(&[&x_i, &x_j], self.num_classes)?
            }
            None => x_j,
        };
        let h = self.edge_hidden.forward(&input.detach())?.tanh()?;
        let logits = self.edge_out.forward(&h)?;
        Ok(candle_nn::ops::softmax(&logits, D::Minus1)?)
    }

    /// Weighted messages aggregated per target node, `(N_dst, C * src)`.
    ///
    /// Zero edges give the zero tensor. A target index `>= num_dst` is an
    /// [`Error::EdgeOutOfRange`].
    pub fn aggregate(
        &self,
        x_src: &Tensor,
        x_dst: Option<&Tensor>,
        num_dst: usize,
        edge_index: &Tensor,
    ) -> Result<Tensor> {
        let c = self.num_classes;
        let width = c * self.dims.src;
        let zeros = Tensor::zeros((num_dst, width), x_src.dtype(), x_src.device())?;
        let num_edges = edge_index.dim(1)?;
        if num_edges == 0 || num_dst == 0 {
            return Ok(zeros);
        }

        let dst = edge_index.get(1)?;
        let targets = dst.to_vec1::<u32>()?;
        if let Some(&index) = targets.iter().find(|&&d| d as usize >= num_dst) {
            return Err(Error::EdgeOutOfRange {
                index: index as usize,
                num_nodes: num_dst,
            });
        }

        let weights = self.edge_weights(x_src, x_dst, edge_index)?;
        let x_j = x_src.index_select(&edge_index.get(0)?, 0)?;
        let messages = x_j
            .reshape((num_edges, c, self.dims.src))?
            .broadcast_mul(&weights.unsqueeze(2)?)?
            .reshape((num_edges, width))?;

        let summed = zeros.index_add(&dst, &messages, 0)?;
        match self.aggr {
            Aggregator::Sum => Ok(summed),
            Aggregator::Mean => {
                let mut counts = vec![0f32; num_dst];
                for d in targets {
                    counts[d as usize] += 1.0;
                }
                let counts: Vec<f32> = counts.into_iter().map(|n| n.max(1.0)).collect();
                let counts = Tensor::from_vec(counts, (num_dst, 1), x_src.device())?
                    .to_dtype(summed.dtype())?;
                Ok(summed.broadcast_div(&counts)?)
            }
        }
    }

    /// Node update from the target state and the aggregate.
    pub fn update(&self, x_dst: Option<&Tensor>, aggr: &Tensor) -> Result<Tensor> {
        let input = match x_dst {
            Some(x_dst) => cat_classes(&[x_dst, aggr], self.num_classes)?,
            None => aggr.clone(),
        };
        let h = self.node_hidden.forward(&input)?.tanh()?;
        Ok(self.node_out.forward(&h)?.tanh()?)
    }
}

/// Swap source and target rows of an edge index.
pub fn reverse_edges(edge_index: &Tensor) -> Result<Tensor> {
    if edge_index.dim(1)? == 0 {
        return Ok(Tensor::zeros((2, 0), DType::U32, edge_index.device())?);
    }
    Ok(Tensor::stack(&[edge_index.get(1)?, edge_index.get(0)?], 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};
    use candle_nn::VarMap;
    use hitgraph_core::edge_index_from_pairs;

    fn plane_conv(vb: VarBuilder) -> ClassConv {
        let dims = ConvDims {
            src: 4,
            dst: 4,
            out: 4,
            edge: 3,
        };
        ClassConv::new(dims, 2, Aggregator::Sum, vb).unwrap()
    }

    #[test]
    fn test_conv_forward_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let conv = plane_conv(VarBuilder::from_varmap(&varmap, DType::F32, &device));

        let x = Tensor::randn(0f32, 1f32, (5, 8), &device).unwrap();
        let e = edge_index_from_pairs(&[(0, 1), (1, 2), (2, 1), (4, 3)], &device).unwrap();
        assert_eq!(conv.forward(&x, &e).unwrap().dims(), &[5, 8]);

        let w = conv.edge_weights(&x, Some(&x), &e).unwrap();
        assert_eq!(w.dims(), &[4, 2]);
        for row in w.to_vec2::<f32>().unwrap() {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_zero_edges_update_is_node_local() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let conv = plane_conv(VarBuilder::from_varmap(&varmap, DType::F32, &device));

        let x = Tensor::randn(0f32, 1f32, (3, 8), &device).unwrap();
        let none = edge_index_from_pairs(&[], &device).unwrap();

        let aggr = conv.aggregate(&x, Some(&x), 3, &none).unwrap();
        assert!(aggr.flatten_all().unwrap().to_vec1::<f32>().unwrap().iter().all(|v| *v == 0.0));

        let all = conv.forward(&x, &none).unwrap();
        let first = conv.forward(&x.narrow(0, 0, 1).unwrap(), &none).unwrap();
        let a = all.narrow(0, 0, 1).unwrap().to_vec2::<f32>().unwrap();
        let b = first.to_vec2::<f32>().unwrap();
        for (u, v) in a[0].iter().zip(&b[0]) {
            assert!((u - v).abs() < 1e-6);
        }
    }

    #[test]
    fn test_mean_aggregation_into_stateless_targets() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let dims = ConvDims {
            src: 2,
            dst: 0,
            out: 3,
            edge: 2,
        };
        let conv = ClassConv::new(dims, 1, Aggregator::Mean, vb).unwrap();

        // With one class the softmax weight is 1, so the mean is exact.
        let x = Tensor::new(&[[1f32, 1.], [3., 5.], [7., 7.]], &device).unwrap();
        let e = edge_index_from_pairs(&[(0, 0), (1, 0), (2, 1)], &device).unwrap();
        let aggr = conv.aggregate(&x, None, 3, &e).unwrap();
        assert_eq!(
            aggr.to_vec2::<f32>().unwrap(),
            vec![vec![2., 3.], vec![7., 7.], vec![0., 0.]]
        );
        assert_eq!(conv.forward_bipartite(&x, None, 3, &e).unwrap().dims(), &[3, 3]);
    }

    #[test]
    fn test_out_of_range_target_is_an_error() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let dims = ConvDims {
            src: 2,
            dst: 0,
            out: 2,
            edge: 2,
        };
        let conv = ClassConv::new(dims, 1, Aggregator::Mean, vb).unwrap();

        let x = Tensor::ones((3, 2), DType::F32, &device).unwrap();
        let e = edge_index_from_pairs(&[(0, 0), (1, 2)], &device).unwrap();
        let err = conv.aggregate(&x, None, 2, &e).unwrap_err();
        assert!(matches!(
            err,
            Error::EdgeOutOfRange {
                index: 2,
                num_nodes: 2
            }
        ));
        assert!(conv.forward_bipartite(&x, None, 2, &e).is_err());
    }

    #[test]
    fn test_edge_net_input_is_detached() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let conv = plane_conv(VarBuilder::from_varmap(&varmap, DType::F32, &device));

        let x = Var::from_tensor(&Tensor::randn(0f32, 1f32, (4, 8), &device).unwrap()).unwrap();
        let e = edge_index_from_pairs(&[(0, 1), (1, 2), (2, 3), (3, 0), (2, 0)], &device).unwrap();
        let grads = conv
            .forward(x.as_tensor(), &e)
            .unwrap()
            .sum_all()
            .unwrap()
            .backward()
            .unwrap();

        // Same layer with the edge weights held constant: the only paths
        // into x are the messages and the node update.
        let w = conv.edge_weights(x.as_tensor(), Some(x.as_tensor()), &e).unwrap().detach();
        let x_j = x.as_tensor().index_select(&e.get(0).unwrap(), 0).unwrap();
        let messages = x_j
            .reshape((5, 2, 4))
            .unwrap()
            .broadcast_mul(&w.unsqueeze(2).unwrap())
            .unwrap()
            .reshape((5, 8))
            .unwrap();
        let aggr = Tensor::zeros((4, 8), DType::F32, &device)
            .unwrap()
            .index_add(&e.get(1).unwrap(), &messages, 0)
            .unwrap();
        let reference = conv
            .update(Some(x.as_tensor()), &aggr)
            .unwrap()
            .sum_all()
            .unwrap()
            .backward()
            .unwrap();

        let a = grads.get(x.as_tensor()).unwrap();
        let b = reference.get(x.as_tensor()).unwrap();
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);

        // The edge network still learns.
        let vars = varmap.data().lock().unwrap();
        let edge_vars: Vec<&Var> = vars
            .iter()
            .filter(|(name, _)| name.starts_with("edge_net"))
            .map(|(_, v)| v)
            .collect();
        assert!(!edge_vars.is_empty());
        let learned = edge_vars.iter().any(|v| {
            grads
                .get(v.as_tensor())
                .map(|g| g.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap() > 0.0)
                .unwrap_or(false)
        });
        assert!(learned);
    }

    #[test]
    fn test_reverse_edges() {
        let device = Device::Cpu;
        let e = edge_index_from_pairs(&[(0, 5), (1, 6)], &device).unwrap();
        let r = reverse_edges(&e).unwrap();
        assert_eq!(r.to_vec2::<u32>().unwrap(), vec![vec![5, 6], vec![0, 1]]);
    }
}
