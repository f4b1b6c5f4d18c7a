//! Message passing between plane hits and 3D space points.
//!
//! Ascent and descent are separate types with their own parameters; they
//! share only the edge lists, `(p, nexus, sp)`, which descent walks in
//! reverse.

use candle_core::{Tensor, D};
use candle_nn::VarBuilder;
use std::collections::BTreeMap;

use crate::config::ModelConfig;
use crate::conv::{reverse_edges, Aggregator, ClassConv, ConvDims};
use crate::error::{Error, Result};
use crate::linear::{cat_classes, repeat_classes, ClassLinear};
use crate::TensorMap;

fn plane_input<'a>(map: &'a TensorMap, plane: &str, what: &'static str) -> Result<&'a Tensor> {
    map.get(plane).ok_or_else(|| Error::MissingInput {
        what,
        plane: plane.to_string(),
    })
}

/// Plane to space point. Space points start without state, so each plane
/// produces its own view of them, `(N_sp, C * nexus_features)`.
#[derive(Debug, Clone)]
pub struct NexusAscent {
    nets: BTreeMap<String, ClassConv>,
}

impl NexusAscent {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let dims = ConvDims {
            src: config.planar_features,
            dst: 0,
            out: config.nexus_features,
            edge: config.edge_features,
        };
        let nets = config
            .planes
            .iter()
            .map(|p| {
                let conv = ClassConv::new(dims, config.num_classes(), Aggregator::Mean, vb.pp(p))?;
                Ok((p.clone(), conv))
            })
            .collect::<Result<_>>()?;
        Ok(Self { nets })
    }

    /// # Arguments
    /// - `x_p`: plane states
    /// - `edge_index_nexus`: `(p, nexus, sp)` edges per plane
    /// - `num_nexus`: number of space points in the batch
    pub fn forward(
        &self,
        x_p: &TensorMap,
        edge_index_nexus: &TensorMap,
        num_nexus: usize,
    ) -> Result<TensorMap> {
        self.nets
            .iter()
            .map(|(p, conv)| {
                let x = plane_input(x_p, p, "plane state")?;
                let e = plane_input(edge_index_nexus, p, "nexus edges")?;
                Ok((p.clone(), conv.forward_bipartite(x, None, num_nexus, e)?))
            })
            .collect()
    }
}

/// Space point back to plane, after fusing each space point with the
/// interaction embedding of its event.
#[derive(Debug, Clone)]
pub struct NexusDescent {
    fuse: BTreeMap<String, ClassLinear>,
    nets: BTreeMap<String, ClassConv>,
    num_classes: usize,
}

impl NexusDescent {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let num_classes = config.num_classes();
        let dims = ConvDims {
            src: config.interaction_features,
            dst: config.planar_features,
            out: config.planar_features,
            edge: config.edge_features,
        };
        let mut fuse = BTreeMap::new();
        let mut nets = BTreeMap::new();
        for p in &config.planes {
            let vb = vb.pp(p);
            fuse.insert(
                p.clone(),
                ClassLinear::new(
                    config.nexus_features + config.interaction_features,
                    config.interaction_features,
                    num_classes,
                    vb.pp("fuse"),
                )?,
            );
            nets.insert(
                p.clone(),
                ClassConv::new(dims, num_classes, Aggregator::Mean, vb.pp("conv"))?,
            );
        }
        Ok(Self {
            fuse,
            nets,
            num_classes,
        })
    }

    /// # Arguments
    /// - `x_n`: per-plane space point views from ascent
    /// - `x_e`: interaction embeddings `(B, interaction_features)`
    /// - `nexus_batch`: event of every space point, `(N_sp,)` u32
    /// - `x_p`: plane states the update is applied to
    /// - `edge_index_nexus`: `(p, nexus, sp)` edges per plane
    pub fn forward(
        &self,
        x_n: &TensorMap,
        x_e: &Tensor,
        nexus_batch: &Tensor,
        x_p: &TensorMap,
        edge_index_nexus: &TensorMap,
    ) -> Result<TensorMap> {
        let num_nexus = nexus_batch.dim(0)?;
        let context = if num_nexus == 0 {
            Tensor::zeros((0, x_e.dim(D::Minus1)?), x_e.dtype(), x_e.device())?
        } else {
            x_e.index_select(nexus_batch, 0)?
        };
        let context = repeat_classes(&context, self.num_classes)?;

        self.nets
            .iter()
            .map(|(p, conv)| {
                let xn = plane_input(x_n, p, "nexus state")?;
                let xp = plane_input(x_p, p, "plane state")?;
                let e = reverse_edges(plane_input(edge_index_nexus, p, "nexus edges")?)?;
                let fused = cat_classes(&[xn, &context], self.num_classes)?;
                let fused = self.fuse[p].forward(&fused)?.tanh()?;
                let out = conv.forward_bipartite(&fused, Some(xp), xp.dim(0)?, &e)?;
                Ok((p.clone(), out))
            })
            .collect()
    }
}
