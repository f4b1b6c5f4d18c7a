//! Intra-plane message passing.

use candle_nn::VarBuilder;
use std::collections::BTreeMap;

use crate::config::ModelConfig;
use crate::conv::{Aggregator, ClassConv, ConvDims};
use crate::error::{Error, Result};
use crate::recompute::Recompute;
use crate::TensorMap;

/// One class-grouped convolution per plane, summing over hit-to-hit edges.
#[derive(Debug, Clone)]
pub struct PlaneNet {
    nets: BTreeMap<String, ClassConv>,
}

impl PlaneNet {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let dims = ConvDims {
            src: config.planar_features,
            dst: config.planar_features,
            out: config.planar_features,
            edge: config.edge_features,
        };
        let nets = config
            .planes
            .iter()
            .map(|p| {
                let conv = ClassConv::new(dims, config.num_classes(), Aggregator::Sum, vb.pp(p))?;
                Ok((p.clone(), conv))
            })
            .collect::<Result<_>>()?;
        Ok(Self { nets })
    }

    /// Convolve every plane.
    ///
    /// With a tape the convolutions are recorded for recomputation instead
    /// of keeping their activations.
    pub fn forward(
        &self,
        x: &TensorMap,
        edge_index: &TensorMap,
        tape: Option<&Recompute>,
    ) -> Result<TensorMap> {
        self.nets
            .iter()
            .map(|(p, conv)| {
                let xp = x.get(p).ok_or_else(|| Error::MissingInput {
                    what: "plane state",
                    plane: p.clone(),
                })?;
                let e = edge_index.get(p).ok_or_else(|| Error::MissingInput {
                    what: "plane edges",
                    plane: p.clone(),
                })?;
                let out = match tape {
                    Some(tape) => tape.run(conv, xp, e)?,
                    None => conv.forward(xp, e)?,
                };
                Ok((p.clone(), out))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarMap;
    use hitgraph_core::edge_index_from_pairs;

    #[test]
    fn test_tape_records_one_segment_per_plane() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = ModelConfig::default()
            .with_planes(["u", "v"])
            .with_planar_features(4)
            .with_semantic_classes(["a", "b"]);
        let net = PlaneNet::new(&config, vb).unwrap();

        let mut x = TensorMap::new();
        let mut e = TensorMap::new();
        for (p, n) in [("u", 3), ("v", 2)] {
            x.insert(p.into(), Tensor::randn(0f32, 1f32, (n, 8), &device).unwrap());
            e.insert(p.into(), edge_index_from_pairs(&[(0, 1), (1, 0)], &device).unwrap());
        }

        let plain = net.forward(&x, &e, None).unwrap();
        let tape = Recompute::new();
        let taped = net.forward(&x, &e, Some(&tape)).unwrap();
        assert_eq!(tape.len(), 2);
        for p in ["u", "v"] {
            assert_eq!(
                plain[p].to_vec2::<f32>().unwrap(),
                taped[p].to_vec2::<f32>().unwrap()
            );
        }
    }
}
