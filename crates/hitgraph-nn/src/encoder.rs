//! Per-plane input encoder.

use candle_nn::VarBuilder;
use std::collections::BTreeMap;

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::linear::{repeat_classes, ClassLinear};
use crate::TensorMap;

/// Projects raw hit features into the class-partitioned hidden width.
///
/// The raw `(N, in_features)` tensor is replicated once per class and each
/// copy gets its own projection, giving `(N, C * planar_features)`.
#[derive(Debug, Clone)]
pub struct Encoder {
    nets: BTreeMap<String, ClassLinear>,
    num_classes: usize,
}

impl Encoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let num_classes = config.num_classes();
        let nets = config
            .planes
            .iter()
            .map(|p| {
                let net = ClassLinear::new(
                    config.in_features,
                    config.planar_features,
                    num_classes,
                    vb.pp(p),
                )?;
                Ok((p.clone(), net))
            })
            .collect::<Result<_>>()?;
        Ok(Self { nets, num_classes })
    }

    /// Encode every plane.
    pub fn forward(&self, x: &TensorMap) -> Result<TensorMap> {
        self.nets
            .iter()
            .map(|(p, net)| {
                let xp = x.get(p).ok_or_else(|| Error::MissingInput {
                    what: "x",
                    plane: p.clone(),
                })?;
                let h = net.forward(&repeat_classes(xp, self.num_classes)?)?.tanh()?;
                Ok((p.clone(), h))
            })
            .collect()
    }
}
