use candle_core::{DType, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};
use hitgraph_core::{HeteroBatch, NodeType, TaskOutputs};
use std::collections::BTreeMap;

use super::{gather_attr, plane_state, Decoder, DecoderInput, HeadState};
use crate::config::ModelConfig;
use crate::error::Result;
use crate::loss::binary_cross_entropy;
use crate::metrics::binary_accuracy;
use crate::Metrics;

/// Binary filter target: 1 for hits with a semantic label, 0 for hits
/// labelled `-1`.
pub fn filter_target(y_semantic: &Tensor) -> Result<Tensor> {
    let labels = y_semantic.to_dtype(DType::I64)?.to_vec1::<i64>()?;
    let n = labels.len();
    let target: Vec<f32> = labels
        .into_iter()
        .map(|t| if t == -1 { 0.0 } else { 1.0 })
        .collect();
    Ok(Tensor::from_vec(target, n, y_semantic.device())?)
}

/// Per-hit signal/noise filter over the flattened plane state.
#[derive(Debug, Clone)]
pub struct FilterDecoder {
    state: HeadState,
    planes: Vec<String>,
    nets: BTreeMap<String, Linear>,
}

impl FilterDecoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let width = config.num_classes() * config.planar_features;
        let nets = config
            .planes
            .iter()
            .map(|p| Ok((p.clone(), linear(width, 1, vb.pp(p))?)))
            .collect::<Result<_>>()?;
        let classes = vec!["noise".to_string(), "signal".to_string()];
        Ok(Self {
            state: HeadState::new("filter", classes, None, true),
            planes: config.planes.clone(),
            nets,
        })
    }
}

impl Decoder for FilterDecoder {
    fn state(&self) -> &HeadState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut HeadState {
        &mut self.state
    }

    fn forward(&self, input: &DecoderInput<'_>) -> Result<TaskOutputs> {
        let probs = self
            .nets
            .iter()
            .map(|(p, net)| {
                let logits = net.forward(plane_state(input.m, p)?)?;
                let prob = candle_nn::ops::sigmoid(&logits)?.squeeze(1)?;
                Ok((p.clone(), prob))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(TaskOutputs::from([("x_filter".to_string(), probs)]))
    }

    fn arrange(&self, batch: &HeteroBatch) -> Result<(Tensor, Tensor)> {
        let x = gather_attr(batch, &self.planes, "x_filter")?;
        let y = self
            .planes
            .iter()
            .map(|p| filter_target(batch.attr(&NodeType::new(p.as_str()), "y_semantic")?))
            .collect::<Result<Vec<_>>>()?;
        Ok((x, Tensor::cat(&y, 0)?))
    }

    fn metrics(&self, x: &Tensor, y: &Tensor, stage: &str) -> Result<Metrics> {
        let mut metrics = Metrics::new();
        if x.elem_count() == 0 {
            return Ok(metrics);
        }
        let prob = x.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        let target = y.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        metrics.insert(
            format!("filter_accuracy/{stage}"),
            binary_accuracy(&prob, &target),
        );
        Ok(metrics)
    }

    fn loss_fn(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        binary_cross_entropy(x, y)
    }

    fn labels(&self, x: &Tensor, y: &Tensor) -> Result<(Vec<usize>, Vec<i64>)> {
        let pred = x
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|p| usize::from(p > 0.5))
            .collect();
        let target = y
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|t| i64::from(t > 0.5))
            .collect();
        Ok((pred, target))
    }
}
