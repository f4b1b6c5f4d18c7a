use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};
use hitgraph_core::{HeteroBatch, NodeType, TaskOutputs, EVENT};
use std::collections::BTreeMap;

use super::{accuracy_metrics, Decoder, DecoderInput, EventPooling, HeadState};
use crate::config::ModelConfig;
use crate::error::Result;
use crate::loss::RecallLoss;
use crate::Metrics;

/// Event-level classification from pooled plane states and the interaction
/// embedding.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    state: HeadState,
    pooling: EventPooling,
    net: Linear,
    loss: RecallLoss,
}

impl EventDecoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let pooling = EventPooling::new(config, vb.pp("pool"))?;
        let net = linear(
            pooling.out_features(config.interaction_features),
            config.event_classes.len(),
            vb.pp("net"),
        )?;
        Ok(Self {
            state: HeadState::new("event", config.event_classes.clone(), Some(-1), true),
            pooling,
            net,
            loss: RecallLoss::new(Some(-1)),
        })
    }
}

impl Decoder for EventDecoder {
    fn state(&self) -> &HeadState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut HeadState {
        &mut self.state
    }

    fn forward(&self, input: &DecoderInput<'_>) -> Result<TaskOutputs> {
        let x = self.net.forward(&self.pooling.forward(input)?)?;
        Ok(TaskOutputs::from([(
            "x".to_string(),
            BTreeMap::from([(EVENT.to_string(), x)]),
        )]))
    }

    fn arrange(&self, batch: &HeteroBatch) -> Result<(Tensor, Tensor)> {
        let evt = NodeType::event();
        Ok((batch.attr(&evt, "x")?.clone(), batch.attr(&evt, "y")?.clone()))
    }

    fn metrics(&self, x: &Tensor, y: &Tensor, stage: &str) -> Result<Metrics> {
        accuracy_metrics(&self.state, x, y, stage)
    }

    fn loss_fn(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        self.loss.forward(x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use hitgraph_core::HeteroGraph;

    fn config() -> ModelConfig {
        ModelConfig::default()
            .with_planes(["u", "v"])
            .with_planar_features(2)
            .with_interaction_features(3)
            .with_semantic_classes(["a", "b"])
            .with_event_classes(["numu", "nue", "nc"])
            .with_event_head(true)
    }

    #[test]
    fn test_event_forward_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let dec = EventDecoder::new(&config(), vb).unwrap();

        let m = crate::TensorMap::from([
            ("u".to_string(), Tensor::randn(0f32, 1f32, (3, 4), &device).unwrap()),
            ("v".to_string(), Tensor::randn(0f32, 1f32, (2, 4), &device).unwrap()),
        ]);
        let batch = crate::TensorMap::from([
            ("u".to_string(), Tensor::new(&[0u32, 1, 1], &device).unwrap()),
            ("v".to_string(), Tensor::new(&[1u32, 1], &device).unwrap()),
        ]);
        let x_e = Tensor::randn(0f32, 1f32, (2, 3), &device).unwrap();
        let input = DecoderInput {
            m: &m,
            x_e: &x_e,
            batch: &batch,
            num_graphs: 2,
        };
        let out = dec.forward(&input).unwrap();
        assert_eq!(out["x"][EVENT].dims(), &[2, 3]);
    }

    #[test]
    fn test_event_loss_reads_event_store() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut dec = EventDecoder::new(&config(), vb).unwrap();

        let evt = NodeType::event();
        let graphs: Vec<HeteroGraph> = [([3f32, 0., 0.], 0i64), ([0., 0., 3.], -1)]
            .into_iter()
            .map(|(score, label)| {
                let mut g = HeteroGraph::new();
                g.add_node_store(evt.clone(), 1);
                g.set_attr(&evt, "x", Tensor::new(&[score], &device).unwrap()).unwrap();
                g.set_attr(&evt, "y", Tensor::new(&[label], &device).unwrap()).unwrap();
                g
            })
            .collect();
        let batch = HeteroBatch::from_data_list(&graphs).unwrap();

        let (loss, metrics) = dec.loss(&batch, "train", true).unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);
        assert_eq!(metrics["event_accuracy_class_train/numu"], 100.0);
        let cm = dec.state().confusion.as_ref().unwrap();
        assert_eq!(cm.counts().sum(), 1.0);
    }
}
