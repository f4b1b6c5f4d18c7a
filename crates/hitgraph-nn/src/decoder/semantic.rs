use candle_core::Tensor;
use candle_nn::VarBuilder;
use hitgraph_core::{HeteroBatch, TaskOutputs};
use std::collections::BTreeMap;

use super::{accuracy_metrics, gather_attr, plane_state, Decoder, DecoderInput, HeadState};
use crate::config::ModelConfig;
use crate::error::Result;
use crate::linear::ClassLinear;
use crate::loss::RecallLoss;
use crate::Metrics;

/// Per-hit semantic classification.
///
/// Each class block of the plane state is reduced to a single score, so the
/// score for class `c` only ever sees block `c`.
#[derive(Debug, Clone)]
pub struct SemanticDecoder {
    state: HeadState,
    planes: Vec<String>,
    nets: BTreeMap<String, ClassLinear>,
    loss: RecallLoss,
}

impl SemanticDecoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let nets = config
            .planes
            .iter()
            .map(|p| {
                let net = ClassLinear::new(config.planar_features, 1, config.num_classes(), vb.pp(p))?;
                Ok((p.clone(), net))
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            state: HeadState::new("semantic", config.semantic_classes.clone(), Some(-1), true),
            planes: config.planes.clone(),
            nets,
            loss: RecallLoss::new(Some(-1)),
        })
    }
}

impl Decoder for SemanticDecoder {
    fn state(&self) -> &HeadState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut HeadState {
        &mut self.state
    }

    fn forward(&self, input: &DecoderInput<'_>) -> Result<TaskOutputs> {
        let scores = self
            .nets
            .iter()
            .map(|(p, net)| Ok((p.clone(), net.forward(plane_state(input.m, p)?)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(TaskOutputs::from([("x_semantic".to_string(), scores)]))
    }

    fn arrange(&self, batch: &HeteroBatch) -> Result<(Tensor, Tensor)> {
        let x = gather_attr(batch, &self.planes, "x_semantic")?;
        let y = gather_attr(batch, &self.planes, "y_semantic")?;
        Ok((x, y))
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
    use crate::metrics::ConfusionSink;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use hitgraph_core::{HeteroGraph, NodeType};
    use ndarray::Array2;

    #[derive(Default)]
    struct Recorder(Vec<(String, Array2<f64>)>);

    impl ConfusionSink for Recorder {
        fn record(&mut self, tag: &str, _classes: &[String], matrix: &Array2<f64>, _epoch: usize) {
            self.0.push((tag.to_string(), matrix.clone()));
        }
    }

    fn batch(scores: &[[f32; 3]], labels: &[i64], device: &Device) -> HeteroBatch {
        let u = NodeType::new("u");
        let mut g = HeteroGraph::new();
        g.add_node_store(u.clone(), labels.len());
        let flat: Vec<f32> = scores.iter().flatten().copied().collect();
        let x = Tensor::from_vec(flat, (scores.len(), 3), device).unwrap();
        g.set_attr(&u, "x_semantic", x).unwrap();
        g.set_attr(&u, "y_semantic", Tensor::new(labels, device).unwrap()).unwrap();
        HeteroBatch::from_data_list(&[g]).unwrap()
    }

    fn decoder(device: &Device) -> SemanticDecoder {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let config = ModelConfig::default()
            .with_planes(["u"])
            .with_planar_features(2)
            .with_semantic_classes(["a", "b", "c"]);
        SemanticDecoder::new(&config, vb).unwrap()
    }

    #[test]
    fn test_forward_shape() {
        let device = Device::Cpu;
        let dec = decoder(&device);
        let m = crate::TensorMap::from([(
            "u".to_string(),
            Tensor::randn(0f32, 1f32, (4, 6), &device).unwrap(),
        )]);
        let x_e = Tensor::zeros((1, 2), DType::F32, &device).unwrap();
        let batch = crate::TensorMap::new();
        let input = DecoderInput {
            m: &m,
            x_e: &x_e,
            batch: &batch,
            num_graphs: 1,
        };
        let out = dec.forward(&input).unwrap();
        assert_eq!(out["x_semantic"]["u"].dims(), &[4, 3]);
    }

    #[test]
    fn test_loss_metrics_and_confusion() {
        let device = Device::Cpu;
        let mut dec = decoder(&device);
        let b = batch(
            &[[2., 0., 0.], [0., 0., 1.], [0., 3., 0.], [0., 3., 0.]],
            &[0, 2, -1, 2],
            &device,
        );

        let (loss, metrics) = dec.loss(&b, "val", true).unwrap();
        assert!(loss.to_scalar::<f32>().unwrap().is_finite());
        assert_eq!(metrics["semantic_accuracy_class_val/a"], 100.0);
        assert_eq!(metrics["semantic_accuracy_class_val/b"], 0.0);
        assert_eq!(metrics["semantic_accuracy_class_val/c"], 50.0);
        assert_eq!(metrics["semantic_accuracy/val"], 50.0);
        assert!(metrics.contains_key("semantic_loss/val"));

        let mut sink = Recorder::default();
        dec.on_epoch_end(&mut sink, "val", 1).unwrap();
        let tags: Vec<&str> = sink.0.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(tags, vec!["semantic_recall/val", "semantic_precision/val"]);
        assert_eq!(sink.0[0].1[[2, 2]], 0.5);
        assert_eq!(sink.0[0].1[[2, 1]], 0.5);

        // The accumulator was reset by the flush.
        let cm = dec.state().confusion.as_ref().unwrap();
        assert_eq!(cm.counts().sum(), 0.0);
    }

    #[test]
    fn test_all_ignored_contributes_nothing() {
        let device = Device::Cpu;
        let mut dec = decoder(&device);
        let b = batch(&[[1., 0., 0.], [0., 1., 0.]], &[-1, -1], &device);
        let (loss, metrics) = dec.loss(&b, "train", false).unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics["semantic_loss/train"], 0.0);
    }
}
