//! The refinement loop and the training surface.
//!
//! [`HitGraph`] owns every component. A forward pass encodes the raw hits,
//! runs `num_iters` rounds of plane / nexus / interaction message passing and
//! hands the final state to the enabled heads. [`HitGraph::step`] wraps that
//! with output attachment, loss summation and metric bookkeeping.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var, D};
use candle_nn::{linear, Linear, Module, VarBuilder};
use hitgraph_core::{EdgeType, HeteroBatch, NodeType, TaskOutputs, NEXUS};
use std::collections::BTreeMap;

use crate::config::ModelConfig;
use crate::decoder::{
    Decoder, DecoderHead, DecoderInput, EventDecoder, FilterDecoder, SemanticDecoder, VertexDecoder,
};
use crate::encoder::Encoder;
use crate::error::{Error, Result};
use crate::interaction::InteractionNet;
use crate::metrics::ConfusionSink;
use crate::nexus::{NexusAscent, NexusDescent};
use crate::optim::{OneCycleLr, ScheduledAdamW};
use crate::plane::PlaneNet;
use crate::recompute::Recompute;
use crate::{Metrics, TensorMap};

/// Everything a forward pass reads, keyed by plane.
#[derive(Debug, Clone)]
pub struct ForwardInputs {
    /// Raw hit features per plane, `(N_p, in_features)`.
    pub x: TensorMap,
    /// `(p, plane, p)` edges per plane.
    pub edge_index_plane: TensorMap,
    /// `(p, nexus, sp)` edges per plane.
    pub edge_index_nexus: TensorMap,
    /// Space point features. Only the row count is read; space points start
    /// without state.
    pub nexus: Tensor,
    /// Event membership per store: every plane plus `sp`.
    pub batch: TensorMap,
    pub num_graphs: usize,
}

impl ForwardInputs {
    /// Gather the inputs for `planes` from a collated batch.
    pub fn from_batch(batch: &HeteroBatch, planes: &[String]) -> Result<Self> {
        let mut x = TensorMap::new();
        let mut edge_index_plane = TensorMap::new();
        let mut edge_index_nexus = TensorMap::new();
        let mut membership = TensorMap::new();
        for p in planes {
            let node_type = NodeType::new(p.as_str());
            x.insert(p.clone(), batch.attr(&node_type, "x")?.clone());
            edge_index_plane.insert(p.clone(), batch.edge_index(&EdgeType::plane(p))?.clone());
            edge_index_nexus.insert(p.clone(), batch.edge_index(&EdgeType::nexus(p))?.clone());
            membership.insert(p.clone(), batch.batch_vector(&node_type)?.clone());
        }

        let sp = NodeType::nexus();
        membership.insert(NEXUS.to_string(), batch.batch_vector(&sp)?.clone());
        let nexus = match batch.attr(&sp, "x") {
            Ok(t) => t.clone(),
            Err(_) => {
                let device = batch.batch_vector(&sp)?.device().clone();
                Tensor::zeros((batch.num_nodes(&sp), 0), DType::F32, &device)?
            }
        };

        Ok(Self {
            x,
            edge_index_plane,
            edge_index_nexus,
            nexus,
            batch: membership,
            num_graphs: batch.num_graphs(),
        })
    }

    fn nexus_batch(&self) -> Result<&Tensor> {
        self.batch.get(NEXUS).ok_or_else(|| Error::MissingInput {
            what: "batch",
            plane: NEXUS.to_string(),
        })
    }
}

/// Hierarchical message-passing network with its task heads.
#[derive(Debug)]
pub struct HitGraph {
    config: ModelConfig,
    encoder: Encoder,
    plane_ascent: PlaneNet,
    nexus_ascent: NexusAscent,
    interaction: InteractionNet,
    nexus_descent: NexusDescent,
    plane_descent: PlaneNet,
    mix: BTreeMap<String, (Linear, Linear)>,
    decoders: Vec<DecoderHead>,
    tape: Option<Recompute>,
}

impl HitGraph {
    pub fn new(config: ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let width = config.num_classes() * config.planar_features;
        let mix = config
            .planes
            .iter()
            .map(|p| {
                let vb = vb.pp("mix").pp(p);
                let hidden = linear(config.in_features + width, width, vb.pp("0"))?;
                let out = linear(width, width, vb.pp("2"))?;
                Ok((p.clone(), (hidden, out)))
            })
            .collect::<Result<_>>()?;

        let decoders = config
            .enabled_heads()
            .into_iter()
            .map(|name| {
                let vb = vb.pp("decoder").pp(name);
                Ok(match name {
                    "event" => DecoderHead::Event(EventDecoder::new(&config, vb)?),
                    "semantic" => DecoderHead::Semantic(SemanticDecoder::new(&config, vb)?),
                    "filter" => DecoderHead::Filter(FilterDecoder::new(&config, vb)?),
                    _ => DecoderHead::Vertex(VertexDecoder::new(&config, vb)?),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let model = Self {
            encoder: Encoder::new(&config, vb.pp("encoder"))?,
            plane_ascent: PlaneNet::new(&config, vb.pp("plane_net_up"))?,
            nexus_ascent: NexusAscent::new(&config, vb.pp("nexus_net_up"))?,
            interaction: InteractionNet::new(&config, vb.pp("interaction_net"))?,
            nexus_descent: NexusDescent::new(&config, vb.pp("nexus_net_down"))?,
            plane_descent: PlaneNet::new(&config, vb.pp("plane_net_down"))?,
            mix,
            decoders,
            tape: config.checkpoint.then(Recompute::new),
            config,
        };
        tracing::info!(
            planes = ?model.config.planes,
            heads = ?model.config.enabled_heads(),
            num_iters = model.config.num_iters,
            checkpoint = model.config.checkpoint,
            "built hitgraph model"
        );
        Ok(model)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn decoders(&self) -> &[DecoderHead] {
        &self.decoders
    }

    /// Run the refinement loop and every enabled head.
    ///
    /// With recomputation on, the plane convolutions are recorded until a
    /// [`backward`](Self::backward) consumes them or
    /// [`release_tape`](Self::release_tape) drops them.
    pub fn forward(&self, inputs: &ForwardInputs) -> Result<TaskOutputs> {
        self.forward_with(inputs, self.tape.as_ref())
    }

    fn forward_with(
        &self,
        inputs: &ForwardInputs,
        tape: Option<&Recompute>,
    ) -> Result<TaskOutputs> {
        let (m, x_e) = self.refine(inputs, tape)?;
        let input = DecoderInput {
            m: &m,
            x_e: &x_e,
            batch: &inputs.batch,
            num_graphs: inputs.num_graphs,
        };
        let mut outputs = TaskOutputs::new();
        for head in &self.decoders {
            for (attr, stores) in head.forward(&input)? {
                outputs.entry(attr).or_default().extend(stores);
            }
        }
        Ok(outputs)
    }

    /// Final plane state and interaction embedding.
    fn refine(
        &self,
        inputs: &ForwardInputs,
        tape: Option<&Recompute>,
    ) -> Result<(TensorMap, Tensor)> {
        let nexus_batch = inputs.nexus_batch()?;
        let nexus_members = nexus_batch.to_vec1::<u32>()?;
        let num_nexus = inputs.nexus.dim(0)?;
        if num_nexus != nexus_members.len() {
            return Err(Error::DimensionMismatch {
                expected: num_nexus,
                got: nexus_members.len(),
            });
        }

        let mut m = self.encoder.forward(&inputs.x)?;
        let mut x_e = None;
        for _ in 0..self.config.num_iters {
            let x_p = self.plane_ascent.forward(&m, &inputs.edge_index_plane, tape)?;
            let x_n = self
                .nexus_ascent
                .forward(&x_p, &inputs.edge_index_nexus, num_nexus)?;
            let e = self
                .interaction
                .forward(&x_n, &nexus_members, inputs.num_graphs)?;
            let x_d = self
                .nexus_descent
                .forward(&x_n, &e, nexus_batch, &x_p, &inputs.edge_index_nexus)?;
            let x_d = self
                .plane_descent
                .forward(&x_d, &inputs.edge_index_plane, tape)?;
            m = self.mix(&inputs.x, &x_d)?;
            x_e = Some(e);
        }
        let x_e = x_e.ok_or_else(|| Error::InvalidConfig("num_iters must be at least 1".into()))?;
        Ok((m, x_e))
    }

    /// Raw input re-injected alongside the descended state.
    fn mix(&self, x: &TensorMap, x_d: &TensorMap) -> Result<TensorMap> {
        self.mix
            .iter()
            .map(|(p, (hidden, out))| {
                let (raw, down) = match (x.get(p), x_d.get(p)) {
                    (Some(raw), Some(down)) => (raw, down),
                    _ => {
                        return Err(Error::MissingInput {
                            what: "x",
                            plane: p.clone(),
                        })
                    }
                };
                let h = Tensor::cat(&[raw, down], D::Minus1)?;
                let h = hidden.forward(&h)?.tanh()?;
                Ok((p.clone(), out.forward(&h)?.tanh()?))
            })
            .collect()
    }

    /// Forward and attach the outputs to `batch`. Nothing is recorded on
    /// the recompute tape.
    pub fn predict(&self, batch: &mut HeteroBatch) -> Result<()> {
        self.attach(batch, None)
    }

    fn attach(&self, batch: &mut HeteroBatch, tape: Option<&Recompute>) -> Result<()> {
        let inputs = ForwardInputs::from_batch(batch, &self.config.planes)?;
        let outputs = self.forward_with(&inputs, tape)?;
        batch.attach_outputs(&outputs)?;
        Ok(())
    }

    /// One training or evaluation step: forward, attach, per-head losses.
    ///
    /// Returns the summed loss and every head's metrics plus `loss/{stage}`.
    pub fn step(
        &mut self,
        batch: &mut HeteroBatch,
        stage: &str,
        confusion: bool,
    ) -> Result<(Tensor, Metrics)> {
        self.attach(batch, self.tape.as_ref())?;

        let mut metrics = Metrics::new();
        let mut total: Option<Tensor> = None;
        for head in &mut self.decoders {
            let (loss, head_metrics) = head.loss(batch, stage, confusion)?;
            for (key, value) in head_metrics {
                insert_metric(&mut metrics, key, value)?;
            }
            total = Some(match total {
                Some(t) => (t + loss)?,
                None => loss,
            });
        }
        let total = total.ok_or_else(|| Error::InvalidConfig("no decoder heads".into()))?;
        let value = total.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        insert_metric(&mut metrics, format!("loss/{stage}"), value)?;
        tracing::debug!(stage, loss = value, num_graphs = batch.num_graphs(), "step");
        Ok((total, metrics))
    }

    /// Gradients of `loss`, replaying recorded convolutions when
    /// recomputation is on.
    ///
    /// `loss` may sum the losses of several steps. Separate losses must be
    /// back-propagated in step order: segments recorded by a later step stay
    /// on the tape, those of an earlier step are dropped.
    pub fn backward(&self, loss: &Tensor, params: &[Var]) -> Result<GradStore> {
        match &self.tape {
            Some(tape) => tape.backward(loss, params),
            None => Ok(loss.backward()?),
        }
    }

    /// Drop every recorded segment, e.g. after steps whose losses are never
    /// back-propagated.
    pub fn release_tape(&self) {
        if let Some(tape) = &self.tape {
            tape.clear();
        }
    }

    /// Release the recompute tape and flush every head's confusion matrices
    /// into `sink`. Without a sink nothing is flushed and the accumulators
    /// keep counting.
    pub fn on_epoch_end(
        &mut self,
        sink: Option<&mut dyn ConfusionSink>,
        stage: &str,
        epoch: usize,
    ) -> Result<()> {
        self.release_tape();
        let Some(sink) = sink else {
            return Ok(());
        };
        for head in &mut self.decoders {
            head.on_epoch_end(&mut *sink, stage, epoch)?;
        }
        Ok(())
    }

    /// AdamW over `vars` on a one-cycle schedule peaking at the configured
    /// learning rate.
    pub fn configure_optimizer(&self, vars: Vec<Var>, total_steps: usize) -> Result<ScheduledAdamW> {
        ScheduledAdamW::new(vars, OneCycleLr::new(self.config.lr, total_steps)?)
    }
}

fn insert_metric(metrics: &mut Metrics, key: String, value: f32) -> Result<()> {
    if metrics.contains_key(&key) {
        return Err(Error::MetricCollision(key));
    }
    metrics.insert(key, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;
    use hitgraph_core::{edge_index_from_pairs, HeteroGraph};
    use ndarray::Array2;

    fn config() -> ModelConfig {
        ModelConfig::default()
            .with_planes(["u", "v"])
            .with_in_features(2)
            .with_planar_features(3)
            .with_nexus_features(2)
            .with_interaction_features(4)
            .with_edge_features(2)
            .with_semantic_classes(["a", "b"])
            .with_event_classes(["x", "y"])
            .with_num_iters(2)
            .with_event_head(true)
            .with_vertex_head(true)
    }

    fn event(device: &Device, hits: usize, label: i64) -> HeteroGraph {
        let mut g = HeteroGraph::new();
        for p in ["u", "v"] {
            let t = NodeType::new(p);
            g.add_node_store(t.clone(), hits);
            g.set_attr(&t, "x", Tensor::randn(0f32, 1f32, (hits, 2), device).unwrap())
                .unwrap();
            let y: Vec<i64> = (0..hits as i64).map(|i| i % 3 - 1).collect();
            g.set_attr(&t, "y_semantic", Tensor::new(y.as_slice(), device).unwrap())
                .unwrap();
            let chain: Vec<(u32, u32)> = (1..hits as u32).map(|i| (i - 1, i)).collect();
            g.add_edges(EdgeType::plane(p), edge_index_from_pairs(&chain, device).unwrap())
                .unwrap();
            let links: Vec<(u32, u32)> = (0..hits as u32).map(|i| (i, i % 2)).collect();
            g.add_edges(EdgeType::nexus(p), edge_index_from_pairs(&links, device).unwrap())
                .unwrap();
        }
        g.add_node_store(NodeType::nexus(), 2);
        let evt = NodeType::event();
        g.add_node_store(evt.clone(), 1);
        g.set_attr(&evt, "y", Tensor::new(&[label], device).unwrap()).unwrap();
        g.set_attr(&evt, "y_vtx", Tensor::new(&[[0.5f32, -0.5, 1.0]], device).unwrap())
            .unwrap();
        g
    }

    fn model(config: ModelConfig, device: &Device) -> (VarMap, HitGraph) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = HitGraph::new(config, vb).unwrap();
        (varmap, model)
    }

    #[derive(Default)]
    struct Tags(Vec<String>);

    impl ConfusionSink for Tags {
        fn record(&mut self, tag: &str, _classes: &[String], _matrix: &Array2<f64>, _epoch: usize) {
            self.0.push(tag.to_string());
        }
    }

    #[test]
    fn test_head_order() {
        let device = Device::Cpu;
        let (_varmap, model) = model(config(), &device);
        let names: Vec<&str> = model.decoders().iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["event", "semantic", "filter", "vertex"]);
    }

    #[test]
    fn test_forward_output_shapes() {
        let device = Device::Cpu;
        let (_varmap, model) = model(config(), &device);
        let batch = HeteroBatch::from_data_list(&[event(&device, 4, 0), event(&device, 3, 1)]).unwrap();
        let inputs = ForwardInputs::from_batch(&batch, &model.config().planes).unwrap();
        let out = model.forward(&inputs).unwrap();

        assert_eq!(out["x_semantic"]["u"].dims(), &[7, 2]);
        assert_eq!(out["x_filter"]["v"].dims(), &[7]);
        assert_eq!(out["x"]["evt"].dims(), &[2, 2]);
        assert_eq!(out["x_vtx"]["evt"].dims(), &[2, 3]);
    }

    #[test]
    fn test_step_metrics_and_epoch_flush() {
        let device = Device::Cpu;
        let (varmap, mut model) = model(config(), &device);
        let mut batch = HeteroBatch::from_data_list(&[event(&device, 4, 0), event(&device, 3, -1)]).unwrap();

        let (loss, metrics) = model.step(&mut batch, "train", true).unwrap();
        let total = loss.to_scalar::<f32>().unwrap();
        assert!(total.is_finite());
        assert_eq!(metrics["loss/train"], total);
        for key in ["semantic_loss/train", "filter_loss/train", "event_loss/train", "vertex_loss/train"] {
            assert!(metrics.contains_key(key), "missing {key}");
        }

        let grads = model.backward(&loss, &varmap.all_vars()).unwrap();
        assert!(varmap.all_vars().iter().any(|v| grads.get(v.as_tensor()).is_some()));

        // No sink: nothing flushed.
        model.on_epoch_end(None, "train", 0).unwrap();
        let mut sink = Tags::default();
        model.on_epoch_end(Some(&mut sink), "train", 0).unwrap();
        assert_eq!(
            sink.0,
            vec![
                "event_recall/train",
                "event_precision/train",
                "semantic_recall/train",
                "semantic_precision/train",
                "filter_recall/train",
                "filter_precision/train",
            ]
        );
    }

    #[test]
    fn test_rejects_invalid_config() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        assert!(HitGraph::new(config().with_num_iters(0), vb).is_err());
    }

    #[test]
    fn test_configure_optimizer_starts_warm_up() {
        let device = Device::Cpu;
        let (varmap, model) = model(config().with_lr(0.01), &device);
        let opt = model.configure_optimizer(varmap.all_vars(), 100).unwrap();
        assert!((opt.learning_rate() - 0.01 / 25.0).abs() < 1e-12);
    }
}
