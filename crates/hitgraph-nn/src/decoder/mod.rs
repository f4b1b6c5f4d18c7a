//! Task heads reading the refined representation.
//!
//! Every head implements [`Decoder`]: it produces raw outputs from the hidden
//! state, and once those outputs have been attached to the batch it pulls
//! aligned `(prediction, target)` pairs back out for its loss and metrics.
//! The shared pieces (metric key namespacing, confusion bookkeeping,
//! end-of-epoch flushing) are provided methods working on the head's
//! [`HeadState`].
//!
//! | Head | Output | Store | Loss |
//! |---|---|---|---|
//! | [`SemanticDecoder`] | `x_semantic (N, C)` | planes | [`RecallLoss`](crate::loss::RecallLoss) |
//! | [`FilterDecoder`] | `x_filter (N,)` | planes | binary cross entropy |
//! | [`EventDecoder`] | `x (B, K)` | `evt` | [`RecallLoss`](crate::loss::RecallLoss) |
//! | [`VertexDecoder`] | `x_vtx (B, 3)` | `evt` | MSE |

use candle_core::{DType, Tensor, D};
use candle_nn::VarBuilder;
use hitgraph_core::{HeteroBatch, NodeType, TaskOutputs};
use std::collections::BTreeMap;

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::interaction::LstmPool;
use crate::metrics::{argmax_rows, normalize, ConfusionMatrix, ConfusionSink, Normalize};
use crate::{Metrics, TensorMap};

mod event;
mod filter;
mod semantic;
mod vertex;

pub use event::EventDecoder;
pub use filter::{filter_target, FilterDecoder};
pub use semantic::SemanticDecoder;
pub use vertex::VertexDecoder;

/// What the heads read from the model.
#[derive(Debug, Clone, Copy)]
pub struct DecoderInput<'a> {
    /// Final per-plane hidden state, `(N_p, C * planar_features)`.
    pub m: &'a TensorMap,
    /// Final interaction embedding, `(B, interaction_features)`.
    pub x_e: &'a Tensor,
    /// Event membership of every plane node.
    pub batch: &'a TensorMap,
    pub num_graphs: usize,
}

/// State every head owns: identity, class names, ignore label and an
/// optional confusion accumulator.
#[derive(Debug, Clone)]
pub struct HeadState {
    pub name: String,
    pub classes: Vec<String>,
    pub ignore_index: Option<i64>,
    pub confusion: Option<ConfusionMatrix>,
}

impl HeadState {
    pub fn new(
        name: impl Into<String>,
        classes: Vec<String>,
        ignore_index: Option<i64>,
        confusion: bool,
    ) -> Self {
        let confusion = confusion.then(|| ConfusionMatrix::new(classes.len(), ignore_index));
        Self {
            name: name.into(),
            classes,
            ignore_index,
            confusion,
        }
    }
}

/// Concatenate one attribute over several stores, in the given order.
pub(crate) fn gather_attr(batch: &HeteroBatch, stores: &[String], attr: &str) -> Result<Tensor> {
    let parts = stores
        .iter()
        .map(|p| batch.attr(&NodeType::new(p.as_str()), attr).cloned())
        .collect::<hitgraph_core::Result<Vec<_>>>()?;
    Ok(Tensor::cat(&parts, 0)?)
}

/// Host copy of a batch-membership vector.
pub(crate) fn membership(batch: &TensorMap, plane: &str) -> Result<Vec<u32>> {
    let b = batch.get(plane).ok_or_else(|| Error::MissingInput {
        what: "batch",
        plane: plane.to_string(),
    })?;
    Ok(b.to_vec1::<u32>()?)
}

/// Hidden state of one plane.
pub(crate) fn plane_state<'a>(m: &'a TensorMap, plane: &str) -> Result<&'a Tensor> {
    m.get(plane).ok_or_else(|| Error::MissingInput {
        what: "plane state",
        plane: plane.to_string(),
    })
}

/// Event-level readout shared by the event and vertex heads: every plane is
/// pooled into one row per event and joined with the interaction embedding,
/// giving `(B, (P + 1) * interaction_features)`.
#[derive(Debug, Clone)]
pub(crate) struct EventPooling {
    pools: BTreeMap<String, LstmPool>,
}

impl EventPooling {
    pub(crate) fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let in_features = config.num_classes() * config.planar_features;
        let pools = config
            .planes
            .iter()
            .map(|p| {
                let pool = LstmPool::new(in_features, config.interaction_features, vb.pp(p))?;
                Ok((p.clone(), pool))
            })
            .collect::<Result<_>>()?;
        Ok(Self { pools })
    }

    pub(crate) fn out_features(&self, interaction_features: usize) -> usize {
        self.pools.values().map(LstmPool::out_features).sum::<usize>() + interaction_features
    }

    pub(crate) fn forward(&self, input: &DecoderInput<'_>) -> Result<Tensor> {
        let mut parts = self
            .pools
            .iter()
            .map(|(p, pool)| {
                let members = membership(input.batch, p)?;
                pool.forward(plane_state(input.m, p)?, &members, input.num_graphs)
            })
            .collect::<Result<Vec<_>>>()?;
        parts.push(input.x_e.clone());
        Ok(Tensor::cat(&parts, D::Minus1)?)
    }
}

/// Common contract of all task heads.
pub trait Decoder {
    fn state(&self) -> &HeadState;

    fn state_mut(&mut self) -> &mut HeadState;

    fn name(&self) -> &str {
        &self.state().name
    }

    /// Raw outputs keyed by output name, then store.
    fn forward(&self, input: &DecoderInput<'_>) -> Result<TaskOutputs>;

    /// Aligned `(prediction, target)` from a batch carrying this head's
    /// outputs.
    fn arrange(&self, batch: &HeteroBatch) -> Result<(Tensor, Tensor)>;

    /// Task metrics, keys namespaced by the head name.
    fn metrics(&self, x: &Tensor, y: &Tensor, stage: &str) -> Result<Metrics>;

    fn loss_fn(&self, x: &Tensor, y: &Tensor) -> Result<Tensor>;

    /// Hard `(predicted, true)` labels for the confusion matrix.
    fn labels(&self, x: &Tensor, y: &Tensor) -> Result<(Vec<usize>, Vec<i64>)> {
        let pred = argmax_rows(x)?;
        let target = y.to_dtype(DType::I64)?.to_vec1::<i64>()?;
        Ok((pred, target))
    }

    /// Loss and metrics for one batch; `{name}_loss/{stage}` is always
    /// reported. With `confusion` set, the head's accumulator is updated.
    fn loss(&mut self, batch: &HeteroBatch, stage: &str, confusion: bool) -> Result<(Tensor, Metrics)> {
        let (x, y) = self.arrange(batch)?;
        let mut metrics = self.metrics(&x, &y, stage)?;
        let loss = self.loss_fn(&x, &y)?;
        metrics.insert(
            format!("{}_loss/{stage}", self.name()),
            loss.to_dtype(DType::F32)?.to_scalar::<f32>()?,
        );
        if confusion && self.state().confusion.is_some() {
            let (pred, target) = self.labels(&x, &y)?;
            if let Some(cm) = self.state_mut().confusion.as_mut() {
                cm.update(&pred, &target)?;
            }
        }
        Ok((loss, metrics))
    }

    /// Hand the epoch's confusion matrices to `sink` and reset them.
    fn on_epoch_end(&mut self, sink: &mut dyn ConfusionSink, stage: &str, epoch: usize) -> Result<()> {
        let state = self.state_mut();
        if let Some(cm) = state.confusion.as_mut() {
            let counts = cm.read_and_reset();
            for (kind, how) in [("recall", Normalize::True), ("precision", Normalize::Pred)] {
                let tag = format!("{}_{kind}/{stage}", state.name);
                sink.record(&tag, &state.classes, &normalize(&counts, how), epoch);
            }
            tracing::debug!(head = %state.name, stage, epoch, "flushed confusion matrices");
        }
        Ok(())
    }
}

/// The enabled heads, dispatched by variant.
#[derive(Debug, Clone)]
pub enum DecoderHead {
    Semantic(SemanticDecoder),
    Filter(FilterDecoder),
    Event(EventDecoder),
    Vertex(VertexDecoder),
}

macro_rules! dispatch {
    ($self:expr, $head:ident => $body:expr) => {
        match $self {
            DecoderHead::Semantic($head) => $body,
            DecoderHead::Filter($head) => $body,
            DecoderHead::Event($head) => $body,
            DecoderHead::Vertex($head) => $body,
        }
    };
}

impl Decoder for DecoderHead {
    fn state(&self) -> &HeadState {
        dispatch!(self, d => d.state())
    }

    fn state_mut(&mut self) -> &mut HeadState {
        dispatch!(self, d => d.state_mut())
    }

    fn forward(&self, input: &DecoderInput<'_>) -> Result<TaskOutputs> {
        dispatch!(self, d => d.forward(input))
    }

    fn arrange(&self, batch: &HeteroBatch) -> Result<(Tensor, Tensor)> {
        dispatch!(self, d => d.arrange(batch))
    }

    fn metrics(&self, x: &Tensor, y: &Tensor, stage: &str) -> Result<Metrics> {
        dispatch!(self, d => d.metrics(x, y, stage))
    }

    fn loss_fn(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        dispatch!(self, d => d.loss_fn(x, y))
    }

    fn labels(&self, x: &Tensor, y: &Tensor) -> Result<(Vec<usize>, Vec<i64>)> {
        dispatch!(self, d => d.labels(x, y))
    }
}

/// Per-class accuracy metrics shared by the classification heads:
/// `{name}_accuracy/{stage}` and `{name}_accuracy_class_{stage}/{class}`.
///
/// Empty when no target is valid.
pub(crate) fn accuracy_metrics(state: &HeadState, x: &Tensor, y: &Tensor, stage: &str) -> Result<Metrics> {
    let target = y.to_dtype(DType::I64)?.to_vec1::<i64>()?;
    let mut metrics = Metrics::new();
    if target.iter().all(|&t| Some(t) == state.ignore_index) {
        return Ok(metrics);
    }
    let pred = argmax_rows(x)?;
    let acc =
        crate::metrics::class_accuracy(&pred, &target, state.classes.len(), state.ignore_index)?;
    let mean = acc.iter().sum::<f32>() / acc.len().max(1) as f32;
    metrics.insert(format!("{}_accuracy/{stage}", state.name), mean);
    for (class, a) in state.classes.iter().zip(&acc) {
        metrics.insert(format!("{}_accuracy_class_{stage}/{class}", state.name), *a);
    }
    Ok(metrics)
}
