use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};
use hitgraph_core::{HeteroBatch, NodeType, TaskOutputs, EVENT};
use std::collections::BTreeMap;

use super::{Decoder, DecoderInput, EventPooling, HeadState};
use crate::config::ModelConfig;
use crate::error::Result;
use crate::loss::mse;
use crate::metrics::mean_distance;
use crate::Metrics;

/// Regresses the 3D interaction vertex of each event.
#[derive(Debug, Clone)]
pub struct VertexDecoder {
    state: HeadState,
    pooling: EventPooling,
    net: Linear,
}

impl VertexDecoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let pooling = EventPooling::new(config, vb.pp("pool"))?;
        let net = linear(pooling.out_features(config.interaction_features), 3, vb.pp("net"))?;
        Ok(Self {
            state: HeadState::new("vertex", Vec::new(), None, false),
            pooling,
            net,
        })
    }
}

impl Decoder for VertexDecoder {
    fn state(&self) -> &HeadState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut HeadState {
        &mut self.state
    }

    fn forward(&self, input: &DecoderInput<'_>) -> Result<TaskOutputs> {
        let x = self.net.forward(&self.pooling.forward(input)?)?;
        Ok(TaskOutputs::from([(
            "x_vtx".to_string(),
            BTreeMap::from([(EVENT.to_string(), x)]),
        )]))
    }

    fn arrange(&self, batch: &HeteroBatch) -> Result<(Tensor, Tensor)> {
        let evt = NodeType::event();
        Ok((batch.attr(&evt, "x_vtx")?.clone(), batch.attr(&evt, "y_vtx")?.clone()))
    }

    fn metrics(&self, x: &Tensor, y: &Tensor, stage: &str) -> Result<Metrics> {
        let y = y.to_dtype(x.dtype())?;
        Ok(Metrics::from([(
            format!("vertex_distance/{stage}"),
            mean_distance(x, &y)?,
        )]))
    }

    fn loss_fn(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        mse(x, &y.to_dtype(x.dtype())?)
    }
}
