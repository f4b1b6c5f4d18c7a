//! Order-sensitive pooling of nodes into one embedding per event.
//!
//! [`LstmPool`] feeds the nodes of each event through an LSTM and keeps the
//! hidden state after the event's last node. The result depends on visiting
//! order, which is fixed to ascending node index within each event
//! (see [`hitgraph_core::canonical_order`]).

use candle_core::{Tensor, D};
use candle_nn::rnn::{lstm, LSTMConfig, LSTM, RNN};
use candle_nn::{linear, Linear, Module, VarBuilder};
use std::collections::BTreeMap;

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::TensorMap;
use hitgraph_core::canonical_order;

/// LSTM aggregation over the nodes of each event.
#[derive(Debug, Clone)]
pub struct LstmPool {
    lstm: LSTM,
    in_features: usize,
    out_features: usize,
}

impl LstmPool {
    pub fn new(in_features: usize, out_features: usize, vb: VarBuilder) -> Result<Self> {
        let lstm = lstm(in_features, out_features, LSTMConfig::default(), vb)?;
        Ok(Self {
            lstm,
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Pool `x` `(N, in_features)` into `(num_graphs, out_features)`.
    ///
    /// All events are stepped together; shorter events are padded and their
    /// state is read at their own last node. An event without nodes pools
    /// to zeros.
    pub fn forward(&self, x: &Tensor, batch: &[u32], num_graphs: usize) -> Result<Tensor> {
        let n = x.dim(0)?;
        if batch.len() != n {
            return Err(Error::DimensionMismatch {
                expected: n,
                got: batch.len(),
            });
        }
        let groups = canonical_order(batch, num_graphs)?;
        let steps = groups.iter().map(Vec::len).max().unwrap_or(0);
        let device = x.device();
        if steps == 0 {
            return Ok(Tensor::zeros(
                (num_graphs, self.out_features),
                x.dtype(),
                device,
            )?);
        }

        // Row `n` is the padding input.
        let pad = Tensor::zeros((1, self.in_features), x.dtype(), device)?;
        let x = Tensor::cat(&[x, &pad], 0)?;

        let mut state = self.lstm.zero_state(num_graphs)?;
        let mut hidden = Vec::with_capacity(steps);
        for t in 0..steps {
            let idx: Vec<u32> = groups
                .iter()
                .map(|g| g.get(t).copied().unwrap_or(n as u32))
                .collect();
            let idx = Tensor::from_vec(idx, num_graphs, device)?;
            state = self.lstm.step(&x.index_select(&idx, 0)?, &state)?;
            hidden.push(state.h().clone());
        }

        // Rows are (step, event) flattened; the final row is the zero state.
        let zero = Tensor::zeros((1, self.out_features), x.dtype(), device)?;
        hidden.push(zero);
        let hidden = Tensor::cat(&hidden, 0)?;
        let last: Vec<u32> = groups
            .iter()
            .enumerate()
            .map(|(b, g)| match g.len() {
                0 => (steps * num_graphs) as u32,
                len => ((len - 1) * num_graphs + b) as u32,
            })
            .collect();
        let last = Tensor::from_vec(last, num_graphs, device)?;
        Ok(hidden.index_select(&last, 0)?)
    }
}

/// Pools every plane's view of the space points and reduces the
/// concatenation to one interaction embedding per event.
#[derive(Debug, Clone)]
pub struct InteractionNet {
    pools: BTreeMap<String, LstmPool>,
    net: Linear,
}

impl InteractionNet {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let in_features = config.num_classes() * config.nexus_features;
        let pools = config
            .planes
            .iter()
            .map(|p| {
                let pool = LstmPool::new(
                    in_features,
                    config.interaction_features,
                    vb.pp("pool").pp(p),
                )?;
                Ok((p.clone(), pool))
            })
            .collect::<Result<_>>()?;
        let net = linear(
            config.planes.len() * config.interaction_features,
            config.interaction_features,
            vb.pp("net"),
        )?;
        Ok(Self { pools, net })
    }

    /// # Arguments
    /// - `x_n`: per-plane space point views, `(N_sp, C * nexus_features)`
    /// - `nexus_batch`: event of every space point
    /// - `num_graphs`: events in the batch
    ///
    /// # Returns
    /// - `(num_graphs, interaction_features)`
    pub fn forward(&self, x_n: &TensorMap, nexus_batch: &[u32], num_graphs: usize) -> Result<Tensor> {
        let pooled = self
            .pools
            .iter()
            .map(|(p, pool)| {
                let x = x_n.get(p).ok_or_else(|| Error::MissingInput {
                    what: "nexus state",
                    plane: p.clone(),
                })?;
                pool.forward(x, nexus_batch, num_graphs)
            })
            .collect::<Result<Vec<_>>>()?;
        let joined = Tensor::cat(&pooled, D::Minus1)?;
        Ok(self.net.forward(&joined)?.tanh()?)
    }
}
