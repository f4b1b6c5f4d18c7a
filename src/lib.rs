//! `hitgraph` is the umbrella crate: event graphs from [`core`] and the
//! network, heads and training surface from [`nn`].
//!
//! Design goal: one import for callers that train or run the model, while
//! the two halves stay usable on their own (data preparation only needs
//! `hitgraph-core`).
//!
//! ```rust,ignore
//! use hitgraph::prelude::*;
//!
//! let mut batch = HeteroBatch::from_data_list(&events)?;
//! let mut model = HitGraph::new(ModelConfig::default(), vb)?;
//! let (loss, metrics) = model.step(&mut batch, "train", true)?;
//! ```

pub use hitgraph_core as core;
pub use hitgraph_nn as nn;

/// The types most callers need.
pub mod prelude {
    pub use hitgraph_core::{
        canonical_order, edge_index_from_pairs, EdgeType, HeteroBatch, HeteroGraph, NodeType,
        TaskOutputs, EVENT, NEXUS,
    };
    pub use hitgraph_nn::metrics::{ConfusionSink, LogSink};
    pub use hitgraph_nn::{
        Decoder, DecoderHead, ForwardInputs, HitGraph, Metrics, ModelConfig, OneCycleLr,
        ScheduledAdamW, TensorMap,
    };
}
