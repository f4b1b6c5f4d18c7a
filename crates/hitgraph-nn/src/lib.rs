//! Hierarchical message passing over detector hits.
//!
//! `hitgraph-nn` builds the network on top of the event graphs from
//! `hitgraph-core`. Hits on each readout plane are encoded, then refined for
//! a fixed number of iterations by passing messages at three scales:
//!
//! ```text
//! plane hits --ascent--> space points (nexus) --pool--> interaction
//!      ^                                                     |
//!      +------------------------descent----------------------+
//! ```
//!
//! Every hidden tensor is class-partitioned: `C` blocks of features, one per
//! semantic class, kept separate by [`linear::ClassLinear`].
//!
//! # Modules
//!
//! - [`linear`]: class-grouped affine maps and block-wise concatenation
//! - [`encoder`]: raw hit features into the hidden representation
//! - [`conv`]: class-grouped message passing with softmax edge weights
//! - [`plane`], [`nexus`], [`interaction`]: the three scales
//! - [`recompute`]: trading backward compute for activation memory
//! - [`model`]: the refinement loop and the training surface
//! - [`decoder`]: semantic, filter, event and vertex heads
//! - [`loss`], [`metrics`], [`optim`]: objectives, accuracy and confusion
//!   tracking, one-cycle AdamW
//!
//! # Example
//!
//! ```rust,ignore
//! use hitgraph_nn::{HitGraph, ModelConfig};
//! use candle_nn::{VarBuilder, VarMap};
//!
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
//! let mut model = HitGraph::new(ModelConfig::default(), vb)?;
//! let mut opt = model.configure_optimizer(varmap.all_vars(), total_steps)?;
//!
//! let (loss, metrics) = model.step(&mut batch, "train", false)?;
//! let grads = model.backward(&loss, &varmap.all_vars())?;
//! opt.step(&grads)?;
//! ```

use candle_core::Tensor;
use std::collections::BTreeMap;

pub mod config;
pub mod conv;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod interaction;
pub mod linear;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod nexus;
pub mod optim;
pub mod plane;
pub mod recompute;

/// Per-plane tensors keyed by plane name.
pub type TensorMap = BTreeMap<String, Tensor>;

/// Named scalar metrics.
pub type Metrics = BTreeMap<String, f32>;

pub use config::ModelConfig;
pub use decoder::{Decoder, DecoderHead};
pub use error::{Error, Result};
pub use model::{ForwardInputs, HitGraph};
pub use optim::{OneCycleLr, ScheduledAdamW};
