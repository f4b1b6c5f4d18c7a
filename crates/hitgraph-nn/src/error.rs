//! Error types for hitgraph-nn.

use thiserror::Error;

/// Model error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Graph or batch error.
    #[error(transparent)]
    Graph(#[from] hitgraph_core::Error),

    /// Dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Feature width cannot be split into equal per-class blocks.
    #[error("feature width {width} is not divisible by {num_classes} classes")]
    ClassPartition { width: usize, num_classes: usize },

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Two decoder heads reported the same metric key.
    #[error("metric `{0}` reported twice")]
    MetricCollision(String),

    /// A class label outside `0..num_classes` that is not the ignore label.
    #[error("label {label} out of range for {num_classes} classes")]
    InvalidLabel { label: i64, num_classes: usize },

    /// An edge points past the last target node.
    #[error("edge target {index} out of range for {num_nodes} nodes")]
    EdgeOutOfRange { index: usize, num_nodes: usize },

    /// A forward input is missing for a plane.
    #[error("missing input `{what}` for plane `{plane}`")]
    MissingInput { what: &'static str, plane: String },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
