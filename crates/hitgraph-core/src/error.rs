//! Error types for hitgraph-core.

use thiserror::Error;

/// Graph and batching error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// A node type was requested that the graph does not carry.
    #[error("missing node store: {0}")]
    MissingNodeStore(String),

    /// An edge type was requested that the graph does not carry.
    #[error("missing edge store: {0}")]
    MissingEdgeStore(String),

    /// A node store lacks a named attribute.
    #[error("missing attribute `{attr}` on node store `{store}`")]
    MissingAttr { store: String, attr: String },

    /// An attribute's leading size matches neither the store's node count
    /// nor the number of events in the batch.
    #[error(
        "don't know how to unbatch attribute `{attr}` on `{store}`: \
         {rows} rows, {num_nodes} nodes, {num_graphs} graphs"
    )]
    Unbatch {
        attr: String,
        store: String,
        rows: usize,
        num_nodes: usize,
        num_graphs: usize,
    },

    /// Edge index tensor is not shaped `(2, E)`.
    #[error("edge index for {0} must have shape (2, E)")]
    EdgeShape(String),

    /// Events in a data list disagree on their schema.
    #[error("inconsistent events: {0}")]
    Inconsistent(String),

    /// Collating zero events.
    #[error("cannot collate an empty data list")]
    EmptyBatch,
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
