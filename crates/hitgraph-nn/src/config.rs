//! Model configuration.
//!
//! A single [`ModelConfig`] is handed to every component at construction;
//! plane and class names are never looked up from anywhere else.
//!
//! ```rust
//! use hitgraph_nn::config::ModelConfig;
//!
//! let config = ModelConfig::default()
//!     .with_planes(["u", "v"])
//!     .with_num_iters(3)
//!     .with_event_head(true);
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// Network widths, plane and class sets, head switches, learning rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Raw per-hit input features (default: 4).
    pub in_features: usize,
    /// Per-class hidden width of plane nodes (default: 128).
    pub planar_features: usize,
    /// Per-class hidden width of nexus nodes (default: 32).
    pub nexus_features: usize,
    /// Width of the per-event interaction embedding (default: 32).
    pub interaction_features: usize,
    /// Hidden width of the edge-weight networks (default: 8).
    pub edge_features: usize,
    /// Readout plane names (default: u, v, y).
    pub planes: Vec<String>,
    /// Semantic class names; their count partitions every hidden tensor.
    pub semantic_classes: Vec<String>,
    /// Event class names.
    pub event_classes: Vec<String>,
    /// Refinement iterations (default: 5).
    pub num_iters: usize,
    pub semantic_head: bool,
    pub filter_head: bool,
    pub event_head: bool,
    pub vertex_head: bool,
    /// Recompute plane convolutions during backward instead of keeping
    /// their activations.
    pub checkpoint: bool,
    /// Peak learning rate of the one-cycle schedule (default: 0.001).
    pub lr: f64,
}

fn names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(Into::into).collect()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            in_features: 4,
            planar_features: 128,
            nexus_features: 32,
            interaction_features: 32,
            edge_features: 8,
            planes: names(["u", "v", "y"]),
            semantic_classes: names(["MIP", "HIP", "shower", "michel", "diffuse"]),
            event_classes: names(["numu", "nue", "nc"]),
            num_iters: 5,
            semantic_head: true,
            filter_head: true,
            event_head: false,
            vertex_head: false,
            checkpoint: false,
            lr: 0.001,
        }
    }
}

impl ModelConfig {
    pub fn with_in_features(mut self, n: usize) -> Self {
        self.in_features = n;
        self
    }

    pub fn with_planar_features(mut self, n: usize) -> Self {
        self.planar_features = n;
        self
    }

    pub fn with_nexus_features(mut self, n: usize) -> Self {
        self.nexus_features = n;
        self
    }

    pub fn with_interaction_features(mut self, n: usize) -> Self {
        self.interaction_features = n;
        self
    }

    pub fn with_edge_features(mut self, n: usize) -> Self {
        self.edge_features = n;
        self
    }

    pub fn with_planes<I, S>(mut self, planes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.planes = names(planes);
        self
    }

    pub fn with_semantic_classes<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.semantic_classes = names(classes);
        self
    }

    pub fn with_event_classes<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_classes = names(classes);
        self
    }

    pub fn with_num_iters(mut self, n: usize) -> Self {
        self.num_iters = n;
        self
    }

    pub fn with_semantic_head(mut self, on: bool) -> Self {
        self.semantic_head = on;
        self
    }

    pub fn with_filter_head(mut self, on: bool) -> Self {
        self.filter_head = on;
        self
    }

    pub fn with_event_head(mut self, on: bool) -> Self {
        self.event_head = on;
        self
    }

    pub fn with_vertex_head(mut self, on: bool) -> Self {
        self.vertex_head = on;
        self
    }

    pub fn with_checkpoint(mut self, on: bool) -> Self {
        self.checkpoint = on;
        self
    }

    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    /// Number of semantic classes, `C`.
    pub fn num_classes(&self) -> usize {
        self.semantic_classes.len()
    }

    /// Names of the enabled heads, in the order the model builds them.
    pub fn enabled_heads(&self) -> Vec<&'static str> {
        [
            (self.event_head, "event"),
            (self.semantic_head, "semantic"),
            (self.filter_head, "filter"),
            (self.vertex_head, "vertex"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }

    /// Reject configurations the model cannot be built from.
    pub fn validate(&self) -> Result<()> {
        if self.enabled_heads().is_empty() {
            return Err(Error::InvalidConfig(
                "at least one decoder head must be enabled".into(),
            ));
        }
        if self.num_iters == 0 {
            return Err(Error::InvalidConfig("num_iters must be at least 1".into()));
        }
        if self.planes.is_empty() {
            return Err(Error::InvalidConfig("no planes configured".into()));
        }
        if self.semantic_classes.is_empty() {
            return Err(Error::InvalidConfig("no semantic classes configured".into()));
        }
        if self.event_head && self.event_classes.is_empty() {
            return Err(Error::InvalidConfig(
                "event head enabled without event classes".into(),
            ));
        }
        let names = [
            ("plane", &self.planes),
            ("semantic class", &self.semantic_classes),
            ("event class", &self.event_classes),
        ];
        for (kind, list) in names {
            let mut seen = BTreeSet::new();
            if let Some(dup) = list.iter().find(|name| !seen.insert(*name)) {
                return Err(Error::InvalidConfig(format!("duplicate {kind} name {dup:?}")));
            }
        }
        let widths = [
            ("in_features", self.in_features),
            ("planar_features", self.planar_features),
            ("nexus_features", self.nexus_features),
            ("interaction_features", self.interaction_features),
            ("edge_features", self.edge_features),
        ];
        if let Some((name, _)) = widths.iter().find(|(_, w)| *w == 0) {
            return Err(Error::InvalidConfig(format!("{name} must be non-zero")));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(Error::InvalidConfig(format!("invalid learning rate {}", self.lr)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ModelConfig::default();
        config.validate().unwrap();
        assert_eq!(config.num_classes(), 5);
        assert_eq!(config.enabled_heads(), vec!["semantic", "filter"]);
    }

    #[test]
    fn test_rejections() {
        let no_heads = ModelConfig::default()
            .with_semantic_head(false)
            .with_filter_head(false);
        assert!(matches!(no_heads.validate(), Err(Error::InvalidConfig(_))));

        let no_iters = ModelConfig::default().with_num_iters(0);
        assert!(matches!(no_iters.validate(), Err(Error::InvalidConfig(_))));

        let no_classes = ModelConfig::default().with_semantic_classes(Vec::<String>::new());
        assert!(no_classes.validate().is_err());

        let event = ModelConfig::default()
            .with_event_head(true)
            .with_event_classes(Vec::<String>::new());
        assert!(event.validate().is_err());

        let zero_width = ModelConfig::default().with_edge_features(0);
        assert!(zero_width.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let planes = ModelConfig::default().with_planes(["u", "v", "u"]);
        let err = planes.validate().unwrap_err();
        assert!(matches!(&err, Error::InvalidConfig(msg) if msg.contains("\"u\"")));

        let semantic = ModelConfig::default().with_semantic_classes(["MIP", "HIP", "MIP"]);
        assert!(matches!(semantic.validate(), Err(Error::InvalidConfig(_))));

        let event = ModelConfig::default()
            .with_event_head(true)
            .with_event_classes(["numu", "numu"]);
        assert!(matches!(event.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_serde_defaults_fill_missing_fields() {
        let config: ModelConfig =
            serde_json::from_str(r#"{"planes": ["y"], "num_iters": 2}"#).unwrap();
        assert_eq!(config.planes, vec!["y".to_string()]);
        assert_eq!(config.num_iters, 2);
        assert_eq!(config.planar_features, 128);
        let round: ModelConfig =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(round, config);
    }
}
