//! Aggregation configuration files
//!
//! Selects a robust mean and its parameters from TOML or JSON:
//!
//! ```toml
//! mean = "soft_k_medoid"
//! n_chunks = 8
//!
//! [params]
//! k = 64
//! temperature = 0.5
//! execution = "sparse"
//! ```
//!
//! Omitted parameters take their defaults (see [`AggregationParams`]).

use crate::adjacency::Adjacency;
use crate::aggregation::{AggregationParams, RobustMean};
use crate::layers::RobustGcnConv;
use crate::{Result, RobustGnnError};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A robust mean together with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Which aggregation to run
    pub mean: RobustMean,

    /// Row chunks for layers built from this config (`None` = unchunked)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_chunks: Option<usize>,

    #[serde(default)]
    pub params: AggregationParams,
}

impl AggregationConfig {
    pub fn new(mean: RobustMean, params: AggregationParams) -> Self {
        Self {
            mean,
            n_chunks: None,
            params,
        }
    }

    /// Parse and validate TOML.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| {
            RobustGnnError::Config(format!("Failed to parse aggregation config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate JSON.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content).map_err(|e| {
            RobustGnnError::Config(format!("Failed to parse aggregation config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(RobustGnnError::Io)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("json") => Self::from_json_str(&content),
            other => Err(RobustGnnError::Config(format!(
                "unsupported config extension {:?} for {}",
                other,
                path.display()
            ))),
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| RobustGnnError::Serialization(e.to_string()))
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| RobustGnnError::Serialization(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.params.validate()?;
        if self.n_chunks == Some(0) {
            return Err(RobustGnnError::Config("n_chunks must be at least 1".into()));
        }
        Ok(())
    }

    /// Run the configured aggregation.
    pub fn aggregate(&self, adj: &Adjacency, x: &Tensor) -> Result<Tensor> {
        self.mean.aggregate(adj, x, &self.params)
    }

    /// A [`RobustGcnConv`] using this aggregation.
    pub fn build_layer(
        &self,
        in_dim: usize,
        out_dim: usize,
        device: &Device,
    ) -> Result<RobustGcnConv> {
        let layer = RobustGcnConv::new(in_dim, out_dim, self.mean, self.params.clone(), device)?;
        Ok(match self.n_chunks {
            Some(n_chunks) => layer.with_chunks(n_chunks),
            None => layer,
        })
    }
}
