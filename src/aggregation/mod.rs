//! Robust mean family
//!
//! Every variant maps `(A, X)` to new embeddings of shape `[m, d]` where row
//! `i` is
//!
//! ```text
//! out[i] = row_sum(A, i) · combine({ X[j] : A[i, j] > 0 })
//! ```
//!
//! and `combine` is a convex combination or a selection of neighbor rows.
//! Scaling by the row weight keeps each variant a drop-in replacement for the
//! weighted sum `A @ X` of a GCN layer; a row without weight yields zeros.
//!
//! | Variant | Module | Selection | Memory |
//! |---|---|---|---|
//! | [`RobustMean::Medoid`] | [`medoid`] | hard argmin | O(m·n) |
//! | [`RobustMean::KMedoid`] | [`medoid`] | hard argmin over top-k | O(m·k²) |
//! | [`RobustMean::SoftMedoid`] | [`medoid`] | softmax | O(m·n) |
//! | [`RobustMean::SoftKMedoid`] | [`soft_k_medoid`] | softmax over top-k | O(m·k²) |
//! | [`RobustMean::DimMedian`] | [`median`] | per-dimension weighted median | O(m·n·d) dense, O(nnz·d) sparse |
//! | [`RobustMean::SoftMedian`] | [`median`] | softmax of distance to the median | O(nnz·d) |
//!
//! Hard selections (argmin, median index) are computed on detached tensors;
//! gradients reach `X` through the selected rows and `A` through the row sums
//! (and, for the soft variants, through the softmax weights).

pub mod median;
pub mod medoid;
pub mod soft_k_medoid;

pub use median::{soft_median, weighted_dimwise_median};
pub use medoid::{soft_weighted_medoid, weighted_medoid, weighted_medoid_k_neighborhood};
pub use soft_k_medoid::soft_weighted_medoid_k_neighborhood;

use crate::adjacency::Adjacency;
use crate::primitives::TopKBackend;
use crate::{Result, RobustGnnError};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

// =============================================================================
// Parameters
// =============================================================================

/// Dense vs sparse implementation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPath {
    /// Dense on CPU below `threshold_for_dense_if_cpu` columns, sparse otherwise
    #[default]
    Auto,
    Dense,
    Sparse,
}

impl ExecutionPath {
    /// Resolve `Auto` for `n` candidate neighbors living on `device`.
    pub fn resolve(
        self,
        device: &Device,
        n: usize,
        threshold_for_dense_if_cpu: usize,
    ) -> ExecutionPath {
        match self {
            ExecutionPath::Auto if device.is_cpu() && n < threshold_for_dense_if_cpu => {
                ExecutionPath::Dense
            }
            ExecutionPath::Auto => ExecutionPath::Sparse,
            other => other,
        }
    }
}

/// Parameters shared by the robust means.
///
/// Variants ignore the fields they do not use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationParams {
    /// Neighborhood size for the top-k variants
    pub k: usize,

    /// Softmax temperature; smaller is closer to the hard variant
    pub temperature: f64,

    /// Re-weight soft k-medoid weights by the edge weights and renormalise
    pub with_weight_correction: bool,

    /// Below this many nodes, CPU inputs use the dense implementation
    pub threshold_for_dense_if_cpu: usize,

    /// Floor added to normalisation denominators
    pub eps: f64,

    /// Dense / sparse strategy
    pub execution: ExecutionPath,

    /// Top-k backend for the sparse paths
    pub top_k_backend: TopKBackend,

    /// Largest dense intermediate (in elements) the dense paths may allocate
    pub dense_element_budget: usize,
}

impl Default for AggregationParams {
    fn default() -> Self {
        Self {
            k: 32,
            temperature: 1.0,
            with_weight_correction: true,
            threshold_for_dense_if_cpu: 5_000,
            eps: 1e-10,
            execution: ExecutionPath::Auto,
            top_k_backend: TopKBackend::Auto,
            dense_element_budget: 1 << 28,
        }
    }
}

impl AggregationParams {
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(RobustGnnError::Config("k must be at least 1".into()));
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(RobustGnnError::Config(format!(
                "temperature must be positive and finite, got {}",
                self.temperature
            )));
        }
        if !(self.eps.is_finite() && self.eps >= 0.0) {
            return Err(RobustGnnError::Config(format!(
                "eps must be non-negative and finite, got {}",
                self.eps
            )));
        }
        Ok(())
    }

    pub(crate) fn path(&self, device: &Device, n: usize) -> ExecutionPath {
        let path = self
            .execution
            .resolve(device, n, self.threshold_for_dense_if_cpu);
        debug!(?path, n, "aggregation path");
        path
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// The six robust aggregations, selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RobustMean {
    #[serde(rename = "dimmedian")]
    DimMedian,
    #[serde(rename = "medoid")]
    Medoid,
    #[serde(rename = "k_medoid")]
    KMedoid,
    #[serde(rename = "soft_medoid")]
    SoftMedoid,
    #[serde(rename = "soft_k_medoid")]
    SoftKMedoid,
    #[serde(rename = "soft_median")]
    SoftMedian,
}

impl RobustMean {
    /// All variants in a stable order
    pub fn all() -> &'static [RobustMean] {
        &[
            RobustMean::DimMedian,
            RobustMean::Medoid,
            RobustMean::KMedoid,
            RobustMean::SoftMedoid,
            RobustMean::SoftKMedoid,
            RobustMean::SoftMedian,
        ]
    }

    /// Configuration name
    pub fn name(&self) -> &'static str {
        match self {
            RobustMean::DimMedian => "dimmedian",
            RobustMean::Medoid => "medoid",
            RobustMean::KMedoid => "k_medoid",
            RobustMean::SoftMedoid => "soft_medoid",
            RobustMean::SoftKMedoid => "soft_k_medoid",
            RobustMean::SoftMedian => "soft_median",
        }
    }

    /// Run the aggregation.
    pub fn aggregate(
        &self,
        adj: &Adjacency,
        x: &Tensor,
        params: &AggregationParams,
    ) -> Result<Tensor> {
        params.validate()?;
        match self {
            RobustMean::DimMedian => weighted_dimwise_median(adj, x, params),
            RobustMean::Medoid => weighted_medoid(adj, x, params),
            RobustMean::KMedoid => weighted_medoid_k_neighborhood(adj, x, params),
            RobustMean::SoftMedoid => soft_weighted_medoid(adj, x, params),
            RobustMean::SoftKMedoid => soft_weighted_medoid_k_neighborhood(adj, x, params),
            RobustMean::SoftMedian => soft_median(adj, x, params),
        }
    }
}

impl fmt::Display for RobustMean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RobustMean {
    type Err = RobustGnnError;

    fn from_str(s: &str) -> Result<Self> {
        RobustMean::all()
            .iter()
            .copied()
            .find(|m| m.name() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = RobustMean::all().iter().map(|m| m.name()).collect();
                RobustGnnError::Config(format!(
                    "unknown aggregation '{}', expected one of: {}",
                    s,
                    known.join(", ")
                ))
            })
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Validate shapes and return `(m, n, d)`.
pub(crate) fn check_inputs(adj: &Adjacency, x: &Tensor) -> Result<(usize, usize, usize)> {
    let (m, n) = adj.shape()?;
    let (n_x, d) = x
        .dims2()
        .map_err(|e| RobustGnnError::Shape(format!("features must be [n, d]: {}", e)))?;
    if n != n_x {
        return Err(RobustGnnError::Shape(format!(
            "adjacency has {} columns but features have {} rows",
            n, n_x
        )));
    }
    Ok((m, n, d))
}

/// `row_sum[:, None] * combined`
pub(crate) fn rescale_by_row_sum(adj: &Adjacency, combined: &Tensor) -> Result<Tensor> {
    adj.row_sum()?
        .unsqueeze(1)
        .and_then(|rs| rs.broadcast_mul(combined))
        .map_err(|e| RobustGnnError::Tensor(format!("row sum rescale failed: {}", e)))
}
