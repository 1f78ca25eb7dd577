//! GCN normalisation and the robust GCN convolution
//!
//! | Item | What |
//! |---|---|
//! | [`gcn_normalize`] | `D⁻¹/² (A + I) D⁻¹/²` over sparse weights |
//! | [`normalize_dense_adjacency`] | the same for a dense matrix, built from its upper triangle |
//! | [`RobustGcnConv`] | `aggregate(Â, X W) + b` with any [`RobustMean`] |
//!
//! ## Example
//!
//! ```rust,ignore
//! use robust_gnn::prelude::*;
//!
//! let conv = RobustGcnConv::new(16, 8, RobustMean::SoftKMedoid, AggregationParams::default(), &device)?
//!     .with_chunks(4)
//!     .with_cache(true);
//! let h = conv.forward(&x, &adj, false)?;
//! ```

use crate::adjacency::{Adjacency, SparseAdjacency};
use crate::aggregation::{AggregationParams, RobustMean};
use crate::chunking::{chunked_message_and_aggregate, robust_aggregation_fn};
use crate::{Result, RobustGnnError};
use candle_core::{DType, Device, Tensor, Var};
use parking_lot::Mutex;
use tracing::{debug, info};

// =============================================================================
// Normalization
// =============================================================================

/// Symmetric GCN normalisation of a sparse adjacency: `D⁻¹/² (A + I) D⁻¹/²`
///
/// With `add_self_loops`, nodes without a self-loop get one of weight 1;
/// existing self-loops keep their weight. Degrees are column sums (incoming
/// weight). A node of degree 0 gets `D⁻¹/² = 0`, so its edges vanish instead
/// of turning into `inf`. Differentiable in the edge weights.
pub fn gcn_normalize(adj: &SparseAdjacency, add_self_loops: bool) -> Result<SparseAdjacency> {
    let (n, n_cols) = adj.shape();
    if n != n_cols {
        return Err(RobustGnnError::Shape(format!(
            "GCN normalisation needs a square adjacency, got {}x{}",
            n, n_cols
        )));
    }
    let device = adj.device();

    let adj = if add_self_loops {
        let mut has_loop = vec![false; n];
        for (&r, &c) in adj.rows().iter().zip(adj.cols()) {
            if r == c {
                has_loop[r as usize] = true;
            }
        }
        let missing: Vec<u32> = (0..n as u32).filter(|&i| !has_loop[i as usize]).collect();
        if missing.is_empty() {
            adj.clone()
        } else {
            let mut rows = adj.rows().to_vec();
            let mut cols = adj.cols().to_vec();
            rows.extend_from_slice(&missing);
            cols.extend_from_slice(&missing);
            let weight = Tensor::ones(missing.len(), DType::F32, device)
                .and_then(|ones| Tensor::cat(&[adj.weight(), &ones], 0))
                .map_err(|e| RobustGnnError::Tensor(format!("add self-loop failed: {}", e)))?;
            SparseAdjacency::new(rows, cols, weight, (n, n))?
        }
    } else {
        adj.clone()
    };
    if adj.nnz() == 0 {
        return Ok(adj);
    }

    // Degree: D[j] = incoming weight of node j
    let degree = Tensor::zeros(n, DType::F32, device)
        .and_then(|z| z.index_add(adj.col_index(), adj.weight(), 0))
        .map_err(|e| RobustGnnError::Tensor(format!("gcn_norm degree failed: {}", e)))?;

    // D⁻¹/² with zero for isolated nodes; the placeholder 1 keeps powf off zero
    let connected = degree
        .gt(0f32)
        .map_err(|e| RobustGnnError::Tensor(format!("gcn_norm degree mask failed: {}", e)))?;
    let ones = Tensor::ones(n, DType::F32, device)
        .map_err(|e| RobustGnnError::Tensor(format!("gcn_norm ones failed: {}", e)))?;
    let zeros = ones
        .zeros_like()
        .map_err(|e| RobustGnnError::Tensor(format!("gcn_norm zeros failed: {}", e)))?;
    let d_inv_sqrt = connected
        .where_cond(&degree, &ones)
        .and_then(|d| d.powf(-0.5))
        .and_then(|d| connected.where_cond(&d, &zeros))
        .map_err(|e| RobustGnnError::Tensor(format!("gcn_norm rsqrt failed: {}", e)))?;

    let weight = d_inv_sqrt
        .index_select(adj.row_index(), 0)
        .and_then(|left| left.mul(adj.weight()))
        .and_then(|w| w.mul(&d_inv_sqrt.index_select(adj.col_index(), 0)?))
        .map_err(|e| RobustGnnError::Tensor(format!("gcn_norm scaling failed: {}", e)))?;
    adj.with_weight(weight)
}

/// GCN normalisation of a dense, undirected adjacency.
///
/// Only the strict upper triangle of `adj` is read; it is mirrored, the
/// diagonal is set to 1 and the result is scaled by `D⁻¹/²` on both sides.
/// Gradients therefore reach the upper triangle only, which is what attacks
/// on an undirected graph want.
pub fn normalize_dense_adjacency(adj: &Tensor) -> Result<Tensor> {
    let (n, n_cols) = adj
        .dims2()
        .map_err(|e| RobustGnnError::Shape(format!("dense adjacency must be 2-D: {}", e)))?;
    if n != n_cols {
        return Err(RobustGnnError::Shape(format!(
            "dense normalisation needs a square adjacency, got {}x{}",
            n, n_cols
        )));
    }
    let adj = crate::primitives::to_f32(adj)?;
    let device = adj.device();

    let eye = Tensor::eye(n, DType::F32, device)
        .map_err(|e| RobustGnnError::Tensor(format!("eye failed: {}", e)))?;
    let strict_upper = Tensor::triu2(n, DType::F32, device)
        .and_then(|t| t.sub(&eye))
        .map_err(|e| RobustGnnError::Tensor(format!("triu failed: {}", e)))?;

    let upper = adj
        .mul(&strict_upper)
        .map_err(|e| RobustGnnError::Tensor(format!("upper triangle failed: {}", e)))?;
    let symmetric = upper
        .t()
        .and_then(|lower| upper.add(&lower))
        .and_then(|s| s.add(&eye))
        .map_err(|e| RobustGnnError::Tensor(format!("symmetrise failed: {}", e)))?;

    // Degree ≥ 1 thanks to the unit diagonal
    let d_inv_sqrt = symmetric
        .sum_keepdim(1)
        .and_then(|d| d.powf(-0.5))
        .map_err(|e| RobustGnnError::Tensor(format!("dense norm degree failed: {}", e)))?;
    let d_inv_sqrt_col = d_inv_sqrt
        .t()
        .map_err(|e| RobustGnnError::Tensor(format!("dense norm transpose failed: {}", e)))?;

    symmetric
        .broadcast_mul(&d_inv_sqrt)
        .and_then(|t| t.broadcast_mul(&d_inv_sqrt_col))
        .map_err(|e| RobustGnnError::Tensor(format!("dense norm scaling failed: {}", e)))
}

// =============================================================================
// Robust GCN layer
// =============================================================================

/// GCN convolution whose neighborhood sum is replaced by a robust mean.
///
/// ```text
/// Â     = gcn_normalize(A, add_self_loops = true)
/// h_out = aggregate(Â, H @ W) + b
/// ```
///
/// The normalised adjacency can be cached across forward passes (training on
/// a fixed graph). Every aggregation is deterministic, so a cached adjacency
/// yields the same output as a fresh one. Call [`RobustGcnConv::release_cache`]
/// when the graph changes.
#[derive(Debug)]
pub struct RobustGcnConv {
    weight: Var,
    bias: Option<Var>,
    mean: RobustMean,
    params: AggregationParams,
    n_chunks: Option<usize>,
    cache_enabled: bool,
    cache: Mutex<Option<SparseAdjacency>>,
}

impl RobustGcnConv {
    /// Glorot-uniform weight `[in_dim, out_dim]`, zero bias.
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        mean: RobustMean,
        params: AggregationParams,
        device: &Device,
    ) -> Result<Self> {
        let bound = (6.0 / (in_dim + out_dim).max(1) as f64).sqrt();
        let weight = Tensor::rand(-bound as f32, bound as f32, (in_dim, out_dim), device)
            .and_then(|t| Var::from_tensor(&t))
            .map_err(|e| RobustGnnError::Tensor(format!("weight init failed: {}", e)))?;
        let bias = Var::zeros(out_dim, DType::F32, device)
            .map_err(|e| RobustGnnError::Tensor(format!("bias init failed: {}", e)))?;
        Self::from_parts(weight, Some(bias), mean, params)
    }

    /// Build from existing parameters.
    pub fn from_parts(
        weight: Var,
        bias: Option<Var>,
        mean: RobustMean,
        params: AggregationParams,
    ) -> Result<Self> {
        params.validate()?;
        let (_, out_dim) = weight
            .as_tensor()
            .dims2()
            .map_err(|e| RobustGnnError::Shape(format!("weight must be [in, out]: {}", e)))?;
        if let Some(b) = &bias {
            if b.as_tensor().dims() != [out_dim] {
                return Err(RobustGnnError::Shape(format!(
                    "bias must be [{}], got {:?}",
                    out_dim,
                    b.as_tensor().dims()
                )));
            }
        }
        info!(%mean, k = params.k, temperature = params.temperature, "robust GCN layer");
        Ok(Self {
            weight,
            bias,
            mean,
            params,
            n_chunks: None,
            cache_enabled: false,
            cache: Mutex::new(None),
        })
    }

    /// Aggregate in `n_chunks` row blocks (checkpointed when the weights need gradients).
    pub fn with_chunks(mut self, n_chunks: usize) -> Self {
        self.n_chunks = Some(n_chunks);
        self
    }

    /// Reuse the normalised adjacency across forward passes.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn mean(&self) -> RobustMean {
        self.mean
    }

    pub fn params(&self) -> &AggregationParams {
        &self.params
    }

    pub fn weight(&self) -> &Var {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Var> {
        self.bias.as_ref()
    }

    /// Weight and bias, for an optimizer.
    pub fn trainable_vars(&self) -> Vec<Var> {
        std::iter::once(self.weight.clone())
            .chain(self.bias.clone())
            .collect()
    }

    pub fn has_cached_adjacency(&self) -> bool {
        self.cache.lock().is_some()
    }

    pub fn release_cache(&self) {
        self.cache.lock().take();
    }

    /// `aggregate(Â, x @ W) + b`
    ///
    /// `weights_require_grad` tells the chunked path whether the edge weights
    /// of `adj` are differentiated (e.g. by a structure attack).
    pub fn forward(
        &self,
        x: &Tensor,
        adj: &SparseAdjacency,
        weights_require_grad: bool,
    ) -> Result<Tensor> {
        let h = x
            .matmul(self.weight.as_tensor())
            .map_err(|e| RobustGnnError::Tensor(format!("robust gcn matmul X@W failed: {}", e)))?;
        let normalized = self.normalized(adj)?;

        let out = match self.n_chunks {
            Some(n_chunks) => chunked_message_and_aggregate(
                &normalized,
                &h,
                n_chunks,
                weights_require_grad,
                Some(robust_aggregation_fn(self.mean, self.params.clone())),
            )?,
            None => self
                .mean
                .aggregate(&Adjacency::Sparse(normalized), &h, &self.params)?,
        };

        match &self.bias {
            Some(b) => out
                .broadcast_add(b.as_tensor())
                .map_err(|e| RobustGnnError::Tensor(format!("robust gcn add bias failed: {}", e))),
            None => Ok(out),
        }
    }

    fn normalized(&self, adj: &SparseAdjacency) -> Result<SparseAdjacency> {
        if !self.cache_enabled {
            return gcn_normalize(adj, true);
        }
        let mut cache = self.cache.lock();
        if let Some(cached) = cache.as_ref() {
            debug!("reusing cached normalised adjacency");
            return Ok(cached.clone());
        }
        let normalized = gcn_normalize(adj, true)?;
        *cache = Some(normalized.clone());
        Ok(normalized)
    }
}
