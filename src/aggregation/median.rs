//! Dimension-wise weighted median and its soft relaxation
//!
//! For row `i` and feature dimension `c` the weighted median is the neighbor
//! value at which the cumulative weight, taken over neighbors sorted by
//! `X[:, c]`, first reaches half of the row's total weight. Every dimension
//! picks its own neighbor.
//!
//! The index selection runs on detached tensors and has no gradient.
//! [`weighted_dimwise_median`] passes gradients to `X` through the selected
//! entries and to `A` through the row sums only. [`soft_median`] keeps the hard
//! median as an anchor and re-weights the edges by a softmax over their
//! distance to it, which is differentiable in both `X` and the edge weights.
//!
//! Median index kernels:
//!
//! - **dense**: sort all `n` nodes per dimension, gather the dense adjacency
//!   in that order. `O(m · n · d)` memory.
//! - **padded**: lay each row's neighbors out in a `[m, max_degree]` grid and
//!   sort within the row. `O(m · max_degree · d)` memory.
//!
//! Both break ties in feature value by ascending node index and pick the same
//! neighbor.

use super::{check_inputs, rescale_by_row_sum, AggregationParams, ExecutionPath};
use crate::adjacency::{Adjacency, SparseAdjacency};
use crate::primitives::{check_dense_budget, safe_sqrt, scatter_softmax, RowLayout};
use crate::{Result, RobustGnnError};
use candle_core::{DType, Tensor};
use tracing::debug;

/// Weighted dimension-wise median.
///
/// `out[i, c] = row_sum(A, i) · X[median(i, c), c]`
pub fn weighted_dimwise_median(
    adj: &Adjacency,
    x: &Tensor,
    params: &AggregationParams,
) -> Result<Tensor> {
    let (m, n, d) = check_inputs(adj, x)?;
    if m == 0 || n == 0 {
        return zeros((m, d), x);
    }
    let idx = dimmedian_idx(adj, &x.detach(), params)?;
    let selected = x
        .gather(&idx, 0)
        .map_err(|e| RobustGnnError::Tensor(format!("median gather failed: {}", e)))?;
    rescale_by_row_sum(adj, &selected)
}

/// Soft weighted median.
///
/// With `μ_i` the dimension-wise median of row `i` and
/// `dist_ij = ‖μ_i - X[j]‖ / √d` for every edge `(i, j)`:
///
/// ```text
/// s_ij   = segment_softmax_i(-dist_ij / T)
/// w'_ij  = s_ij · A_ij / (Σ_j s_ij · A_ij + eps) · row_sum(A, i)
/// out[i] = Σ_j w'_ij · X[j]
/// ```
///
/// Always edge-proportional; the dense adjacency is converted to an edge list.
pub fn soft_median(adj: &Adjacency, x: &Tensor, params: &AggregationParams) -> Result<Tensor> {
    let (m, n, d) = check_inputs(adj, x)?;
    let sparse = adj.to_sparse()?;
    if sparse.nnz() == 0 || n == 0 {
        return zeros((m, d), x);
    }
    debug!(nnz = sparse.nnz(), "soft median");

    let weight_sums = sparse.row_sum()?;
    let median_idx = dimmedian_idx(&Adjacency::Sparse(sparse.clone()), &x.detach(), params)?;
    let x_median = x
        .gather(&median_idx, 0)
        .map_err(|e| RobustGnnError::Tensor(format!("soft median anchor gather failed: {}", e)))?;

    let row_index = sparse.row_index();
    let col_index = sparse.col_index();
    let squared = x_median
        .index_select(row_index, 0)
        .and_then(|anchor| anchor.sub(&x.index_select(col_index, 0)?))
        .and_then(|diff| diff.sqr())
        .and_then(|sq| sq.sum(1))
        .map_err(|e| RobustGnnError::Tensor(format!("soft median distance failed: {}", e)))?;
    let logits = safe_sqrt(&squared)?
        .affine(-1.0 / ((d as f64).sqrt() * params.temperature), 0.0)
        .map_err(|e| RobustGnnError::Tensor(format!("soft median logits failed: {}", e)))?;

    let soft = scatter_softmax(&logits, sparse.rows(), row_index, m, params.eps)?;
    let edge_weights = edge_weights(&sparse, &soft, &weight_sums, params.eps)?;

    let messages = x
        .index_select(col_index, 0)
        .and_then(|xj| xj.broadcast_mul(&edge_weights.unsqueeze(1)?))
        .map_err(|e| RobustGnnError::Tensor(format!("soft median messages failed: {}", e)))?;
    Tensor::zeros((m, d), DType::F32, x.device())
        .and_then(|z| z.index_add(row_index, &messages, 0))
        .map_err(|e| RobustGnnError::Tensor(format!("soft median aggregate failed: {}", e)))
}

/// `s · A / (Σ_row s · A + eps) · row_sum`, per edge.
fn edge_weights(
    sparse: &SparseAdjacency,
    soft: &Tensor,
    weight_sums: &Tensor,
    eps: f64,
) -> Result<Tensor> {
    let row_index = sparse.row_index();
    let weighted = soft
        .mul(sparse.weight())
        .map_err(|e| RobustGnnError::Tensor(format!("soft median weighting failed: {}", e)))?;
    let norm = Tensor::zeros(sparse.n_rows(), DType::F32, sparse.device())
        .and_then(|z| z.index_add(row_index, &weighted, 0))
        .and_then(|s| s.index_select(row_index, 0))
        .and_then(|s| s.affine(1.0, eps))
        .map_err(|e| RobustGnnError::Tensor(format!("soft median normalisation failed: {}", e)))?;
    weighted
        .div(&norm)
        .and_then(|w| w.mul(&weight_sums.index_select(row_index, 0)?))
        .map_err(|e| RobustGnnError::Tensor(format!("soft median rescale failed: {}", e)))
}

/// Per-dimension median node, `[m, d]` `u32`. Inputs should be detached.
fn dimmedian_idx(adj: &Adjacency, x: &Tensor, params: &AggregationParams) -> Result<Tensor> {
    let (m, n, d) = check_inputs(adj, x)?;
    match params.path(x.device(), n) {
        ExecutionPath::Dense => {
            let elements = 2 * m * n * d + n * n;
            check_dense_budget(elements, params.dense_element_budget, "dense dimmedian")?;
            dimmedian_idx_dense(&adj.to_dense()?.detach(), x)
        }
        _ => dimmedian_idx_padded(&adj.to_sparse()?, x),
    }
}

fn dimmedian_idx_dense(a: &Tensor, x: &Tensor) -> Result<Tensor> {
    let (m, n) = a
        .dims2()
        .map_err(|e| RobustGnnError::Shape(format!("dense adjacency must be 2-D: {}", e)))?;
    let d = x
        .dim(1)
        .map_err(|e| RobustGnnError::Shape(format!("features must be [n, d]: {}", e)))?;

    // order[c] lists the nodes by ascending X[:, c]
    let order = x
        .t()
        .and_then(|t| t.contiguous())
        .and_then(|t| t.arg_sort_last_dim(true))
        .map_err(|e| RobustGnnError::Tensor(format!("dimmedian sort failed: {}", e)))?;
    let order_flat = order
        .flatten_all()
        .map_err(|e| RobustGnnError::Tensor(format!("dimmedian sort failed: {}", e)))?;
    let sorted_weights = a
        .index_select(&order_flat, 1)
        .and_then(|w| w.reshape((m, d, n)))
        .map_err(|e| RobustGnnError::Tensor(format!("dimmedian weight gather failed: {}", e)))?;

    let position = median_position(&sorted_weights)?;
    order
        .unsqueeze(0)
        .and_then(|o| o.broadcast_as((m, d, n)))
        .and_then(|o| o.contiguous())
        .and_then(|o| o.gather(&position, 2))
        .and_then(|o| o.squeeze(2))
        .map_err(|e| RobustGnnError::Tensor(format!("dimmedian node gather failed: {}", e)))
}

fn dimmedian_idx_padded(adj: &SparseAdjacency, x: &Tensor) -> Result<Tensor> {
    let m = adj.n_rows();
    let d = x
        .dim(1)
        .map_err(|e| RobustGnnError::Shape(format!("features must be [n, d]: {}", e)))?;
    let device = x.device();
    let layout = RowLayout::build(adj);
    let width = layout.width;

    let weights = layout.scatter(adj, &adj.weight().detach())?;
    let columns = layout.columns(m, device)?;
    let valid = layout.valid(m, device)?;

    let columns_flat = columns
        .flatten_all()
        .map_err(|e| RobustGnnError::Tensor(format!("dimmedian column flatten failed: {}", e)))?;
    let values = x
        .index_select(&columns_flat, 0)
        .and_then(|v| v.reshape((m, width, d)))
        .and_then(|v| v.transpose(1, 2))
        .and_then(|v| v.contiguous())
        .map_err(|e| RobustGnnError::Tensor(format!("dimmedian value gather failed: {}", e)))?;

    // Padding sorts behind every real neighbor
    let ceiling = Tensor::full(f32::MAX, (m, d, width), device)
        .map_err(|e| RobustGnnError::Tensor(format!("dimmedian fill failed: {}", e)))?;
    let order = valid
        .unsqueeze(1)
        .and_then(|v| v.broadcast_as((m, d, width)))
        .and_then(|v| v.contiguous())
        .and_then(|v| v.where_cond(&values, &ceiling))
        .and_then(|keys| keys.arg_sort_last_dim(true))
        .map_err(|e| RobustGnnError::Tensor(format!("dimmedian row sort failed: {}", e)))?;

    let sorted_weights = weights
        .unsqueeze(1)
        .and_then(|w| w.broadcast_as((m, d, width)))
        .and_then(|w| w.contiguous())
        .and_then(|w| w.gather(&order, 2))
        .map_err(|e| RobustGnnError::Tensor(format!("dimmedian weight gather failed: {}", e)))?;

    let position = median_position(&sorted_weights)?;
    let slot = order
        .gather(&position, 2)
        .map_err(|e| RobustGnnError::Tensor(format!("dimmedian slot gather failed: {}", e)))?;
    columns
        .unsqueeze(1)
        .and_then(|c| c.broadcast_as((m, d, width)))
        .and_then(|c| c.contiguous())
        .and_then(|c| c.gather(&slot, 2))
        .and_then(|c| c.squeeze(2))
        .map_err(|e| RobustGnnError::Tensor(format!("dimmedian node gather failed: {}", e)))
}

/// Position along the last axis where the cumulative weight first reaches
/// half of the total, `[.., .., 1]` `u32`.
///
/// A row without weight resolves to position 0.
fn median_position(sorted_weights: &Tensor) -> Result<Tensor> {
    let width = sorted_weights
        .dim(2)
        .map_err(|e| RobustGnnError::Shape(format!("sorted weights must be 3-D: {}", e)))?;
    let cumulative = sorted_weights
        .cumsum(2)
        .map_err(|e| RobustGnnError::Tensor(format!("dimmedian cumsum failed: {}", e)))?;
    let half = cumulative
        .max_keepdim(2)
        .and_then(|t| t.affine(0.5, 0.0))
        .map_err(|e| RobustGnnError::Tensor(format!("dimmedian half weight failed: {}", e)))?;
    cumulative
        .broadcast_lt(&half)
        .and_then(|below| below.to_dtype(DType::F32))
        .and_then(|below| below.sum_keepdim(2))
        .and_then(|count| count.clamp(0f32, width.saturating_sub(1) as f32))
        .and_then(|count| count.to_dtype(DType::U32))
        .map_err(|e| RobustGnnError::Tensor(format!("dimmedian position failed: {}", e)))
}

fn zeros(shape: (usize, usize), like: &Tensor) -> Result<Tensor> {
    Tensor::zeros(shape, DType::F32, like.device())
        .map_err(|e| RobustGnnError::Tensor(format!("zeros failed: {}", e)))
}
