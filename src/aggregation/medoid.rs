//! Weighted medoid aggregations
//!
//! The weighted medoid of row `i` is the neighbor `c` minimising
//!
//! ```text
//! cost[i, c] = Σ_j A[i, j] · ‖X[c] - X[j]‖
//! ```
//!
//! Candidates that are not neighbors of `i` (`A[i, c] == 0`) and costs that
//! overflow are pinned to `f32::MAX`. For the full neighborhood the cost is a
//! single matmul, `A @ L2ᵀ`; the top-k variant only needs the `k × k`
//! distance block of each row, gathered from the full matrix on the dense
//! path or computed as partial distances on the sparse path.

use super::{check_inputs, rescale_by_row_sum, AggregationParams, ExecutionPath};
use crate::adjacency::Adjacency;
use crate::primitives::{
    check_dense_budget, dense_top_k, distance_matrix, masked_fill, masked_neg_softmax,
    partial_distance_matrix, position_tensor, replace_non_finite, sparse_top_k,
};
use crate::{Result, RobustGnnError};
use candle_core::Tensor;
use tracing::{debug, warn};

/// Hard weighted medoid over the full neighborhood.
///
/// `out[i] = row_sum(A, i) · X[argmin_c cost[i, c]]`. The argmin is not
/// differentiable; gradients reach `X` through the selected row and `A`
/// through the row sum.
pub fn weighted_medoid(adj: &Adjacency, x: &Tensor, params: &AggregationParams) -> Result<Tensor> {
    let (m, n, _) = check_inputs(adj, x)?;
    check_dense_budget(m * n + n * n, params.dense_element_budget, "weighted medoid")?;

    let a = adj.to_dense()?;
    let cost = neighborhood_cost(&a.detach(), &x.detach())?;
    let choice = cost
        .argmin(1)
        .map_err(|e| RobustGnnError::Tensor(format!("medoid argmin failed: {}", e)))?;

    let selected = x
        .index_select(&choice, 0)
        .map_err(|e| RobustGnnError::Tensor(format!("medoid select failed: {}", e)))?;
    rescale_by_row_sum(adj, &selected)
}

/// Hard weighted medoid over each row's `k` heaviest neighbors.
///
/// The dense path gathers `k × k` blocks of the full distance matrix; the
/// sparse path only ever computes the partial distances of each row's top-k
/// neighbors. Falls back to [`weighted_medoid`] when `k` exceeds the number
/// of nodes.
pub fn weighted_medoid_k_neighborhood(
    adj: &Adjacency,
    x: &Tensor,
    params: &AggregationParams,
) -> Result<Tensor> {
    let (m, n, _) = check_inputs(adj, x)?;
    let k = params.k;
    if k > n {
        warn!(k, n, "k exceeds node count, using full-neighborhood medoid");
        return weighted_medoid(adj, x, params);
    }

    match params.path(x.device(), n) {
        ExecutionPath::Dense => {
            let elements = m * n + n * n + m * k * k;
            check_dense_budget(elements, params.dense_element_budget, "k-medoid")?;
            dense_medoid_k_neighborhood(adj, x, k)
        }
        _ => sparse_medoid_k_neighborhood(adj, x, params),
    }
}

fn dense_medoid_k_neighborhood(adj: &Adjacency, x: &Tensor, k: usize) -> Result<Tensor> {
    debug!("dense k-medoid");
    let a = adj.to_dense()?;
    let (top_values, top_idx) = dense_top_k(&a.detach(), k)?;
    let cost = top_k_cost(&x.detach(), &top_values, &top_idx)?;
    let slot = top_k_argmin(&cost, &top_values)?;

    let choice = top_idx
        .gather(&slot, 1)
        .and_then(|c| c.flatten_all())
        .map_err(|e| RobustGnnError::Tensor(format!("k-medoid choice gather failed: {}", e)))?;
    let selected = x
        .index_select(&choice, 0)
        .map_err(|e| RobustGnnError::Tensor(format!("k-medoid select failed: {}", e)))?;
    rescale_by_row_sum(adj, &selected)
}

fn sparse_medoid_k_neighborhood(
    adj: &Adjacency,
    x: &Tensor,
    params: &AggregationParams,
) -> Result<Tensor> {
    debug!("sparse k-medoid");
    let sparse = adj.to_sparse()?.with_all_rows()?;
    let top = sparse_top_k(&sparse, params.k, params.top_k_backend)?;
    let values = top.values.detach();

    let partial = partial_distance_matrix(&x.detach(), &top.indices)?;
    let cost = values
        .unsqueeze(1)
        .and_then(|v| partial.broadcast_mul(&v))
        .and_then(|t| t.sum(2))
        .map_err(|e| RobustGnnError::Tensor(format!("k-medoid cost failed: {}", e)))?;
    let slot = top_k_argmin(&cost, &values)?;

    // Every row holds at least its placeholder in slot 0, so the argmin slot
    // always names a real column
    let choice = top
        .gather_indices()?
        .reshape((top.n_rows(), top.k()))
        .and_then(|g| g.gather(&slot, 1))
        .and_then(|c| c.flatten_all())
        .map_err(|e| RobustGnnError::Tensor(format!("k-medoid choice gather failed: {}", e)))?;
    let selected = x
        .index_select(&choice, 0)
        .map_err(|e| RobustGnnError::Tensor(format!("k-medoid select failed: {}", e)))?;
    rescale_by_row_sum(&Adjacency::Sparse(sparse), &selected)
}

/// `[m, 1]` slot of the cheapest top-k candidate.
///
/// Zero-weight slots (padding and explicit zero edges) are never candidates.
fn top_k_argmin(cost: &Tensor, values: &Tensor) -> Result<Tensor> {
    let excluded = values
        .eq(0f32)
        .map_err(|e| RobustGnnError::Tensor(format!("k-medoid padding mask failed: {}", e)))?;
    let cost = replace_non_finite(&masked_fill(cost, &excluded, f32::MAX)?, f32::MAX)?;
    cost.argmin_keepdim(1)
        .map_err(|e| RobustGnnError::Tensor(format!("k-medoid argmin failed: {}", e)))
}

/// Soft weighted medoid over the full neighborhood.
///
/// `out[i] = row_sum(A, i) · Σ_c softmax(-cost[i, ·] / T)[c] · X[c]`, which
/// converges to [`weighted_medoid`] as `T → 0`.
pub fn soft_weighted_medoid(
    adj: &Adjacency,
    x: &Tensor,
    params: &AggregationParams,
) -> Result<Tensor> {
    let (m, n, _) = check_inputs(adj, x)?;
    check_dense_budget(m * n + n * n, params.dense_element_budget, "soft medoid")?;

    let a = adj.to_dense()?;
    let cost = raw_neighborhood_cost(&a, x)?;
    let not_neighbor = a
        .eq(0f32)
        .map_err(|e| RobustGnnError::Tensor(format!("soft medoid mask failed: {}", e)))?;
    let weights = masked_neg_softmax(&cost, Some(&not_neighbor), params.temperature, 1)?;

    let combined = weights
        .matmul(x)
        .map_err(|e| RobustGnnError::Tensor(format!("soft medoid combine failed: {}", e)))?;
    rescale_by_row_sum(adj, &combined)
}

/// `A @ L2ᵀ`, unmasked.
fn raw_neighborhood_cost(a: &Tensor, x: &Tensor) -> Result<Tensor> {
    let l2 = distance_matrix(x)?;
    l2.t()
        .and_then(|l2t| a.matmul(&l2t))
        .map_err(|e| RobustGnnError::Tensor(format!("medoid cost matmul failed: {}", e)))
}

/// `A @ L2ᵀ` with non-neighbors and non-finite costs at `f32::MAX`.
fn neighborhood_cost(a: &Tensor, x: &Tensor) -> Result<Tensor> {
    let cost = raw_neighborhood_cost(a, x)?;
    let not_neighbor = a
        .eq(0f32)
        .map_err(|e| RobustGnnError::Tensor(format!("medoid mask failed: {}", e)))?;
    replace_non_finite(&masked_fill(&cost, &not_neighbor, f32::MAX)?, f32::MAX)
}

/// `cost[i, c] = Σ_j values[i, j] · L2[idx[i, c], idx[i, j]]`, `[m, k]`.
///
/// Shared with the dense soft k-medoid.
pub(crate) fn top_k_cost(x: &Tensor, values: &Tensor, idx: &Tensor) -> Result<Tensor> {
    let (m, k) = idx
        .dims2()
        .map_err(|e| RobustGnnError::Shape(format!("top-k index must be [m, k]: {}", e)))?;
    let n = x
        .dim(0)
        .map_err(|e| RobustGnnError::Shape(format!("features must be [n, d]: {}", e)))?;

    let idx_host = idx
        .flatten_all()
        .and_then(|t| t.to_vec1::<u32>())
        .map_err(|e| RobustGnnError::Tensor(format!("top-k index readback failed: {}", e)))?;
    let mut pair = Vec::with_capacity(m * k * k);
    for row in idx_host.chunks(k) {
        for &c in row {
            for &j in row {
                pair.push(c as i64 * n as i64 + j as i64);
            }
        }
    }

    let l2 = distance_matrix(x)?;
    let pair = position_tensor(&pair, x.device())?;
    let block = l2
        .flatten_all()
        .and_then(|t| t.index_select(&pair, 0))
        .and_then(|t| t.reshape((m, k, k)))
        .map_err(|e| RobustGnnError::Tensor(format!("top-k distance gather failed: {}", e)))?;

    values
        .unsqueeze(1)
        .and_then(|v| block.broadcast_mul(&v))
        .and_then(|t| t.sum(2))
        .map_err(|e| RobustGnnError::Tensor(format!("top-k cost reduce failed: {}", e)))
}
