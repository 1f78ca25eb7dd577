//! Soft weighted medoid over the top-k neighborhood
//!
//! For row `i` with top-k neighbors `N_k(i)` and their weights `a`:
//!
//! ```text
//! cost[c] = Σ_{j ∈ N_k(i)} a_j · ‖X[c] - X[j]‖          c ∈ N_k(i)
//! s       = softmax(-cost / T)                           (padding masked)
//! s       = s · a / (Σ s · a + eps)                      (weight correction)
//! out[i]  = row_sum(A, i) · Σ_c s_c · X[c]
//! ```
//!
//! Two implementations, numerically interchangeable:
//!
//! - **dense**: top-k over the dense matrix, `k × k` blocks of the full
//!   distance matrix; padding slots are the zero-weight columns.
//! - **sparse**: sparse top-k, partial distances; padding slots carry
//!   [`NO_INDEX`](crate::primitives::NO_INDEX). Empty rows get a zero-weight
//!   placeholder first, so every row keeps at least one valid slot.
//!
//! Padding and zero-weight edges are masked out of the softmax on both paths.

use super::medoid::{soft_weighted_medoid, top_k_cost};
use super::{check_inputs, rescale_by_row_sum, AggregationParams, ExecutionPath};
use crate::adjacency::Adjacency;
use crate::primitives::{
    check_dense_budget, dense_top_k, masked_neg_softmax, partial_distance_matrix, sparse_top_k,
};
use crate::{Result, RobustGnnError};
use candle_core::Tensor;
use tracing::{debug, warn};

/// Soft weighted medoid restricted to each row's `k` heaviest neighbors.
///
/// With `k > n` this is [`soft_weighted_medoid`] when weight correction is
/// off; the weight-corrected full-graph variant does not exist and is
/// reported as [`RobustGnnError::NotImplemented`].
pub fn soft_weighted_medoid_k_neighborhood(
    adj: &Adjacency,
    x: &Tensor,
    params: &AggregationParams,
) -> Result<Tensor> {
    let (m, n, d) = check_inputs(adj, x)?;
    let k = params.k;

    if k > n {
        if params.with_weight_correction {
            return Err(RobustGnnError::NotImplemented(format!(
                "soft k-medoid with weight correction for k ({}) > n ({})",
                k, n
            )));
        }
        warn!(k, n, "k exceeds node count, using full-neighborhood soft medoid");
        return soft_weighted_medoid(adj, x, params);
    }

    match params.path(x.device(), n) {
        ExecutionPath::Dense => {
            let elements = m * n + n * n + m * k * k + m * k * d;
            check_dense_budget(elements, params.dense_element_budget, "dense soft k-medoid")?;
            dense_soft_k_medoid(adj, x, params)
        }
        _ => sparse_soft_k_medoid(adj, x, params),
    }
}

fn dense_soft_k_medoid(adj: &Adjacency, x: &Tensor, params: &AggregationParams) -> Result<Tensor> {
    debug!("dense soft k-medoid");
    let a = adj.to_dense()?;
    let (values, idx) = dense_top_k(&a, params.k)?;
    let cost = top_k_cost(x, &values, &idx)?;

    let padding = values
        .eq(0f32)
        .map_err(|e| RobustGnnError::Tensor(format!("soft k-medoid padding mask failed: {}", e)))?;
    let weights = masked_neg_softmax(&cost, Some(&padding), params.temperature, 1)?;
    let weights = correct_weights(weights, &values, params)?;

    let gather = idx
        .flatten_all()
        .map_err(|e| RobustGnnError::Tensor(format!("soft k-medoid index flatten failed: {}", e)))?;
    let combined = combine(&weights, x, &gather)?;
    rescale_by_row_sum(adj, &combined)
}

fn sparse_soft_k_medoid(adj: &Adjacency, x: &Tensor, params: &AggregationParams) -> Result<Tensor> {
    debug!("sparse soft k-medoid");
    let sparse = adj.to_sparse()?.with_all_rows()?;
    let top = sparse_top_k(&sparse, params.k, params.top_k_backend)?;

    let partial = partial_distance_matrix(x, &top.indices)?;
    let cost = top
        .values
        .unsqueeze(1)
        .and_then(|v| partial.broadcast_mul(&v))
        .and_then(|t| t.sum(2))
        .map_err(|e| RobustGnnError::Tensor(format!("soft k-medoid cost failed: {}", e)))?;

    // Sentinel slots carry weight 0 as well, so one mask covers them and
    // explicit zero-weight edges
    let excluded = top
        .values
        .eq(0f32)
        .map_err(|e| RobustGnnError::Tensor(format!("soft k-medoid padding mask failed: {}", e)))?;
    let weights = masked_neg_softmax(&cost, Some(&excluded), params.temperature, 1)?;
    let weights = correct_weights(weights, &top.values, params)?;
    let weights = weights
        .mul(&top.valid_mask()?)
        .map_err(|e| {
            RobustGnnError::Tensor(format!("soft k-medoid sentinel zeroing failed: {}", e))
        })?;

    let combined = combine(&weights, x, &top.gather_indices()?)?;
    rescale_by_row_sum(&Adjacency::Sparse(sparse), &combined)
}

/// Optionally re-weight the softmax by the edge weights and renormalise.
fn correct_weights(weights: Tensor, values: &Tensor, params: &AggregationParams) -> Result<Tensor> {
    if !params.with_weight_correction {
        return Ok(weights);
    }
    let weighted = weights
        .mul(values)
        .map_err(|e| RobustGnnError::Tensor(format!("weight correction mul failed: {}", e)))?;
    let norm = weighted
        .sum_keepdim(1)
        .and_then(|s| s.affine(1.0, params.eps))
        .map_err(|e| RobustGnnError::Tensor(format!("weight correction sum failed: {}", e)))?;
    weighted
        .broadcast_div(&norm)
        .map_err(|e| RobustGnnError::Tensor(format!("weight correction div failed: {}", e)))
}

/// `Σ_c weights[i, c] · X[gather[i, c]]` via a batched `[m, 1, k] @ [m, k, d]`.
fn combine(weights: &Tensor, x: &Tensor, gather: &Tensor) -> Result<Tensor> {
    let (m, k) = weights
        .dims2()
        .map_err(|e| RobustGnnError::Shape(format!("combination weights must be [m, k]: {}", e)))?;
    let d = x
        .dim(1)
        .map_err(|e| RobustGnnError::Shape(format!("features must be [n, d]: {}", e)))?;
    let neighbors = x
        .index_select(gather, 0)
        .and_then(|t| t.reshape((m, k, d)))
        .map_err(|e| RobustGnnError::Tensor(format!("neighbor gather failed: {}", e)))?;
    weights
        .unsqueeze(1)
        .and_then(|w| w.matmul(&neighbors))
        .and_then(|t| t.squeeze(1))
        .map_err(|e| RobustGnnError::Tensor(format!("neighbor combine failed: {}", e)))
}
