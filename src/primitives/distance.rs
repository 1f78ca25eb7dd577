//! Euclidean distance primitives
//!
//! - [`distance_matrix`]: all pairs, `[n, n]`, via the norm expansion.
//! - [`partial_distance_matrix`]: only pairs that co-occur in some row's
//!   top-k neighborhood, `[m, k, k]`, each unordered pair computed once.

use super::tensor_ops::{index_tensor, position_tensor, safe_sqrt, SAFE_SQRT_EPS_FACTOR};
use super::topk::NO_INDEX;
use crate::{Result, RobustGnnError};
use candle_core::{DType, Tensor};

/// Pairwise Euclidean distances between the rows of `x` (`[n, d]` → `[n, n]`).
///
/// ```text
/// ‖a - b‖ = sqrt(|‖a‖² + ‖b‖² - 2 a·b| + 1e2 · ε)
/// ```
pub fn distance_matrix(x: &Tensor) -> Result<Tensor> {
    let norms = x
        .sqr()
        .and_then(|t| t.sum_keepdim(1))
        .map_err(|e| RobustGnnError::Tensor(format!("distance norms failed: {}", e)))?;

    let gram = x
        .t()
        .and_then(|xt| x.matmul(&xt))
        .map_err(|e| RobustGnnError::Tensor(format!("distance gram failed: {}", e)))?;

    let squared = norms
        .t()
        .and_then(|nt| norms.broadcast_add(&nt))
        .and_then(|s| s.sub(&(&gram * 2.0)?))
        .map_err(|e| RobustGnnError::Tensor(format!("distance expansion failed: {}", e)))?;

    safe_sqrt(&squared)
}

/// Distances between the selected neighbors of every row.
///
/// `partial_idx` is `[m, k]` (`i64`, [`NO_INDEX`] for padding) as produced by
/// the top-k selector. The result `out[i, a, b]` is the distance between
/// nodes `partial_idx[i, a]` and `partial_idx[i, b]`, and zero when either
/// slot is padding.
///
/// Every pair is canonicalised to `(min, max)` and flattened to
/// `min * n + max`; duplicates are removed before any distance is computed, so
/// a pair shared by many rows costs one row-difference and gradients are
/// accumulated once per unique pair.
pub fn partial_distance_matrix(x: &Tensor, partial_idx: &Tensor) -> Result<Tensor> {
    let (m, k) = partial_idx
        .dims2()
        .map_err(|e| RobustGnnError::Shape(format!("partial index must be [m, k]: {}", e)))?;
    let n = x
        .dim(0)
        .map_err(|e| RobustGnnError::Shape(format!("features must be [n, d]: {}", e)))?;
    let device = x.device();

    let idx = partial_idx
        .to_dtype(DType::I64)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<i64>())
        .map_err(|e| RobustGnnError::Tensor(format!("partial index readback failed: {}", e)))?;

    let mut positions: Vec<i64> = Vec::new();
    let mut linear: Vec<u64> = Vec::new();
    for row in 0..m {
        let slots = &idx[row * k..(row + 1) * k];
        for (a, &ia) in slots.iter().enumerate() {
            if ia == NO_INDEX {
                continue;
            }
            for (b, &ib) in slots.iter().enumerate() {
                if ib == NO_INDEX {
                    continue;
                }
                if ia < 0 || ib < 0 || ia as usize >= n || ib as usize >= n {
                    return Err(RobustGnnError::Shape(format!(
                        "neighbor index ({}, {}) out of range for {} nodes",
                        ia, ib, n
                    )));
                }
                let (lo, hi) = if ia <= ib { (ia, ib) } else { (ib, ia) };
                positions.push(slot_position(row, k, a, b));
                linear.push(lo as u64 * n as u64 + hi as u64);
            }
        }
    }

    if positions.is_empty() {
        return Tensor::zeros((m, k, k), DType::F32, device)
            .map_err(|e| RobustGnnError::Tensor(format!("partial distance zeros failed: {}", e)));
    }

    let mut unique = linear.clone();
    unique.sort_unstable();
    unique.dedup();

    let inverse: Vec<i64> = linear
        .iter()
        .map(|l| unique.binary_search(l).map(|p| p as i64))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| RobustGnnError::Tensor("partial distance dedup lost a pair".into()))?;
    let lo: Vec<u32> = unique.iter().map(|l| (l / n as u64) as u32).collect();
    let hi: Vec<u32> = unique.iter().map(|l| (l % n as u64) as u32).collect();

    let x_lo = x
        .index_select(&index_tensor(&lo, device)?, 0)
        .map_err(|e| RobustGnnError::Tensor(format!("partial distance select failed: {}", e)))?;
    let x_hi = x
        .index_select(&index_tensor(&hi, device)?, 0)
        .map_err(|e| RobustGnnError::Tensor(format!("partial distance select failed: {}", e)))?;

    let eps = SAFE_SQRT_EPS_FACTOR * f32::EPSILON as f64;
    let pair_dist = (x_lo - x_hi)
        .and_then(|d| d.sqr())
        .and_then(|d| d.sum(1))
        .and_then(|d| d.affine(1.0, eps))
        .and_then(|d| d.sqrt())
        .map_err(|e| RobustGnnError::Tensor(format!("partial distance norm failed: {}", e)))?;

    let scattered = pair_dist
        .index_select(&position_tensor(&inverse, device)?, 0)
        .map_err(|e| RobustGnnError::Tensor(format!("partial distance expand failed: {}", e)))?;

    let positions = position_tensor(&positions, device)?;
    Tensor::zeros(m * k * k, DType::F32, device)
        .and_then(|z| z.index_add(&positions, &scattered, 0))
        .and_then(|t| t.reshape((m, k, k)))
        .map_err(|e| RobustGnnError::Tensor(format!("partial distance scatter failed: {}", e)))
}

/// Offset of `out[row, a, b]` in a row-major `[m, k, k]` buffer.
fn slot_position(row: usize, k: usize, a: usize, b: usize) -> i64 {
    ((row as i64 * k as i64 + a as i64) * k as i64) + b as i64
}
