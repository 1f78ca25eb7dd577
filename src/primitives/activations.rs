//! Softmax variants used by the soft aggregations
//!
//! All of them operate on `f32` and never emit NaN for finite or masked input:
//! excluded and non-finite logits are pinned to `-f32::MAX` instead of `-inf`,
//! so a fully masked row degrades to a uniform distribution rather than `0/0`.

use super::tensor_ops::{finite_mask, masked_fill};
use crate::{Result, RobustGnnError};
use candle_core::{DType, Tensor};

/// Softmax activation along dimension `dim`
pub fn softmax(tensor: &Tensor, dim: usize) -> Result<Tensor> {
    candle_nn::ops::softmax(tensor, dim)
        .map_err(|e| RobustGnnError::Tensor(format!("Softmax failed: {}", e)))
}

/// `softmax(-distances / temperature)` along `dim` with masking.
///
/// Entries where `excluded != 0` (and any entry whose scaled logit is not
/// finite) are set to `-f32::MAX` before the softmax, so their weight
/// underflows to exactly zero whenever the row has at least one valid entry.
pub fn masked_neg_softmax(
    distances: &Tensor,
    excluded: Option<&Tensor>,
    temperature: f64,
    dim: usize,
) -> Result<Tensor> {
    let logits = distances
        .affine(-1.0 / temperature, 0.0)
        .map_err(|e| RobustGnnError::Tensor(format!("logit scaling failed: {}", e)))?;

    let fill = Tensor::full(-f32::MAX, logits.shape(), logits.device())
        .map_err(|e| RobustGnnError::Tensor(format!("logit fill failed: {}", e)))?;
    let logits = finite_mask(&logits)?
        .where_cond(&logits, &fill)
        .map_err(|e| RobustGnnError::Tensor(format!("non-finite logit mask failed: {}", e)))?;

    let logits = match excluded {
        Some(mask) => masked_fill(&logits, mask, -f32::MAX)?,
        None => logits,
    };

    softmax(&logits, dim)
}

/// Softmax over segments of a 1-D tensor.
///
/// `index[e]` assigns entry `e` of `src` to a segment in `0..n_segments`;
/// each segment is normalised independently:
///
/// ```text
/// out[e] = exp(src[e] - max_s) / (Σ_{e' ∈ s} exp(src[e'] - max_s) + eps)
/// ```
///
/// The per-segment max is computed on the host from detached values. The shift
/// cancels analytically, so gradients are unaffected.
pub fn scatter_softmax(
    src: &Tensor,
    index: &[u32],
    index_t: &Tensor,
    n_segments: usize,
    eps: f64,
) -> Result<Tensor> {
    let device = src.device();

    let fill = Tensor::full(-f32::MAX, src.shape(), device)
        .map_err(|e| RobustGnnError::Tensor(format!("scatter softmax fill failed: {}", e)))?;
    let src = finite_mask(src)?
        .where_cond(src, &fill)
        .map_err(|e| RobustGnnError::Tensor(format!("scatter softmax mask failed: {}", e)))?;

    let values = src
        .detach()
        .to_vec1::<f32>()
        .map_err(|e| RobustGnnError::Tensor(format!("scatter softmax readback failed: {}", e)))?;
    if values.len() != index.len() {
        return Err(RobustGnnError::Shape(format!(
            "scatter softmax: {} values but {} segment indices",
            values.len(),
            index.len()
        )));
    }

    let mut segment_max = vec![f32::NEG_INFINITY; n_segments];
    for (&segment, &v) in index.iter().zip(&values) {
        let slot = segment_max.get_mut(segment as usize).ok_or_else(|| {
            RobustGnnError::Shape(format!(
                "segment index {} out of range for {} segments",
                segment, n_segments
            ))
        })?;
        if v > *slot {
            *slot = v;
        }
    }
    // Empty segments are never gathered
    let segment_max: Vec<f32> = segment_max
        .into_iter()
        .map(|m| if m.is_finite() { m } else { 0.0 })
        .collect();

    let shift = Tensor::from_vec(segment_max, n_segments, device)
        .and_then(|t| t.index_select(index_t, 0))
        .map_err(|e| RobustGnnError::Tensor(format!("scatter softmax shift failed: {}", e)))?;

    let exp = src
        .sub(&shift)
        .and_then(|t| t.exp())
        .map_err(|e| RobustGnnError::Tensor(format!("scatter softmax exp failed: {}", e)))?;

    let denom = Tensor::zeros(n_segments, DType::F32, device)
        .and_then(|z| z.index_add(index_t, &exp, 0))
        .and_then(|s| s.index_select(index_t, 0))
        .and_then(|s| s.affine(1.0, eps))
        .map_err(|e| RobustGnnError::Tensor(format!("scatter softmax sum failed: {}", e)))?;

    exp.div(&denom)
        .map_err(|e| RobustGnnError::Tensor(format!("scatter softmax div failed: {}", e)))
}
