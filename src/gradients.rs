//! Gradient diagnostics
//!
//! Attack and training loops differentiate through the aggregations w.r.t.
//! the adjacency weights and the features. These helpers report on the
//! resulting gradients without touching them.

use crate::{Result, RobustGnnError};
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use tracing::warn;

/// True when every element of `t` is finite.
pub fn tensor_is_finite(t: &Tensor) -> Result<bool> {
    let values = t
        .flatten_all()
        .and_then(|t| t.to_dtype(candle_core::DType::F32))
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(|e| RobustGnnError::Tensor(format!("finite check readback failed: {}", e)))?;
    Ok(values.iter().all(|v| v.is_finite()))
}

/// Compute the total L2 norm of all gradients
///
/// Variables without a gradient contribute nothing.
pub fn compute_grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f32> {
    let mut total_sq_norm = 0.0f32;

    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let sq_norm = grad
                .sqr()
                .and_then(|t| t.sum_all())
                .and_then(|t| t.to_scalar::<f32>())
                .map_err(|e| RobustGnnError::Tensor(format!("grad norm failed: {}", e)))?;
            total_sq_norm += sq_norm;
        }
    }

    Ok(total_sq_norm.sqrt())
}

/// Check if any gradient contains NaN or Inf
///
/// Returns true if gradients are healthy (no NaN/Inf).
pub fn check_gradients_health(grads: &GradStore, vars: &[Var]) -> bool {
    for (i, var) in vars.iter().enumerate() {
        if let Some(grad) = grads.get(var.as_tensor()) {
            match tensor_is_finite(grad) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(var = i, "non-finite gradient");
                    return false;
                }
                Err(e) => {
                    warn!(var = i, error = %e, "gradient readback failed");
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_tensor_is_finite() {
        let ok = Tensor::new(&[1.0f32, -2.0, 0.0], &Device::Cpu).unwrap();
        assert!(tensor_is_finite(&ok).unwrap());
        let bad = Tensor::new(&[1.0f32, f32::NAN], &Device::Cpu).unwrap();
        assert!(!tensor_is_finite(&bad).unwrap());
        let inf = Tensor::new(&[f32::INFINITY], &Device::Cpu).unwrap();
        assert!(!tensor_is_finite(&inf).unwrap());
    }

    #[test]
    fn test_grad_norm_and_health() {
        let a = Var::new(&[3.0f32, 4.0], &Device::Cpu).unwrap();
        let b = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        // d/da sum(a * c) = c
        let c = Tensor::new(&[3.0f32, 4.0], &Device::Cpu).unwrap();
        let loss = a.as_tensor().mul(&c).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();

        let norm = compute_grad_norm(&grads, &[a.clone(), b.clone()]).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);
        assert!(check_gradients_health(&grads, &[a, b]));
    }

    #[test]
    fn test_health_detects_nan() {
        let a = Var::new(&[0.0f32], &Device::Cpu).unwrap();
        // d/da sqrt(a) at 0 is inf
        let loss = a.as_tensor().sqrt().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        assert!(!check_gradients_health(&grads, &[a]));
    }
}
