//! Core Tensor Operations
//!
//! Device selection, accelerated-backend capability detection, and the small
//! numerically safe helpers every aggregation shares.
//!
//! ## Forcing CPU
//!
//! ```bash
//! export RGNN_NO_GPU=1
//! ```
//!
//! With the variable set, [`best_device`] returns the CPU and
//! [`accelerated_backend_available`] reports `false`, so every aggregation
//! takes the portable reference paths.

use crate::{Result, RobustGnnError};
use candle_core::{DType, Device, Tensor};
use std::sync::OnceLock;
use tracing::{debug, info};

/// Multiple of `f32::EPSILON` added under every square root.
///
/// Keeps `sqrt` away from zero so that both the value and its gradient stay
/// finite for coincident points.
pub const SAFE_SQRT_EPS_FACTOR: f64 = 1e2;

// ============================================================================
// Environment-controlled Device Selection
// ============================================================================

/// Check if GPU is disabled via environment variable.
///
/// Set `RGNN_NO_GPU=1` to force CPU-only mode.
pub fn gpu_disabled() -> bool {
    std::env::var("RGNN_NO_GPU")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
}

/// Get the best available device for tensor operations
///
/// Priority:
/// 1. Check `RGNN_NO_GPU` env var (forces CPU if set)
/// 2. Metal (Apple Silicon)
/// 3. CUDA (NVIDIA GPUs)
/// 4. CPU (fallback)
pub fn best_device() -> Device {
    if gpu_disabled() {
        info!("💻 Using CPU device (RGNN_NO_GPU set)");
        return Device::Cpu;
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            info!("🍎 Using Metal device (Apple Silicon)");
            return device;
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            info!("🟢 Using CUDA device (NVIDIA GPU)");
            return device;
        }
    }

    info!("💻 Using CPU device");
    Device::Cpu
}

/// Force CPU device, ignoring GPU availability.
pub fn cpu_device() -> Device {
    Device::Cpu
}

// ============================================================================
// Device Availability Checks
// ============================================================================

/// Check if Metal is available (respects RGNN_NO_GPU)
#[cfg(feature = "metal")]
pub fn metal_available() -> bool {
    !gpu_disabled() && Device::new_metal(0).is_ok()
}

/// Check if Metal is available (always false when `metal` feature is not enabled)
#[cfg(not(feature = "metal"))]
pub fn metal_available() -> bool {
    false
}

/// Check if CUDA is available (respects RGNN_NO_GPU)
#[cfg(feature = "cuda")]
pub fn cuda_available() -> bool {
    !gpu_disabled() && Device::new_cuda(0).is_ok()
}

/// Check if CUDA is available (always false when `cuda` feature is not enabled)
#[cfg(not(feature = "cuda"))]
pub fn cuda_available() -> bool {
    false
}

/// Check if any GPU is available and enabled
pub fn gpu_available() -> bool {
    !gpu_disabled() && (metal_available() || cuda_available())
}

static ACCELERATED_BACKEND: OnceLock<bool> = OnceLock::new();

/// Whether the accelerated top-k / median kernels can be used.
///
/// Detected once per process and cached; later calls never touch the driver.
pub fn accelerated_backend_available() -> bool {
    *ACCELERATED_BACKEND.get_or_init(|| {
        let available = gpu_available();
        debug!(available, "accelerated backend detection");
        available
    })
}

/// True when `device` is a GPU and the accelerated backend is enabled.
pub fn is_accelerated(device: &Device) -> bool {
    !device.is_cpu() && accelerated_backend_available()
}

/// Block until all queued work on `device` has finished.
pub fn synchronize(device: &Device) -> Result<()> {
    device
        .synchronize()
        .map_err(|e| RobustGnnError::Tensor(format!("device synchronize failed: {}", e)))
}

// ============================================================================
// Numeric helpers
// ============================================================================

/// `sqrt(|t| + 1e2 * f32::EPSILON)`
///
/// The absolute value absorbs negative squared distances produced by
/// floating-point cancellation.
pub fn safe_sqrt(squared: &Tensor) -> Result<Tensor> {
    let eps = SAFE_SQRT_EPS_FACTOR * f32::EPSILON as f64;
    squared
        .abs()
        .and_then(|t| t.affine(1.0, eps))
        .and_then(|t| t.sqrt())
        .map_err(|e| RobustGnnError::Tensor(format!("safe sqrt failed: {}", e)))
}

/// `u8` mask that is 1 where `t` is finite (neither NaN nor ±inf).
pub fn finite_mask(t: &Tensor) -> Result<Tensor> {
    t.abs()
        .and_then(|a| a.le(f32::MAX))
        .map_err(|e| RobustGnnError::Tensor(format!("finite mask failed: {}", e)))
}

/// Replace NaN and ±inf entries with `value`, keeping the gradient of finite entries.
pub fn replace_non_finite(t: &Tensor, value: f32) -> Result<Tensor> {
    let fill = Tensor::full(value, t.shape(), t.device())
        .map_err(|e| RobustGnnError::Tensor(format!("full failed: {}", e)))?;
    finite_mask(t)?
        .where_cond(t, &fill)
        .map_err(|e| RobustGnnError::Tensor(format!("replace non-finite failed: {}", e)))
}

/// Overwrite entries where `mask != 0` with `value`.
pub fn masked_fill(t: &Tensor, mask: &Tensor, value: f32) -> Result<Tensor> {
    let fill = Tensor::full(value, t.shape(), t.device())
        .map_err(|e| RobustGnnError::Tensor(format!("full failed: {}", e)))?;
    mask.where_cond(&fill, t)
        .map_err(|e| RobustGnnError::Tensor(format!("masked fill failed: {}", e)))
}

/// Upload a host index vector as a 1-D `u32` tensor.
pub fn index_tensor(indices: &[u32], device: &Device) -> Result<Tensor> {
    Tensor::from_slice(indices, indices.len(), device)
        .map_err(|e| RobustGnnError::Tensor(format!("index upload failed: {}", e)))
}

/// Upload flattened buffer positions as a 1-D `i64` tensor.
///
/// Positions into `[m, n]` or `[m, k, k]` buffers pass `u32::MAX` long before
/// node ids do.
pub fn position_tensor(positions: &[i64], device: &Device) -> Result<Tensor> {
    Tensor::from_slice(positions, positions.len(), device)
        .map_err(|e| RobustGnnError::Tensor(format!("position upload failed: {}", e)))
}

/// Cast to `f32`, a no-op when the tensor already is.
pub fn to_f32(t: &Tensor) -> Result<Tensor> {
    if t.dtype() == DType::F32 {
        Ok(t.clone())
    } else {
        t.to_dtype(DType::F32)
            .map_err(|e| RobustGnnError::Tensor(format!("cast to f32 failed: {}", e)))
    }
}

/// Fail with [`RobustGnnError::MemoryBudget`] when a dense intermediate would be too large.
pub fn check_dense_budget(elements: usize, budget: usize, what: &str) -> Result<()> {
    if elements > budget {
        return Err(RobustGnnError::MemoryBudget(format!(
            "{} needs {} elements, budget is {}",
            what, elements, budget
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::Cpu
    }

    #[test]
    fn test_best_device() {
        let device = best_device();
        assert!(matches!(
            device,
            Device::Cpu | Device::Metal(_) | Device::Cuda(_)
        ));
    }

    #[test]
    fn test_cpu_device() {
        assert!(matches!(cpu_device(), Device::Cpu));
    }

    #[test]
    fn test_capability_detection_is_stable() {
        let first = accelerated_backend_available();
        let second = accelerated_backend_available();
        assert_eq!(first, second);
        // CPU tensors never take the accelerated path
        assert!(!is_accelerated(&device()));
    }

    #[test]
    fn test_safe_sqrt_handles_negative_and_zero() {
        let t = Tensor::new(&[-1e-7f32, 0.0, 4.0], &device()).unwrap();
        let out = safe_sqrt(&t).unwrap().to_vec1::<f32>().unwrap();
        assert!(out.iter().all(|v| v.is_finite() && *v > 0.0));
        assert!((out[2] - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_replace_non_finite() {
        let t = Tensor::new(&[1.0f32, f32::INFINITY, f32::NAN, f32::NEG_INFINITY], &device())
            .unwrap();
        let out = replace_non_finite(&t, f32::MAX).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(out, vec![1.0, f32::MAX, f32::MAX, f32::MAX]);
    }

    #[test]
    fn test_masked_fill() {
        let t = Tensor::new(&[1.0f32, 2.0, 3.0], &device()).unwrap();
        let mask = Tensor::new(&[0u8, 1, 0], &device()).unwrap();
        let out = masked_fill(&t, &mask, -5.0).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(out, vec![1.0, -5.0, 3.0]);
    }

    #[test]
    fn test_position_tensor_scatters_as_i64() {
        let positions = position_tensor(&[2, 0, 2], &device()).unwrap();
        assert_eq!(positions.dtype(), DType::I64);
        let src = Tensor::new(&[1.0f32, 2.0, 3.0], &device()).unwrap();
        let out = Tensor::zeros(4, DType::F32, &device())
            .unwrap()
            .index_add(&positions, &src, 0)
            .unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![2.0, 0.0, 4.0, 0.0]);
    }

    #[test]
    fn test_dense_budget() {
        assert!(check_dense_budget(10, 10, "l2").is_ok());
        let err = check_dense_budget(11, 10, "l2").unwrap_err();
        assert!(matches!(err, RobustGnnError::MemoryBudget(_)));
    }
}
