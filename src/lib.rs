//! # robust-gnn
//!
//! Differentiable robust neighborhood aggregation for graph neural networks.
//!
//! ## Overview
//!
//! A GCN layer normally aggregates neighbor embeddings with a weighted sum
//! (`A @ X`). A single adversarially inserted edge can drag that sum
//! arbitrarily far. This crate replaces the sum with robust location
//! estimators that still scale by the row's total weight, so they drop into
//! an existing layer unchanged:
//!
//! - **Medoid family**: hard medoid, top-k medoid, soft medoid, soft top-k medoid
//! - **Median family**: weighted dimension-wise median, soft median
//! - **Chunking**: row-blocked execution with recomputation checkpoints
//! - **Layers**: GCN normalisation and a robust GCN convolution
//!
//! Every variant is differentiable in both the adjacency weights and the
//! features (hard selections pass gradients straight through the selected
//! rows), and handles disconnected nodes without producing non-finite values.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use robust_gnn::prelude::*;
//!
//! let device = best_device();
//! let adj = SparseAdjacency::from_edges(&[(0, 1, 0.5), (1, 0, 0.5), (1, 1, 0.5)], (2, 2), &device)?;
//! let x = Tensor::randn(0f32, 1.0, (2, 16), &device)?;
//!
//! let mean: RobustMean = "soft_k_medoid".parse()?;
//! let params = AggregationParams { k: 32, temperature: 0.5, ..Default::default() };
//! let h = mean.aggregate(&adj.into(), &x, &params)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `metal`: Apple Metal GPU acceleration
//! - `cuda`: NVIDIA CUDA GPU acceleration

pub mod adjacency;
pub mod aggregation;
pub mod chunking;
pub mod config;
pub mod gradients;
pub mod layers;
pub mod primitives;

// Re-export candle types for convenience
pub use candle_core::{DType, Device, Tensor, Var};

/// Error types for robust aggregation
#[derive(Debug, thiserror::Error)]
pub enum RobustGnnError {
    #[error("Tensor operation failed: {0}")]
    Tensor(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Memory budget exceeded: {0}")]
    MemoryBudget(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Result type alias for robust aggregation operations
pub type Result<T> = std::result::Result<T, RobustGnnError>;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{DType, Device, Tensor, Var};
    pub use crate::{Result, RobustGnnError};

    // Primitives
    pub use crate::primitives::{
        // Device selection
        accelerated_backend_available, best_device, cpu_device, cuda_available,
        gpu_available, gpu_disabled, metal_available,
        // Distances and selection
        distance_matrix, partial_distance_matrix, sparse_top_k, TopK, TopKBackend, NO_INDEX,
        // Softmax helpers
        masked_neg_softmax, scatter_softmax, softmax,
    };

    // Graph structure
    pub use crate::adjacency::{Adjacency, SparseAdjacency};

    // Aggregation
    pub use crate::aggregation::{
        soft_median, soft_weighted_medoid, soft_weighted_medoid_k_neighborhood,
        weighted_dimwise_median, weighted_medoid, weighted_medoid_k_neighborhood,
        AggregationParams, ExecutionPath, RobustMean,
    };

    // Chunking
    pub use crate::chunking::{chunked_message_and_aggregate, Chunker};

    // Layers
    pub use crate::layers::{gcn_normalize, normalize_dense_adjacency, RobustGcnConv};

    // Diagnostics
    pub use crate::gradients::{check_gradients_health, compute_grad_norm, tensor_is_finite};

    // Config
    pub use crate::config::AggregationConfig;
}
