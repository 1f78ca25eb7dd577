//! Aggregation Primitives
//!
//! Building blocks shared by every robust mean.
//!
//! ## Submodules
//!
//! - [`tensor_ops`]: device selection, capability detection, safe numerics
//! - [`activations`]: masked softmax and segment softmax
//! - [`distance`]: full and partial (top-k restricted) distance matrices
//! - [`topk`]: per-row top-k selection with reference and accelerated backends

mod activations;
mod distance;
mod tensor_ops;
mod topk;

// Re-export all primitives at module level
pub use activations::*;
pub use distance::*;
pub use tensor_ops::*;
pub use topk::*;
