//! Row-chunked execution with optional gradient checkpointing
//!
//! Large aggregations are split into contiguous row blocks
//! `[lower, upper)` of size `ceil(n / n_chunks)` (the last block takes the
//! remainder). Each block is computed independently and the results are
//! concatenated in row order.
//!
//! With `requires_grad`, each block runs under [`checkpoint`]: the forward
//! pass keeps only the block output and the backward pass recomputes the
//! block from its inputs before differentiating it. The numbers are the same
//! as without checkpointing; only peak memory and runtime change.
//!
//! ## Example
//!
//! ```ignore
//! use robust_gnn::chunking::chunked_message_and_aggregate;
//!
//! // A @ x in four row blocks, edge weights trainable
//! let out = chunked_message_and_aggregate(&adj, &x, 4, true, None)?;
//! ```

use crate::adjacency::{Adjacency, SparseAdjacency};
use crate::aggregation::{AggregationParams, RobustMean};
use crate::primitives::synchronize;
use crate::{Result, RobustGnnError};
use candle_core::backend::BackendStorage;
use candle_core::{CpuStorage, CustomOp3, Layout, Shape, Tensor, Var};
use std::sync::Arc;
use tracing::debug;

/// A row block: `(first input, second input) -> block output`.
pub type BlockFn = Arc<dyn Fn(&Tensor, &Tensor) -> Result<Tensor> + Send + Sync>;

/// An aggregation over an adjacency (block) and the full feature matrix.
pub type AggregationFn = Arc<dyn Fn(&Adjacency, &Tensor) -> Result<Tensor> + Send + Sync>;

/// Wrap a robust mean as an [`AggregationFn`].
pub fn robust_aggregation_fn(mean: RobustMean, params: AggregationParams) -> AggregationFn {
    Arc::new(move |adj: &Adjacency, x: &Tensor| mean.aggregate(adj, x, &params))
}

// =============================================================================
// Chunker
// =============================================================================

/// Splits `0..n` into row blocks and runs a block function over each.
#[derive(Debug, Clone)]
pub struct Chunker {
    n: usize,
    requires_grad: bool,
    do_synchronize: bool,
    ranges: Vec<(usize, usize)>,
}

impl Chunker {
    /// `do_synchronize` waits for the device after every block (for timing only).
    pub fn new(
        n: usize,
        n_chunks: usize,
        requires_grad: bool,
        do_synchronize: bool,
    ) -> Result<Self> {
        if n_chunks == 0 {
            return Err(RobustGnnError::Config("n_chunks must be at least 1".into()));
        }
        let size = n.div_ceil(n_chunks).max(1);
        let mut ranges: Vec<(usize, usize)> = (0..n_chunks)
            .map(|chunk| {
                let lower = (chunk * size).min(n);
                let upper = if chunk + 1 == n_chunks { n } else { ((chunk + 1) * size).min(n) };
                (lower, upper)
            })
            .filter(|(lower, upper)| lower < upper)
            .collect();
        if ranges.is_empty() {
            ranges.push((0, n));
        }
        Ok(Self {
            n,
            requires_grad,
            do_synchronize,
            ranges,
        })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Non-empty `(lower, upper)` blocks in order.
    pub fn ranges(&self) -> &[(usize, usize)] {
        &self.ranges
    }

    /// Run `get_run(lower, upper)` on `(a, b)` for every block and concatenate along rows.
    pub fn chunk<G>(&self, get_run: G, a: &Tensor, b: &Tensor) -> Result<Tensor>
    where
        G: Fn(usize, usize) -> BlockFn,
    {
        let mut blocks = Vec::with_capacity(self.ranges.len());
        for &(lower, upper) in &self.ranges {
            let run = get_run(lower, upper);
            let block = if self.requires_grad {
                checkpoint(run, a, b)?
            } else {
                run(a, b)?
            };
            if self.do_synchronize {
                synchronize(a.device())?;
            }
            blocks.push(block);
        }
        debug!(blocks = blocks.len(), n = self.n, checkpointed = self.requires_grad, "chunked run");
        Tensor::cat(&blocks, 0)
            .map_err(|e| RobustGnnError::Tensor(format!("chunk concat failed: {}", e)))
    }
}

// =============================================================================
// Checkpointing
// =============================================================================

/// Run `run(a, b)` without recording its graph; backward recomputes it.
///
/// The returned tensor has the value of `run(a, b)` and the gradients of
/// `run` w.r.t. `a` and `b`.
pub fn checkpoint(run: BlockFn, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let out = run(&a.detach(), &b.detach())?;
    // Fresh contiguous storage so the op can hand it through unchanged
    let out = out
        .detach()
        .affine(1.0, 0.0)
        .map_err(|e| RobustGnnError::Tensor(format!("checkpoint output copy failed: {}", e)))?;
    out.apply_op3(a, b, Checkpoint { run })
        .map_err(|e| RobustGnnError::Tensor(format!("checkpoint attach failed: {}", e)))
}

/// Identity on its first argument; the gradient w.r.t. the other two comes
/// from recomputing `run`.
struct Checkpoint {
    run: BlockFn,
}

impl CustomOp3 for Checkpoint {
    fn name(&self) -> &'static str {
        "checkpoint"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        _: &CpuStorage,
        _: &Layout,
        _: &CpuStorage,
        _: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        Ok((s1.try_clone(l1)?, l1.shape().clone()))
    }

    #[cfg(feature = "cuda")]
    fn cuda_fwd(
        &self,
        s1: &candle_core::CudaStorage,
        l1: &Layout,
        _: &candle_core::CudaStorage,
        _: &Layout,
        _: &candle_core::CudaStorage,
        _: &Layout,
    ) -> candle_core::Result<(candle_core::CudaStorage, Shape)> {
        Ok((s1.try_clone(l1)?, l1.shape().clone()))
    }

    #[cfg(feature = "metal")]
    fn metal_fwd(
        &self,
        s1: &candle_core::MetalStorage,
        l1: &Layout,
        _: &candle_core::MetalStorage,
        _: &Layout,
        _: &candle_core::MetalStorage,
        _: &Layout,
    ) -> candle_core::Result<(candle_core::MetalStorage, Shape)> {
        Ok((s1.try_clone(l1)?, l1.shape().clone()))
    }

    fn bwd(
        &self,
        _out: &Tensor,
        a: &Tensor,
        b: &Tensor,
        _res: &Tensor,
        grad_res: &Tensor,
    ) -> candle_core::Result<(Option<Tensor>, Option<Tensor>, Option<Tensor>)> {
        let a = Var::from_tensor(&a.detach())?;
        let b = Var::from_tensor(&b.detach())?;
        let recomputed =
            (self.run)(a.as_tensor(), b.as_tensor()).map_err(candle_core::Error::wrap)?;
        let grads = recomputed.mul(&grad_res.detach())?.sum_all()?.backward()?;
        Ok((
            None,
            grads.get(a.as_tensor()).cloned(),
            grads.get(b.as_tensor()).cloned(),
        ))
    }
}

// =============================================================================
// Chunked message passing
// =============================================================================

/// Row-chunked `aggregation(adj, x)`; the default aggregation is `adj @ x`.
///
/// Chunking only pays off when the backward pass would otherwise keep every
/// intermediate alive, so with `weights_require_grad == false` the aggregation
/// runs in one piece. Otherwise the rows are split into `n_chunks` checkpointed
/// blocks, each seeing its slice of the adjacency and the full `x`.
pub fn chunked_message_and_aggregate(
    adj: &SparseAdjacency,
    x: &Tensor,
    n_chunks: usize,
    weights_require_grad: bool,
    aggregation: Option<AggregationFn>,
) -> Result<Tensor> {
    let aggregation = aggregation.unwrap_or_else(weighted_sum);
    if !weights_require_grad {
        return aggregation(&Adjacency::Sparse(adj.clone()), x);
    }

    let chunker = Chunker::new(adj.n_rows(), n_chunks, true, false)?;
    let pattern = adj.clone();
    chunker.chunk(
        move |lower, upper| {
            let pattern = pattern.clone();
            let aggregation = aggregation.clone();
            Arc::new(move |weight: &Tensor, x: &Tensor| {
                let block = pattern.with_weight(weight.clone())?.row_block(lower, upper)?;
                aggregation(&Adjacency::Sparse(block), x)
            }) as BlockFn
        },
        adj.weight(),
        x,
    )
}

fn weighted_sum() -> AggregationFn {
    Arc::new(|adj: &Adjacency, x: &Tensor| match adj {
        Adjacency::Sparse(s) => s.matmul(x),
        Adjacency::Dense(a) => a
            .matmul(x)
            .map_err(|e| RobustGnnError::Tensor(format!("dense matmul failed: {}", e))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::ExecutionPath;
    use candle_core::{DType, Device};

    fn device() -> Device {
        Device::Cpu
    }

    fn graph() -> (SparseAdjacency, Tensor) {
        let edges = [
            (0, 1, 0.5),
            (0, 4, 0.2),
            (1, 0, 0.5),
            (1, 2, 0.7),
            (2, 1, 0.7),
            (2, 2, 0.1),
            (3, 4, 0.9),
            (4, 0, 0.2),
            (4, 3, 0.9),
            (4, 1, 0.3),
        ];
        let adj = SparseAdjacency::from_edges(&edges, (5, 5), &device()).unwrap();
        let x = Tensor::new(
            &[[0.3f32, -1.2], [1.5, 0.4], [-0.7, 0.9], [2.0, -0.3], [0.1, 0.15]],
            &device(),
        )
        .unwrap();
        (adj, x)
    }

    /// A loss whose gradient differs per output entry.
    fn loss(out: &Tensor) -> Tensor {
        let (m, d) = out.dims2().unwrap();
        let coef = Tensor::arange(0f32, (m * d) as f32, &device())
            .unwrap()
            .reshape((m, d))
            .unwrap();
        out.mul(&coef).unwrap().sum_all().unwrap()
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> f32 {
        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        a.iter().zip(&b).map(|(p, q)| (p - q).abs()).fold(0.0, f32::max)
    }

    #[test]
    fn test_ranges() {
        let chunker = Chunker::new(10, 3, false, false).unwrap();
        assert_eq!(chunker.ranges(), &[(0, 4), (4, 8), (8, 10)]);

        // Trailing chunks past n are dropped
        let chunker = Chunker::new(5, 4, false, false).unwrap();
        assert_eq!(chunker.ranges(), &[(0, 2), (2, 4), (4, 5)]);

        let chunker = Chunker::new(3, 8, false, false).unwrap();
        assert_eq!(chunker.ranges(), &[(0, 1), (1, 2), (2, 3)]);
    }

    #[test]
    fn test_zero_chunks_rejected() {
        assert!(matches!(Chunker::new(4, 0, false, false), Err(RobustGnnError::Config(_))));
    }

    #[test]
    fn test_checkpoint_matches_direct_forward_and_backward() {
        let run: BlockFn = Arc::new(|a: &Tensor, b: &Tensor| {
            a.matmul(b)
                .and_then(|t| t.tanh())
                .map_err(|e| RobustGnnError::Tensor(e.to_string()))
        });
        let a = Var::new(&[[0.5f32, -1.0], [2.0, 0.3]], &device()).unwrap();
        let b = Var::new(&[[1.0f32, 0.2], [-0.4, 0.8]], &device()).unwrap();

        let direct = run(a.as_tensor(), b.as_tensor()).unwrap();
        let checkpointed = checkpoint(run.clone(), a.as_tensor(), b.as_tensor()).unwrap();
        assert_eq!(
            direct.to_vec2::<f32>().unwrap(),
            checkpointed.to_vec2::<f32>().unwrap()
        );

        let g_direct = loss(&direct).backward().unwrap();
        let g_checkpointed = loss(&checkpointed).backward().unwrap();
        for var in [&a, &b] {
            let d = g_direct.get(var.as_tensor()).unwrap();
            let c = g_checkpointed.get(var.as_tensor()).unwrap();
            assert!(max_diff(d, c) < 1e-6);
        }
    }

    #[test]
    fn test_chunked_weighted_sum_matches_unchunked() {
        let (adj, x) = graph();
        let expected = adj.matmul(&x).unwrap();
        for n_chunks in [1, 2, 3, 5, 9] {
            for requires_grad in [false, true] {
                let out =
                    chunked_message_and_aggregate(&adj, &x, n_chunks, requires_grad, None).unwrap();
                assert!(max_diff(&out, &expected) < 1e-6, "n_chunks = {}", n_chunks);
            }
        }
    }

    #[test]
    fn test_chunked_gradients_match_unchunked() {
        let (adj, x) = graph();
        let weight = Var::from_tensor(adj.weight()).unwrap();
        let x = Var::from_tensor(&x).unwrap();
        let adj = adj.with_weight(weight.as_tensor().clone()).unwrap();

        let direct = loss(&adj.matmul(x.as_tensor()).unwrap()).backward().unwrap();
        let chunked = chunked_message_and_aggregate(&adj, x.as_tensor(), 3, true, None).unwrap();
        let chunked = loss(&chunked).backward().unwrap();

        for t in [weight.as_tensor(), x.as_tensor()] {
            assert!(max_diff(direct.get(t).unwrap(), chunked.get(t).unwrap()) < 1e-5);
        }
    }

    #[test]
    fn test_chunked_robust_aggregation_matches_unchunked() {
        let (adj, x) = graph();
        let weight = Var::from_tensor(adj.weight()).unwrap();
        let x = Var::from_tensor(&x).unwrap();
        let adj = adj.with_weight(weight.as_tensor().clone()).unwrap();

        let params = AggregationParams {
            k: 2,
            temperature: 0.5,
            execution: ExecutionPath::Sparse,
            ..Default::default()
        };
        for mean in [RobustMean::SoftKMedoid, RobustMean::SoftMedian, RobustMean::DimMedian] {
            let aggregation = robust_aggregation_fn(mean, params.clone());
            let direct = aggregation(&Adjacency::Sparse(adj.clone()), x.as_tensor()).unwrap();
            let chunked = chunked_message_and_aggregate(
                &adj,
                x.as_tensor(),
                2,
                true,
                Some(aggregation.clone()),
            )
            .unwrap();
            assert!(max_diff(&direct, &chunked) < 1e-5, "{}", mean);

            let g_direct = loss(&direct).backward().unwrap();
            let g_chunked = loss(&chunked).backward().unwrap();
            for t in [weight.as_tensor(), x.as_tensor()] {
                let diff = max_diff(g_direct.get(t).unwrap(), g_chunked.get(t).unwrap());
                assert!(diff < 1e-4, "{}", mean);
            }
        }
    }

    #[test]
    fn test_empty_input() {
        let adj = SparseAdjacency::from_edges(&[], (0, 0), &device()).unwrap();
        let x = Tensor::zeros((0, 3), DType::F32, &device()).unwrap();
        let out = chunked_message_and_aggregate(&adj, &x, 4, true, None).unwrap();
        assert_eq!(out.dims(), &[0, 3]);
    }
}
