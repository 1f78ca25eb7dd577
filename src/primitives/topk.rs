//! Per-row top-k selection over sparse weighted adjacency
//!
//! Two interchangeable backends:
//!
//! | Backend | How | When |
//! |---|---|---|
//! | [`TopKBackend::Reference`] | host bucket-by-row, stable sort by `(-weight, col)`, rows in parallel | CPU tensors |
//! | [`TopKBackend::Accelerated`] | scatter rows into a padded `[m, max_degree]` tensor, batched device `arg_sort` | GPU tensors |
//!
//! Both return the `min(k, degree)` heaviest entries of every row, heaviest
//! first, ties broken by ascending column index. Unused slots carry weight 0
//! and index [`NO_INDEX`]. On the CPU the two backends are bit-identical.

use super::tensor_ops::{index_tensor, is_accelerated, position_tensor};
use crate::adjacency::SparseAdjacency;
use crate::{Result, RobustGnnError};
use candle_core::{DType, Device, Tensor};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Index of an unused top-k slot.
pub const NO_INDEX: i64 = -1;

/// Widest padded row handed to the device sort; wider rows use the reference path.
pub const ACCELERATED_MAX_ROW_WIDTH: usize = 1024;

/// Top-k implementation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopKBackend {
    /// Accelerated for GPU-resident input when the backend is detected, reference otherwise
    #[default]
    Auto,
    Accelerated,
    Reference,
}

impl TopKBackend {
    /// Resolve `Auto` for tensors living on `device`.
    pub fn resolve(self, device: &Device) -> TopKBackend {
        match self {
            TopKBackend::Auto if is_accelerated(device) => TopKBackend::Accelerated,
            TopKBackend::Auto => TopKBackend::Reference,
            other => other,
        }
    }
}

/// Padded top-k selection: `[m, k]` values and `[m, k]` column indices.
#[derive(Debug, Clone)]
pub struct TopK {
    /// Selected weights, differentiable w.r.t. the adjacency weights
    pub values: Tensor,
    /// Selected columns (`i64`), [`NO_INDEX`] for unused slots
    pub indices: Tensor,
    host_indices: Vec<i64>,
    k: usize,
}

impl TopK {
    fn new(values: Tensor, indices: Tensor, k: usize) -> Result<Self> {
        let host_indices = indices
            .flatten_all()
            .and_then(|t| t.to_vec1::<i64>())
            .map_err(|e| RobustGnnError::Tensor(format!("top-k index readback failed: {}", e)))?;
        Ok(Self {
            values,
            indices,
            host_indices,
            k,
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn n_rows(&self) -> usize {
        if self.k == 0 {
            0
        } else {
            self.host_indices.len() / self.k
        }
    }

    /// Row-major host copy of [`TopK::indices`].
    pub fn host_indices(&self) -> &[i64] {
        &self.host_indices
    }

    /// `f32` `[m, k]` mask, 1 for used slots.
    pub fn valid_mask(&self) -> Result<Tensor> {
        let mask: Vec<f32> = self
            .host_indices
            .iter()
            .map(|&i| if i == NO_INDEX { 0.0 } else { 1.0 })
            .collect();
        Tensor::from_vec(mask, (self.n_rows(), self.k), self.values.device())
            .map_err(|e| RobustGnnError::Tensor(format!("valid mask upload failed: {}", e)))
    }

    /// Flattened `[m * k]` `u32` indices with unused slots pointing at node 0.
    ///
    /// Only for gathers whose result is masked afterwards.
    pub fn gather_indices(&self) -> Result<Tensor> {
        let idx: Vec<u32> = self
            .host_indices
            .iter()
            .map(|&i| if i == NO_INDEX { 0 } else { i as u32 })
            .collect();
        index_tensor(&idx, self.values.device())
    }

    /// The selected entries as an edge list over `n_cols` columns.
    pub fn to_sparse(&self, n_cols: usize) -> Result<SparseAdjacency> {
        let mut rows = Vec::new();
        let mut cols = Vec::new();
        let mut slots = Vec::new();
        for (slot, &c) in self.host_indices.iter().enumerate() {
            if c != NO_INDEX {
                rows.push((slot / self.k) as u32);
                cols.push(c as u32);
                slots.push(slot as i64);
            }
        }
        let device = self.values.device();
        let weight = if slots.is_empty() {
            Tensor::zeros(0, DType::F32, device)
        } else {
            let slots = position_tensor(&slots, device)?;
            self.values.flatten_all().and_then(|v| v.index_select(&slots, 0))
        };
        let weight = weight
            .map_err(|e| RobustGnnError::Tensor(format!("top-k sparse gather failed: {}", e)))?;
        SparseAdjacency::new(rows, cols, weight, (self.n_rows(), n_cols))
    }
}

/// Select the `k` heaviest entries of every row of `adj`.
pub fn sparse_top_k(adj: &SparseAdjacency, k: usize, backend: TopKBackend) -> Result<TopK> {
    if k == 0 {
        return Err(RobustGnnError::Config("top-k requires k >= 1".into()));
    }
    let backend = backend.resolve(adj.device());
    debug!(?backend, k, nnz = adj.nnz(), "sparse top-k");
    match backend {
        TopKBackend::Accelerated => {
            let layout = RowLayout::build(adj);
            if !adj.device().is_cpu() && layout.width > ACCELERATED_MAX_ROW_WIDTH {
                warn!(
                    width = layout.width,
                    "row wider than device sort limit, using reference top-k"
                );
                return reference_top_k(adj, k);
            }
            accelerated_top_k(adj, &layout, k)
        }
        _ => reference_top_k(adj, k),
    }
}

/// Top-k of a dense `[m, n]` matrix: `([m, k]` values, `[m, k]` `u32` columns`)`.
///
/// Columns are ordered heaviest first, ties by ascending column. Rows with
/// fewer than `k` nonzeros are filled with zero-weight columns; callers mask
/// those by value.
pub fn dense_top_k(a: &Tensor, k: usize) -> Result<(Tensor, Tensor)> {
    let order = a
        .detach()
        .contiguous()
        .and_then(|t| t.arg_sort_last_dim(false))
        .and_then(|o| o.narrow(1, 0, k))
        .and_then(|o| o.contiguous())
        .map_err(|e| RobustGnnError::Tensor(format!("dense top-k sort failed: {}", e)))?;
    let values = a
        .gather(&order, 1)
        .map_err(|e| RobustGnnError::Tensor(format!("dense top-k gather failed: {}", e)))?;
    Ok((values, order))
}

// ============================================================================
// Row layout shared by the padded (accelerated) kernels
// ============================================================================

/// Every row of a sparse matrix laid out in a `[m, width]` grid.
///
/// Within a row the entries are ordered by column, so a stable sort over a
/// padded row breaks ties by column index.
#[derive(Debug, Clone)]
pub(crate) struct RowLayout {
    /// Max degree, at least 1
    pub width: usize,
    /// Grid position (`row * width + slot`) of every edge
    pub edge_slot: Vec<i64>,
    /// Column stored in each grid cell (0 for padding)
    pub slot_col: Vec<u32>,
    /// 1 where the grid cell holds an edge
    pub slot_valid: Vec<u8>,
}

impl RowLayout {
    pub fn build(adj: &SparseAdjacency) -> Self {
        let m = adj.n_rows();
        let rows = adj.rows();
        let cols = adj.cols();

        let width = adj.out_degrees().into_iter().max().unwrap_or(0).max(1);

        let mut order: Vec<usize> = (0..adj.nnz()).collect();
        order.sort_by_key(|&e| (rows[e], cols[e]));

        let mut fill = vec![0usize; m];
        let mut edge_slot = vec![0i64; adj.nnz()];
        let mut slot_col = vec![0u32; m * width];
        let mut slot_valid = vec![0u8; m * width];
        for e in order {
            let r = rows[e] as usize;
            let cell = r * width + fill[r];
            fill[r] += 1;
            edge_slot[e] = cell as i64;
            slot_col[cell] = cols[e];
            slot_valid[cell] = 1;
        }

        Self {
            width,
            edge_slot,
            slot_col,
            slot_valid,
        }
    }

    /// Edge weights scattered into the `[m, width]` grid (differentiable).
    pub fn scatter(&self, adj: &SparseAdjacency, values: &Tensor) -> Result<Tensor> {
        let m = adj.n_rows();
        let zeros = Tensor::zeros(m * self.width, DType::F32, adj.device())
            .map_err(|e| RobustGnnError::Tensor(format!("row layout zeros failed: {}", e)))?;
        let grid = if adj.nnz() == 0 {
            zeros
        } else {
            let slots = position_tensor(&self.edge_slot, adj.device())?;
            zeros
                .index_add(&slots, values, 0)
                .map_err(|e| RobustGnnError::Tensor(format!("row layout scatter failed: {}", e)))?
        };
        grid.reshape((m, self.width))
            .map_err(|e| RobustGnnError::Tensor(format!("row layout reshape failed: {}", e)))
    }

    pub fn valid(&self, m: usize, device: &Device) -> Result<Tensor> {
        Tensor::from_slice(&self.slot_valid, (m, self.width), device)
            .map_err(|e| RobustGnnError::Tensor(format!("row layout mask upload failed: {}", e)))
    }

    pub fn columns(&self, m: usize, device: &Device) -> Result<Tensor> {
        Tensor::from_slice(&self.slot_col, (m, self.width), device)
            .map_err(|e| RobustGnnError::Tensor(format!("row layout column upload failed: {}", e)))
    }
}

// ============================================================================
// Backends
// ============================================================================

fn reference_top_k(adj: &SparseAdjacency, k: usize) -> Result<TopK> {
    let m = adj.n_rows();
    let device = adj.device();
    let cols = adj.cols();
    let weights = adj
        .weight()
        .detach()
        .to_vec1::<f32>()
        .map_err(|e| RobustGnnError::Tensor(format!("top-k weight readback failed: {}", e)))?;

    let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); m];
    for (e, &r) in adj.rows().iter().enumerate() {
        buckets[r as usize].push(e);
    }
    buckets.par_iter_mut().for_each(|bucket| {
        bucket.sort_by(|&a, &b| {
            weights[b]
                .partial_cmp(&weights[a])
                .unwrap_or(Ordering::Equal)
                .then(cols[a].cmp(&cols[b]))
        });
        bucket.truncate(k);
    });

    let mut host_indices = vec![NO_INDEX; m * k];
    let mut slots = Vec::new();
    let mut edges = Vec::new();
    for (row, bucket) in buckets.iter().enumerate() {
        for (s, &e) in bucket.iter().enumerate() {
            host_indices[row * k + s] = cols[e] as i64;
            slots.push((row * k + s) as i64);
            edges.push(e as i64);
        }
    }

    let zeros = Tensor::zeros(m * k, DType::F32, device)
        .map_err(|e| RobustGnnError::Tensor(format!("top-k zeros failed: {}", e)))?;
    let values = if edges.is_empty() {
        zeros
    } else {
        let picked = adj
            .weight()
            .index_select(&position_tensor(&edges, device)?, 0)
            .map_err(|e| RobustGnnError::Tensor(format!("top-k weight gather failed: {}", e)))?;
        zeros
            .index_add(&position_tensor(&slots, device)?, &picked, 0)
            .map_err(|e| RobustGnnError::Tensor(format!("top-k scatter failed: {}", e)))?
    };
    let values = values
        .reshape((m, k))
        .map_err(|e| RobustGnnError::Tensor(format!("top-k reshape failed: {}", e)))?;
    let indices = Tensor::from_vec(host_indices, (m, k), device)
        .map_err(|e| RobustGnnError::Tensor(format!("top-k index upload failed: {}", e)))?;

    TopK::new(values, indices, k)
}

fn accelerated_top_k(adj: &SparseAdjacency, layout: &RowLayout, k: usize) -> Result<TopK> {
    let m = adj.n_rows();
    let device = adj.device();
    let width = layout.width;
    let kk = k.min(width);

    let grid = layout.scatter(adj, adj.weight())?;
    let valid = layout.valid(m, device)?;
    let columns = layout
        .columns(m, device)?
        .to_dtype(DType::I64)
        .map_err(|e| RobustGnnError::Tensor(format!("top-k column cast failed: {}", e)))?;

    let floor = Tensor::full(f32::NEG_INFINITY, (m, width), device)
        .map_err(|e| RobustGnnError::Tensor(format!("top-k key fill failed: {}", e)))?;
    let order = valid
        .where_cond(&grid.detach(), &floor)
        .and_then(|keys| keys.arg_sort_last_dim(false))
        .and_then(|o| o.narrow(1, 0, kk))
        .and_then(|o| o.contiguous())
        .map_err(|e| RobustGnnError::Tensor(format!("top-k device sort failed: {}", e)))?;

    let values = grid
        .gather(&order, 1)
        .map_err(|e| RobustGnnError::Tensor(format!("top-k value gather failed: {}", e)))?;
    let sentinel = Tensor::full(NO_INDEX, (m, kk), device)
        .map_err(|e| RobustGnnError::Tensor(format!("top-k sentinel fill failed: {}", e)))?;
    let indices = valid
        .gather(&order, 1)
        .and_then(|v| v.where_cond(&columns.gather(&order, 1)?, &sentinel))
        .map_err(|e| RobustGnnError::Tensor(format!("top-k index gather failed: {}", e)))?;

    let (values, indices) = if kk < k {
        let pad_values = Tensor::zeros((m, k - kk), DType::F32, device)
            .map_err(|e| RobustGnnError::Tensor(format!("top-k pad failed: {}", e)))?;
        let pad_indices = Tensor::full(NO_INDEX, (m, k - kk), device)
            .map_err(|e| RobustGnnError::Tensor(format!("top-k pad failed: {}", e)))?;
        (
            Tensor::cat(&[&values, &pad_values], 1)
                .map_err(|e| RobustGnnError::Tensor(format!("top-k pad cat failed: {}", e)))?,
            Tensor::cat(&[&indices, &pad_indices], 1)
                .map_err(|e| RobustGnnError::Tensor(format!("top-k pad cat failed: {}", e)))?,
        )
    } else {
        (values, indices)
    };

    TopK::new(values, indices, k)
}
