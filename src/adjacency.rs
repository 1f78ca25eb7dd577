//! Weighted adjacency matrices
//!
//! Aggregations consume either a dense `[m, n]` matrix or a COO edge list. Row
//! `i` of the adjacency describes the incoming messages of output row `i`;
//! columns index rows of the feature matrix. Row blocks cut by the chunker are
//! rectangular (`m ≤ n`), everything else is square.
//!
//! The edge weights stay an ordinary candle tensor, so gradients flow back to
//! whatever produced them (a dense `Var` via [`SparseAdjacency::from_dense`],
//! a weight `Var` passed to [`SparseAdjacency::new`], or a normalisation step).

use crate::primitives::{index_tensor, position_tensor};
use crate::{Result, RobustGnnError};
use candle_core::{DType, Device, Tensor};

/// Sparse COO adjacency with differentiable edge weights.
#[derive(Debug, Clone)]
pub struct SparseAdjacency {
    rows: Vec<u32>,
    cols: Vec<u32>,
    row_index: Tensor,
    col_index: Tensor,
    weight: Tensor,
    shape: (usize, usize),
}

impl SparseAdjacency {
    /// Build from host indices and a `[nnz]` weight tensor.
    pub fn new(
        rows: Vec<u32>,
        cols: Vec<u32>,
        weight: Tensor,
        shape: (usize, usize),
    ) -> Result<Self> {
        let nnz = rows.len();
        if cols.len() != nnz {
            return Err(RobustGnnError::Shape(format!(
                "edge list has {} rows but {} cols",
                nnz,
                cols.len()
            )));
        }
        let weight = weight
            .flatten_all()
            .and_then(|w| w.to_dtype(DType::F32))
            .map_err(|e| RobustGnnError::Tensor(format!("edge weight cast failed: {}", e)))?;
        if weight.elem_count() != nnz {
            return Err(RobustGnnError::Shape(format!(
                "edge list has {} entries but {} weights",
                nnz,
                weight.elem_count()
            )));
        }
        if let Some(r) = rows.iter().find(|&&r| r as usize >= shape.0) {
            return Err(RobustGnnError::Shape(format!(
                "row index {} out of range for {} rows",
                r, shape.0
            )));
        }
        if let Some(c) = cols.iter().find(|&&c| c as usize >= shape.1) {
            return Err(RobustGnnError::Shape(format!(
                "col index {} out of range for {} cols",
                c, shape.1
            )));
        }

        let device = weight.device().clone();
        Ok(Self {
            row_index: index_tensor(&rows, &device)?,
            col_index: index_tensor(&cols, &device)?,
            rows,
            cols,
            weight,
            shape,
        })
    }

    /// Build from `(row, col, weight)` triples (weights are constants).
    pub fn from_edges(
        edges: &[(u32, u32, f32)],
        shape: (usize, usize),
        device: &Device,
    ) -> Result<Self> {
        let rows = edges.iter().map(|e| e.0).collect();
        let cols = edges.iter().map(|e| e.1).collect();
        let weights: Vec<f32> = edges.iter().map(|e| e.2).collect();
        let weight = Tensor::from_vec(weights, edges.len(), device)
            .map_err(|e| RobustGnnError::Tensor(format!("edge weight upload failed: {}", e)))?;
        Self::new(rows, cols, weight, shape)
    }

    /// Nonzero entries of a dense `[m, n]` matrix, in row-major order.
    ///
    /// The edge weights are gathered from `dense`, so gradients w.r.t. the
    /// sparse weights reach the dense tensor.
    pub fn from_dense(dense: &Tensor) -> Result<Self> {
        let (m, n) = dense
            .dims2()
            .map_err(|e| RobustGnnError::Shape(format!("dense adjacency must be 2-D: {}", e)))?;
        let dense = crate::primitives::to_f32(dense)?;
        let values = dense
            .detach()
            .flatten_all()
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| {
                RobustGnnError::Tensor(format!("dense adjacency readback failed: {}", e))
            })?;

        let mut rows = Vec::new();
        let mut cols = Vec::new();
        let mut flat = Vec::new();
        for (pos, v) in values.iter().enumerate() {
            if *v != 0.0 {
                rows.push((pos / n) as u32);
                cols.push((pos % n) as u32);
                flat.push(pos as i64);
            }
        }

        let weight = if flat.is_empty() {
            Tensor::zeros(0, DType::F32, dense.device())
        } else {
            let flat = position_tensor(&flat, dense.device())?;
            dense.flatten_all().and_then(|d| d.index_select(&flat, 0))
        };
        let weight = weight
            .map_err(|e| RobustGnnError::Tensor(format!("dense adjacency gather failed: {}", e)))?;

        Self::new(rows, cols, weight, (m, n))
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn n_rows(&self) -> usize {
        self.shape.0
    }

    pub fn n_cols(&self) -> usize {
        self.shape.1
    }

    pub fn nnz(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[u32] {
        &self.rows
    }

    pub fn cols(&self) -> &[u32] {
        &self.cols
    }

    /// Row indices as a device `u32` tensor.
    pub fn row_index(&self) -> &Tensor {
        &self.row_index
    }

    /// Column indices as a device `u32` tensor.
    pub fn col_index(&self) -> &Tensor {
        &self.col_index
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn device(&self) -> &Device {
        self.weight.device()
    }

    /// Same sparsity pattern with new weights.
    pub fn with_weight(&self, weight: Tensor) -> Result<Self> {
        let weight = weight
            .flatten_all()
            .and_then(|w| w.to_dtype(DType::F32))
            .map_err(|e| RobustGnnError::Tensor(format!("edge weight cast failed: {}", e)))?;
        if weight.elem_count() != self.nnz() {
            return Err(RobustGnnError::Shape(format!(
                "expected {} weights, got {}",
                self.nnz(),
                weight.elem_count()
            )));
        }
        Ok(Self {
            weight,
            ..self.clone()
        })
    }

    /// Number of stored entries per row.
    pub fn out_degrees(&self) -> Vec<usize> {
        let mut degrees = vec![0usize; self.n_rows()];
        for &r in &self.rows {
            degrees[r as usize] += 1;
        }
        degrees
    }

    /// Total weight per row, `[m]`.
    pub fn row_sum(&self) -> Result<Tensor> {
        let zeros = Tensor::zeros(self.n_rows(), DType::F32, self.device())
            .map_err(|e| RobustGnnError::Tensor(format!("row sum zeros failed: {}", e)))?;
        if self.nnz() == 0 {
            return Ok(zeros);
        }
        zeros
            .index_add(&self.row_index, &self.weight, 0)
            .map_err(|e| RobustGnnError::Tensor(format!("row sum failed: {}", e)))
    }

    /// Weighted-sum message passing, `A @ x` (`[m, d]`).
    pub fn matmul(&self, x: &Tensor) -> Result<Tensor> {
        let (n_x, d) = x
            .dims2()
            .map_err(|e| RobustGnnError::Shape(format!("features must be [n, d]: {}", e)))?;
        if n_x != self.n_cols() {
            return Err(RobustGnnError::Shape(format!(
                "adjacency has {} columns but features have {} rows",
                self.n_cols(),
                n_x
            )));
        }
        let zeros = Tensor::zeros((self.n_rows(), d), DType::F32, self.device())
            .map_err(|e| RobustGnnError::Tensor(format!("spmm zeros failed: {}", e)))?;
        if self.nnz() == 0 {
            return Ok(zeros);
        }
        let messages = x
            .index_select(&self.col_index, 0)
            .and_then(|xj| xj.broadcast_mul(&self.weight.unsqueeze(1)?))
            .map_err(|e| RobustGnnError::Tensor(format!("spmm messages failed: {}", e)))?;
        zeros
            .index_add(&self.row_index, &messages, 0)
            .map_err(|e| RobustGnnError::Tensor(format!("spmm scatter failed: {}", e)))
    }

    /// Dense `[m, n]` copy; duplicate entries are summed.
    pub fn to_dense(&self) -> Result<Tensor> {
        let (m, n) = self.shape;
        let zeros = Tensor::zeros(m * n, DType::F32, self.device())
            .map_err(|e| RobustGnnError::Tensor(format!("to_dense zeros failed: {}", e)))?;
        let dense = if self.nnz() == 0 {
            zeros
        } else {
            let flat: Vec<i64> = self
                .rows
                .iter()
                .zip(&self.cols)
                .map(|(&r, &c)| dense_position(r, c, n))
                .collect();
            zeros
                .index_add(&position_tensor(&flat, self.device())?, &self.weight, 0)
                .map_err(|e| RobustGnnError::Tensor(format!("to_dense scatter failed: {}", e)))?
        };
        dense
            .reshape((m, n))
            .map_err(|e| RobustGnnError::Tensor(format!("to_dense reshape failed: {}", e)))
    }

    /// Append a zero-weight entry `(i, 0)` for every row without entries.
    ///
    /// Sparse top-k drops empty rows entirely; the placeholder keeps each row
    /// represented so its masked softmax has a valid slot and its output is a
    /// finite zero vector.
    pub fn with_all_rows(&self) -> Result<Self> {
        let missing: Vec<u32> = self
            .out_degrees()
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i as u32)
            .collect();
        if missing.is_empty() || self.n_cols() == 0 {
            return Ok(self.clone());
        }

        let mut rows = self.rows.clone();
        let mut cols = self.cols.clone();
        rows.extend_from_slice(&missing);
        cols.extend(std::iter::repeat(0).take(missing.len()));

        let padding = Tensor::zeros(missing.len(), DType::F32, self.device())
            .map_err(|e| RobustGnnError::Tensor(format!("placeholder zeros failed: {}", e)))?;
        let weight = Tensor::cat(&[&self.weight, &padding], 0)
            .map_err(|e| RobustGnnError::Tensor(format!("placeholder cat failed: {}", e)))?;
        Self::new(rows, cols, weight, self.shape)
    }

    /// Rows `lower..upper` as a `[upper - lower, n]` adjacency.
    pub fn row_block(&self, lower: usize, upper: usize) -> Result<Self> {
        if lower > upper || upper > self.n_rows() {
            return Err(RobustGnnError::Shape(format!(
                "row block {}..{} out of range for {} rows",
                lower,
                upper,
                self.n_rows()
            )));
        }
        let positions: Vec<usize> = self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, &r)| (r as usize) >= lower && (r as usize) < upper)
            .map(|(p, _)| p)
            .collect();
        let rows = positions.iter().map(|&p| self.rows[p] - lower as u32).collect();
        let cols = positions.iter().map(|&p| self.cols[p]).collect();
        let weight = if positions.is_empty() {
            Tensor::zeros(0, DType::F32, self.device())
        } else {
            let positions: Vec<i64> = positions.iter().map(|&p| p as i64).collect();
            let positions = position_tensor(&positions, self.device())?;
            self.weight.index_select(&positions, 0)
        };
        let weight =
            weight.map_err(|e| RobustGnnError::Tensor(format!("row block gather failed: {}", e)))?;
        Self::new(rows, cols, weight, (upper - lower, self.n_cols()))
    }
}

/// Dense or sparse adjacency accepted by every aggregation.
#[derive(Debug, Clone)]
pub enum Adjacency {
    Dense(Tensor),
    Sparse(SparseAdjacency),
}

impl Adjacency {
    pub fn shape(&self) -> Result<(usize, usize)> {
        match self {
            Adjacency::Dense(t) => t
                .dims2()
                .map_err(|e| RobustGnnError::Shape(format!("dense adjacency must be 2-D: {}", e))),
            Adjacency::Sparse(s) => Ok(s.shape()),
        }
    }

    pub fn device(&self) -> &Device {
        match self {
            Adjacency::Dense(t) => t.device(),
            Adjacency::Sparse(s) => s.device(),
        }
    }

    pub fn to_dense(&self) -> Result<Tensor> {
        match self {
            Adjacency::Dense(t) => crate::primitives::to_f32(t),
            Adjacency::Sparse(s) => s.to_dense(),
        }
    }

    pub fn to_sparse(&self) -> Result<SparseAdjacency> {
        match self {
            Adjacency::Dense(t) => SparseAdjacency::from_dense(t),
            Adjacency::Sparse(s) => Ok(s.clone()),
        }
    }

    /// Total weight per row, `[m]`.
    pub fn row_sum(&self) -> Result<Tensor> {
        match self {
            Adjacency::Dense(t) => crate::primitives::to_f32(t)?
                .sum(1)
                .map_err(|e| RobustGnnError::Tensor(format!("row sum failed: {}", e))),
            Adjacency::Sparse(s) => s.row_sum(),
        }
    }
}

impl From<SparseAdjacency> for Adjacency {
    fn from(s: SparseAdjacency) -> Self {
        Adjacency::Sparse(s)
    }
}

impl From<Tensor> for Adjacency {
    fn from(t: Tensor) -> Self {
        Adjacency::Dense(t)
    }
}

/// Offset of entry `(row, col)` in a row-major buffer with `n_cols` columns.
fn dense_position(row: u32, col: u32, n_cols: usize) -> i64 {
    row as i64 * n_cols as i64 + col as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;

    fn device() -> Device {
        Device::Cpu
    }

    fn dense() -> Tensor {
        Tensor::new(
            &[[0.5f32, 0.3, 0.0], [0.0, 0.0, 0.0], [0.0, 0.2, 0.9]],
            &device(),
        )
        .unwrap()
    }

    #[test]
    fn test_from_dense_roundtrip() {
        let a = dense();
        let s = SparseAdjacency::from_dense(&a).unwrap();
        assert_eq!(s.nnz(), 4);
        assert_eq!(s.rows(), &[0, 0, 2, 2]);
        assert_eq!(s.cols(), &[0, 1, 1, 2]);
        let back = s.to_dense().unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(back, a.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_dense_position_past_u32() {
        // 70k x 70k exceeds 2^32 entries
        let last = dense_position(69_999, 69_999, 70_000);
        assert_eq!(last, 70_000i64 * 70_000 - 1);
        assert!(last > u32::MAX as i64);
        assert_eq!(dense_position(2, 1, 3), 7);
    }

    #[test]
    fn test_row_sum() {
        let s = SparseAdjacency::from_dense(&dense()).unwrap();
        let rs = s.row_sum().unwrap().to_vec1::<f32>().unwrap();
        assert!((rs[0] - 0.8).abs() < 1e-6);
        assert_eq!(rs[1], 0.0);
        assert!((rs[2] - 1.1).abs() < 1e-6);
    }

    #[test]
    fn test_with_all_rows_adds_placeholder() {
        let s = SparseAdjacency::from_dense(&dense()).unwrap().with_all_rows().unwrap();
        assert_eq!(s.nnz(), 5);
        assert_eq!(s.out_degrees(), vec![2, 1, 2]);
        // Placeholder carries no weight
        let rs = s.row_sum().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(rs[1], 0.0);
    }

    #[test]
    fn test_row_block_shifts_rows() {
        let s = SparseAdjacency::from_dense(&dense()).unwrap();
        let block = s.row_block(1, 3).unwrap();
        assert_eq!(block.shape(), (2, 3));
        assert_eq!(block.rows(), &[1, 1]);
        let d = block.to_dense().unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(d[1], vec![0.0, 0.2, 0.9]);
        assert!(s.row_block(2, 5).is_err());
    }

    #[test]
    fn test_new_validates_indices() {
        let w = Tensor::new(&[1.0f32], &device()).unwrap();
        assert!(SparseAdjacency::new(vec![3], vec![0], w.clone(), (3, 3)).is_err());
        assert!(SparseAdjacency::new(vec![0], vec![0, 1], w, (3, 3)).is_err());
    }

    #[test]
    fn test_gradient_reaches_dense_source() {
        let a = Var::from_tensor(&dense()).unwrap();
        let s = SparseAdjacency::from_dense(a.as_tensor()).unwrap();
        let loss = s.row_sum().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let g = grads.get(a.as_tensor()).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(g[0], vec![1.0, 1.0, 0.0]);
        assert_eq!(g[1], vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_matmul_matches_dense() {
        let adj = SparseAdjacency::from_dense(&dense()).unwrap();
        let x = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]], &device()).unwrap();
        let sparse = adj.matmul(&x).unwrap().to_vec2::<f32>().unwrap();
        let expected = dense().matmul(&x).unwrap().to_vec2::<f32>().unwrap();
        for (s, e) in sparse.iter().flatten().zip(expected.iter().flatten()) {
            assert!((s - e).abs() < 1e-6);
        }
        assert_eq!(sparse[1], vec![0.0, 0.0]);
    }
}
