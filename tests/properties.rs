//! Property-based tests for the robust aggregations.
//!
//! These tests verify invariants that should hold for any weighted graph:
//! - Top-k selection ordering, padding and backend agreement
//! - Dense and sparse implementations computing the same thing
//! - Stored zero weights never acting as edges
//! - Chunked execution matching unchunked execution
//! - Rows without weight aggregating to zero
//! - Determinism

use proptest::prelude::*;
use robust_gnn::chunking::robust_aggregation_fn;
use robust_gnn::prelude::*;

/// Small random graph: dyadic weights (exact cumulative sums), features in [-2, 2).
#[derive(Debug, Clone)]
struct Graph {
    n: usize,
    d: usize,
    weights: Vec<f32>,
    features: Vec<f32>,
}

impl Graph {
    fn dense(&self) -> Tensor {
        Tensor::from_vec(self.weights.clone(), (self.n, self.n), &Device::Cpu).unwrap()
    }

    fn sparse(&self) -> SparseAdjacency {
        SparseAdjacency::from_dense(&self.dense()).unwrap()
    }

    /// Every entry of the matrix, zeros included, as explicit edges.
    fn sparse_with_zeros(&self) -> SparseAdjacency {
        let n = self.n;
        let edges: Vec<(u32, u32, f32)> = (0..n * n)
            .map(|p| ((p / n) as u32, (p % n) as u32, self.weights[p]))
            .collect();
        SparseAdjacency::from_edges(&edges, (n, n), &Device::Cpu).unwrap()
    }

    fn x(&self) -> Tensor {
        Tensor::from_vec(self.features.clone(), (self.n, self.d), &Device::Cpu).unwrap()
    }

    fn degree(&self, row: usize) -> usize {
        self.weights[row * self.n..(row + 1) * self.n]
            .iter()
            .filter(|w| **w != 0.0)
            .count()
    }

    fn row_sum(&self, row: usize) -> f32 {
        self.weights[row * self.n..(row + 1) * self.n].iter().sum()
    }

    fn distance(&self, a: usize, b: usize) -> f64 {
        let (d, f) = (self.d, &self.features);
        (0..d)
            .map(|c| (f[a * d + c] as f64 - f[b * d + c] as f64).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// Neighbors among the `k` heaviest of `row` whose weighted medoid cost is
    /// within `tol` of the cheapest. When a weight tie straddles the k-th slot
    /// the top-k set is not unique and every neighbor is accepted.
    fn k_medoid_candidates(&self, row: usize, k: usize, tol: f64) -> Vec<usize> {
        let weights = &self.weights[row * self.n..(row + 1) * self.n];
        let mut sorted: Vec<f32> = weights.iter().copied().filter(|w| *w != 0.0).collect();
        sorted.sort_by(|a, b| b.total_cmp(a));
        if sorted.len() > k && sorted[k - 1] == sorted[k] {
            return (0..self.n).filter(|&c| weights[c] != 0.0).collect();
        }
        let top = sparse_top_k(&self.sparse(), k, TopKBackend::Reference).unwrap();
        let picked: Vec<usize> = top.host_indices()[row * k..(row + 1) * k]
            .iter()
            .filter(|&&c| c != NO_INDEX)
            .map(|&c| c as usize)
            .collect();
        let cost = |c: usize| -> f64 {
            picked
                .iter()
                .map(|&j| self.weights[row * self.n + j] as f64 * self.distance(c, j))
                .sum()
        };
        let best = picked.iter().map(|&c| cost(c)).fold(f64::INFINITY, f64::min);
        picked.iter().copied().filter(|&c| cost(c) <= best + tol).collect()
    }

    fn without_row(mut self, row: usize) -> Self {
        let n = self.n;
        self.weights[row * n..(row + 1) * n].iter_mut().for_each(|w| *w = 0.0);
        self
    }
}

fn arb_graph() -> impl Strategy<Value = Graph> {
    (2usize..7, 1usize..4)
        .prop_flat_map(|(n, d)| {
            (
                Just(n),
                Just(d),
                prop::collection::vec(prop_oneof![3 => Just(0u8), 2 => 1u8..=8], n * n),
                prop::collection::vec(-2.0f32..2.0, n * d),
            )
        })
        .prop_map(|(n, d, w, features)| Graph {
            n,
            d,
            weights: w.into_iter().map(|q| q as f32 / 8.0).collect(),
            features,
        })
}

fn params(k: usize, execution: ExecutionPath) -> AggregationParams {
    AggregationParams {
        k,
        execution,
        ..Default::default()
    }
}

fn rows(t: &Tensor) -> Vec<Vec<f32>> {
    t.to_vec2::<f32>().unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    a.iter().zip(&b).map(|(p, q)| (p - q).abs()).fold(0.0, f32::max)
}

mod top_k_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn rows_sorted_and_padded(graph in arb_graph(), k in 1usize..5) {
            let top = sparse_top_k(&graph.sparse(), k, TopKBackend::Reference).unwrap();
            let values = rows(&top.values);
            let indices = top.indices.to_vec2::<i64>().unwrap();

            for row in 0..graph.n {
                let expected = k.min(graph.degree(row));
                let valid = indices[row].iter().filter(|&&i| i != NO_INDEX).count();
                prop_assert_eq!(valid, expected, "row {}", row);

                for slot in 0..k {
                    if slot < expected {
                        prop_assert!(indices[row][slot] != NO_INDEX);
                        prop_assert!(values[row][slot] > 0.0);
                    } else {
                        prop_assert_eq!(indices[row][slot], NO_INDEX);
                        prop_assert_eq!(values[row][slot], 0.0);
                    }
                }
                for pair in values[row].windows(2) {
                    prop_assert!(pair[0] >= pair[1], "row {} not descending: {:?}", row, values[row]);
                }
            }
        }

        #[test]
        fn backends_agree(graph in arb_graph(), k in 1usize..5) {
            let adj = graph.sparse();
            let reference = sparse_top_k(&adj, k, TopKBackend::Reference).unwrap();
            let accelerated = sparse_top_k(&adj, k, TopKBackend::Accelerated).unwrap();
            prop_assert_eq!(reference.host_indices(), accelerated.host_indices());
            prop_assert_eq!(rows(&reference.values), rows(&accelerated.values));
        }
    }
}

mod equivalence_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn soft_k_medoid_dense_matches_sparse(graph in arb_graph(), k in 1usize..4, correction in any::<bool>()) {
            let k = k.min(graph.n);
            let adj = Adjacency::Dense(graph.dense());
            let x = graph.x();
            let mut p = params(k, ExecutionPath::Dense);
            p.with_weight_correction = correction;
            let dense = soft_weighted_medoid_k_neighborhood(&adj, &x, &p).unwrap();
            p.execution = ExecutionPath::Sparse;
            let sparse = soft_weighted_medoid_k_neighborhood(&adj, &x, &p).unwrap();
            prop_assert!(max_abs_diff(&dense, &sparse) < 1e-2, "{:?} vs {:?}", rows(&dense), rows(&sparse));

            // Stored zeros are not edges
            let with_zeros = Adjacency::Sparse(graph.sparse_with_zeros());
            let sparse = soft_weighted_medoid_k_neighborhood(&with_zeros, &x, &p).unwrap();
            prop_assert!(max_abs_diff(&dense, &sparse) < 1e-2, "{:?} vs {:?}", rows(&dense), rows(&sparse));
        }

        #[test]
        fn k_medoid_paths_pick_a_cheapest_neighbor(graph in arb_graph(), k in 1usize..4) {
            let k = k.min(graph.n);
            let x = graph.x();
            let features = rows(&x);
            for (adj, execution) in [
                (Adjacency::Dense(graph.dense()), ExecutionPath::Dense),
                (Adjacency::Dense(graph.dense()), ExecutionPath::Sparse),
                (Adjacency::Sparse(graph.sparse_with_zeros()), ExecutionPath::Sparse),
            ] {
                let out = rows(&weighted_medoid_k_neighborhood(&adj, &x, &params(k, execution)).unwrap());
                for row in 0..graph.n {
                    let scale = graph.row_sum(row);
                    if graph.degree(row) == 0 {
                        prop_assert!(out[row].iter().all(|v| *v == 0.0));
                        continue;
                    }
                    let candidates = graph.k_medoid_candidates(row, k, 1e-2);
                    let hit = candidates.iter().any(|&c| {
                        features[c].iter().zip(&out[row]).all(|(f, o)| (f * scale - o).abs() < 1e-4)
                    });
                    prop_assert!(hit, "row {} on {:?}: {:?} not in {:?}", row, execution, out[row], candidates);
                }
            }
        }

        #[test]
        fn dimmedian_dense_matches_sparse(graph in arb_graph()) {
            let adj = Adjacency::Dense(graph.dense());
            let x = graph.x();
            let dense = weighted_dimwise_median(&adj, &x, &params(1, ExecutionPath::Dense)).unwrap();
            let sparse = weighted_dimwise_median(&adj, &x, &params(1, ExecutionPath::Sparse)).unwrap();
            prop_assert!(max_abs_diff(&dense, &sparse) < 1e-6);
        }

        #[test]
        fn chunked_matches_unchunked(graph in arb_graph(), n_chunks in 1usize..5) {
            let adj = graph.sparse();
            let x = graph.x();

            let direct = adj.matmul(&x).unwrap();
            let chunked = chunked_message_and_aggregate(&adj, &x, n_chunks, true, None).unwrap();
            prop_assert!(max_abs_diff(&direct, &chunked) < 1e-5);

            let aggregation = robust_aggregation_fn(RobustMean::SoftKMedoid, params(2.min(graph.n), ExecutionPath::Sparse));
            let direct = aggregation(&Adjacency::Sparse(adj.clone()), &x).unwrap();
            let chunked = chunked_message_and_aggregate(&adj, &x, n_chunks, true, Some(aggregation)).unwrap();
            prop_assert!(max_abs_diff(&direct, &chunked) < 1e-5);
        }
    }
}

mod degenerate_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(30))]

        #[test]
        fn zero_row_gives_zero_output(graph in arb_graph(), row in 0usize..7) {
            let row = row % graph.n;
            let graph = graph.without_row(row);
            let adj = Adjacency::Dense(graph.dense());
            let x = graph.x();
            for execution in [ExecutionPath::Dense, ExecutionPath::Sparse] {
                for mean in RobustMean::all() {
                    let out = mean.aggregate(&adj, &x, &params(2, execution)).unwrap();
                    prop_assert!(tensor_is_finite(&out).unwrap(), "{} on {:?}", mean, execution);
                    prop_assert!(rows(&out)[row].iter().all(|v| *v == 0.0), "{} on {:?}", mean, execution);
                }
            }
        }

        #[test]
        fn aggregation_is_deterministic(graph in arb_graph()) {
            let adj = Adjacency::Dense(graph.dense());
            let x = graph.x();
            for mean in RobustMean::all() {
                let p = params(2, ExecutionPath::Sparse);
                let first = mean.aggregate(&adj, &x, &p).unwrap();
                let second = mean.aggregate(&adj, &x, &p).unwrap();
                prop_assert_eq!(rows(&first), rows(&second), "{}", mean);
            }
        }

        #[test]
        fn selection_variants_scale_with_weights(graph in arb_graph(), scale in prop_oneof![Just(2.0f64), Just(4.0f64)]) {
            // Scaling every weight scales the output; the selection itself is scale-free
            let adj = Adjacency::Dense(graph.dense());
            let scaled = Adjacency::Dense((graph.dense() * scale).unwrap());
            let x = graph.x();
            let p = params(2, ExecutionPath::Dense);
            for mean in [RobustMean::Medoid, RobustMean::KMedoid, RobustMean::DimMedian, RobustMean::SoftMedian] {
                let base = (mean.aggregate(&adj, &x, &p).unwrap() * scale).unwrap();
                let out = mean.aggregate(&scaled, &x, &p).unwrap();
                prop_assert!(max_abs_diff(&base, &out) < 1e-3, "{}", mean);
            }
        }
    }
}
