//! K-nearest neighbor graph construction for the similarity calibrator.
//!
//! Two strategies are provided. The exact search computes all pairwise
//! squared distances with SIMD kernels, one query row per rayon task, and
//! keeps the `k` smallest. The approximate search builds an HNSW index with
//! `usearch` and queries it in parallel. [`NeighborGraph::compute`] picks one
//! based on the number of points.
//!
//! Distances are always squared Euclidean distances and a point never appears
//! in its own neighbor list.

use crate::distance::simd_squared_euclidean_distance;
use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView2, Axis};
use std::cmp::min;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

/// Fixed-width neighbor lists for every point of a feature matrix.
#[derive(Clone, Debug)]
pub struct NeighborGraph {
    /// `(n, k)` neighbor indices, closest first
    pub indices: Array2<u32>,
    /// `(n, k)` squared distances matching `indices`
    pub distances: Array2<f32>,
}

/// Parameters of the approximate neighbor index.
#[derive(Clone, Copy, Debug)]
pub struct IndexParameters {
    /// Number of points above which the HNSW index replaces the exact search
    pub approx_threshold: usize,
    /// Candidate list size explored per query (HNSW `ef` search)
    pub num_checks: usize,
    /// Graph connectivity of the HNSW index, 0 selects the library default
    pub connectivity: usize,
}

impl Default for IndexParameters {
    fn default() -> Self {
        Self {
            approx_threshold: 8_000,
            num_checks: 1024,
            connectivity: 0,
        }
    }
}

impl NeighborGraph {
    /// Number of points in the graph.
    pub fn len(&self) -> usize {
        self.indices.nrows()
    }

    /// Returns `true` if the graph has no points.
    pub fn is_empty(&self) -> bool {
        self.indices.nrows() == 0
    }

    /// Neighbors per point.
    pub fn k(&self) -> usize {
        self.indices.ncols()
    }

    /// Builds the `k`-nearest neighbor graph of `data`, choosing the exact or
    /// approximate search from `params.approx_threshold`.
    ///
    /// # Errors
    /// * `KnnError` if the approximate index cannot be built or queried
    pub fn compute(
        data: ArrayView2<f32>,
        k: usize,
        params: &IndexParameters,
    ) -> Result<Self, KnnError> {
        let start = Instant::now();
        let n = data.nrows();
        let (indices, distances) = if n > params.approx_threshold {
            debug!(n, k, "Using approximate nearest neighbor search");
            find_k_nearest_neighbors_approx(data, k, params.num_checks, params.connectivity)?
        } else {
            debug!(n, k, "Using exact nearest neighbor search");
            find_k_nearest_neighbors(data, k)
        };

        debug!(elapsed = ?start.elapsed(), "Neighbor graph computed");
        Ok(Self { indices, distances })
    }
}

/// Finds the exact k-nearest neighbors of every point.
///
/// Each rayon task owns one output row: it measures the squared distance from
/// its point to all others, partially selects the `k` smallest and sorts them.
///
/// # Returns
/// A tuple of `(n, min(k, n-1))` index and squared-distance matrices. Empty
/// input yields `(0, 0)` arrays; a single point yields zero columns.
pub fn find_k_nearest_neighbors(data: ArrayView2<f32>, k: usize) -> (Array2<u32>, Array2<f32>) {
    let n = data.nrows();
    if n == 0 {
        return (Array2::<u32>::zeros((0, 0)), Array2::<f32>::zeros((0, 0)));
    }

    let k = min(k, n - 1);
    let data = data.as_standard_layout();

    let mut neighbor_array = Array2::<u32>::zeros((n, k));
    let mut distance_array = Array2::<f32>::from_elem((n, k), f32::MAX);

    neighbor_array
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(distance_array.axis_iter_mut(Axis(0)))
        .enumerate()
        .for_each(|(i, (mut neighbors, mut distances))| {
            if k == 0 {
                return;
            }

            let row_i = data.row(i);
            let a = row_i.as_slice().unwrap_or(&[]);
            let mut candidates: Vec<(u32, f32)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| {
                    let row_j = data.row(j);
                    let b = row_j.as_slice().unwrap_or(&[]);
                    (j as u32, simd_squared_euclidean_distance(a, b))
                })
                .collect();

            if candidates.len() > k {
                candidates.select_nth_unstable_by(k - 1, |x, y| f32::total_cmp(&x.1, &y.1));
                candidates.truncate(k);
            }
            candidates.sort_unstable_by(|x, y| f32::total_cmp(&x.1, &y.1).then(x.0.cmp(&y.0)));

            for (slot, (j, d)) in candidates.into_iter().enumerate() {
                neighbors[slot] = j;
                distances[slot] = d;
            }
        });

    (neighbor_array, distance_array)
}

/// Finds approximate k-nearest neighbors with an HNSW index.
///
/// Points are added under their row index as key; each query asks for `k + 1`
/// results so that the point itself can be discarded.
///
/// # Errors
/// * `KnnError::Index` if `usearch` fails to create, fill or query the index
/// * `KnnError::IncompleteResults` if a query returns fewer than `k` neighbors
pub fn find_k_nearest_neighbors_approx(
    data: ArrayView2<f32>,
    k: usize,
    num_checks: usize,
    connectivity: usize,
) -> Result<(Array2<u32>, Array2<f32>), KnnError> {
    let (n, dim) = data.dim();
    if n == 0 {
        return Ok((Array2::<u32>::zeros((0, 0)), Array2::<f32>::zeros((0, 0))));
    }

    let k = min(k, n - 1);
    let data = data.as_standard_layout();

    let options = IndexOptions {
        dimensions: dim,
        metric: MetricKind::L2sq,
        quantization: ScalarKind::F32,
        connectivity,
        expansion_search: num_checks.max(k + 1),
        ..Default::default()
    };

    let index = Index::new(&options).map_err(|e| KnnError::Index(e.to_string()))?;
    index
        .reserve(n)
        .map_err(|e| KnnError::Index(e.to_string()))?;

    for (i, row) in data.axis_iter(Axis(0)).enumerate() {
        let vector = row.as_slice().unwrap_or(&[]);
        index
            .add(i as u64, vector)
            .map_err(|e| KnnError::Index(e.to_string()))?;
    }

    let mut neighbor_array = Array2::<u32>::zeros((n, k));
    let mut distance_array = Array2::<f32>::from_elem((n, k), f32::MAX);

    neighbor_array
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(distance_array.axis_iter_mut(Axis(0)))
        .enumerate()
        .try_for_each(|(i, (mut neighbors, mut distances))| {
            if k == 0 {
                return Ok(());
            }

            let row = data.row(i);
            let query = row.as_slice().unwrap_or(&[]);
            let matches = index
                .search(query, k + 1)
                .map_err(|e| KnnError::Index(e.to_string()))?;

            let found = matches
                .keys
                .iter()
                .zip(matches.distances.iter())
                .filter(|(&key, _)| key != i as u64)
                .take(k);

            let mut count = 0;
            for (slot, (&key, &distance)) in found.enumerate() {
                neighbors[slot] = key as u32;
                distances[slot] = distance;
                count += 1;
            }

            if count < k {
                return Err(KnnError::IncompleteResults {
                    point: i,
                    found: count,
                    expected: k,
                });
            }
            Ok(())
        })?;

    Ok((neighbor_array, distance_array))
}

/// Errors raised by the neighbor index.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum KnnError {
    /// The HNSW index reported a failure
    #[error("Approximate neighbor index failure: {0}")]
    Index(String),

    /// A query returned fewer neighbors than requested
    #[error("Neighbor query for point {point} returned {found} of {expected} neighbors")]
    IncompleteResults {
        /// Query point
        point: usize,
        /// Number of neighbors returned
        found: usize,
        /// Number of neighbors requested
        expected: usize,
    },
}
