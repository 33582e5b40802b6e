//! Similarity calibration: from feature vectors to neighbor probabilities.
//!
//! Every point gets a Gaussian kernel over its nearest neighbors whose
//! precision `beta` is chosen by bisection so that the entropy of the
//! resulting distribution equals `ln(perplexity)`. The conditional
//! distributions form the scale-0 transition matrix of the hierarchy; their
//! symmetrization is the joint distribution consumed by t-SNE.

use crate::knn::{IndexParameters, NeighborGraph};
use crate::sparse::{SparseMatrix, SparseRow};
use crate::HsneError;
use bon::Builder;
use ndarray::ArrayView2;
use rayon::prelude::*;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Relative spread below which a row of distances counts as constant.
const CONSTANT_DISTANCE_TOLERANCE: f64 = 1e-6;

/// Parameters of the perplexity calibration and its neighbor search.
#[derive(Builder, Clone, Debug)]
pub struct CalibrationConfiguration {
    /// Target effective number of neighbors
    #[builder(default = 30.0)]
    pub perplexity: f32,

    /// Neighbors queried per point, as a multiple of the perplexity
    #[builder(default = 3.0)]
    pub perplexity_multiplier: f32,

    /// Number of points above which approximate neighbor search is used
    #[builder(default = 8_000)]
    pub approx_threshold: usize,

    /// Candidate list size of the approximate search
    #[builder(default = 1024)]
    pub num_checks: usize,

    /// Graph connectivity of the approximate index, 0 for the default
    #[builder(default = 0)]
    pub connectivity: usize,

    /// Maximum bisection steps per point
    #[builder(default = 200)]
    pub max_iterations: usize,

    /// Accepted absolute entropy error, in nats
    #[builder(default = 1e-5)]
    pub tolerance: f64,
}

impl Default for CalibrationConfiguration {
    fn default() -> Self {
        Self {
            perplexity: 30.0,
            perplexity_multiplier: 3.0,
            approx_threshold: 8_000,
            num_checks: 1024,
            connectivity: 0,
            max_iterations: 200,
            tolerance: 1e-5,
        }
    }
}

impl CalibrationConfiguration {
    /// Neighbors requested from the index, counting the point itself.
    pub fn num_neighbors(&self) -> usize {
        (self.perplexity * self.perplexity_multiplier) as usize + 1
    }

    /// Parameters handed to the neighbor index.
    pub fn index_parameters(&self) -> IndexParameters {
        IndexParameters {
            approx_threshold: self.approx_threshold,
            num_checks: self.num_checks,
            connectivity: self.connectivity,
        }
    }
}

/// Outcome of calibrating a dataset.
#[derive(Clone, Debug)]
pub struct Calibration {
    /// Row-normalized conditional distributions, one row per point
    pub probabilities: SparseMatrix,
    /// Points whose bandwidth search did not converge
    pub num_uniform_fallbacks: usize,
    /// Time spent building the neighbor graph
    pub knn_time: Duration,
    /// Time spent in the perplexity search
    pub probabilities_time: Duration,
}

/// Computes the conditional neighbor distribution of every point.
///
/// # Errors
/// * `HsneError::TooFewPoints` if `perplexity * multiplier + 1` exceeds the
///   number of points
/// * `HsneError::Neighbors` if the neighbor index fails
pub fn compute_probability_distributions(
    data: ArrayView2<f32>,
    config: &CalibrationConfiguration,
) -> Result<Calibration, HsneError> {
    let n = data.nrows();
    let nn = config.num_neighbors();
    if nn > n {
        return Err(HsneError::TooFewPoints {
            required: nn,
            available: n,
        });
    }

    let start = Instant::now();
    let graph = NeighborGraph::compute(data, nn - 1, &config.index_parameters())?;
    let knn_time = start.elapsed();

    let start = Instant::now();
    let (probabilities, num_uniform_fallbacks) = calibrate_neighbor_graph(&graph, config);
    let probabilities_time = start.elapsed();

    if num_uniform_fallbacks > 0 {
        warn!(
            num_uniform_fallbacks,
            "Perplexity search did not converge, using uniform neighbor distributions"
        );
    }
    debug!(n, nn, ?knn_time, ?probabilities_time, "Probability distributions computed");

    Ok(Calibration {
        probabilities,
        num_uniform_fallbacks,
        knn_time,
        probabilities_time,
    })
}

/// Computes the symmetrized joint distribution
/// `P[i][j] = P[j][i] = (P(j|i) + P(i|j)) / 2`.
///
/// # Errors
/// Same as [`compute_probability_distributions`].
pub fn compute_joint_probability_distribution(
    data: ArrayView2<f32>,
    config: &CalibrationConfiguration,
) -> Result<SparseMatrix, HsneError> {
    let calibration = compute_probability_distributions(data, config)?;
    Ok(calibration.probabilities.symmetrize())
}

/// Turns a neighbor graph into conditional distributions.
///
/// # Returns
/// The probability matrix and the number of rows that fell back to a uniform
/// distribution.
pub fn calibrate_neighbor_graph(
    graph: &NeighborGraph,
    config: &CalibrationConfiguration,
) -> (SparseMatrix, usize) {
    let perplexity = f64::from(config.perplexity);

    let rows: Vec<(SparseRow, bool)> = (0..graph.len())
        .into_par_iter()
        .map(|i| {
            let distances = graph.distances.row(i).to_vec();
            let mut p = vec![0.0_f32; distances.len()];
            let beta = gaussian_distribution_with_fixed_perplexity(
                &distances,
                perplexity,
                config.max_iterations,
                config.tolerance,
                &mut p,
            );

            let row = graph
                .indices
                .row(i)
                .iter()
                .zip(p)
                .map(|(&j, v)| (j, v))
                .collect::<SparseRow>();
            (row, beta.is_none())
        })
        .collect();

    let num_fallbacks = rows.iter().filter(|(_, fallback)| *fallback).count();
    let matrix = rows.into_iter().map(|(row, _)| row).collect();
    (matrix, num_fallbacks)
}

/// Finds the Gaussian precision whose neighbor distribution has the requested
/// perplexity and writes that distribution into `distribution`.
///
/// `beta` starts at 1 and is doubled or halved until the target entropy is
/// bracketed, then bisected. Entropy is measured in nats. The kernel is
/// evaluated on distances relative to the nearest neighbor, which leaves the
/// normalized distribution unchanged and keeps its sum at least one.
///
/// # Returns
/// The precision found, or `None` when all distances are equal or the search
/// did not converge within `max_iterations`; `distribution` is then uniform.
pub fn gaussian_distribution_with_fixed_perplexity(
    squared_distances: &[f32],
    perplexity: f64,
    max_iterations: usize,
    tolerance: f64,
    distribution: &mut [f32],
) -> Option<f64> {
    debug_assert_eq!(squared_distances.len(), distribution.len());
    let n = squared_distances.len();
    if n == 0 {
        return None;
    }

    let (min_distance, max_distance) = squared_distances
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &d| {
            let d = f64::from(d);
            (lo.min(d), hi.max(d))
        });
    // No precision can tell equidistant neighbors apart
    if max_distance - min_distance <= CONSTANT_DISTANCE_TOLERANCE * max_distance.abs().max(1.0) {
        distribution.fill(1.0 / n as f32);
        return None;
    }

    let target_entropy = perplexity.ln();
    let mut beta = 1.0_f64;
    let mut min_beta = f64::NEG_INFINITY;
    let mut max_beta = f64::INFINITY;
    let mut kernel = vec![0.0_f64; n];

    for _ in 0..max_iterations {
        let mut sum = 0.0_f64;
        let mut weighted = 0.0;
        for (k, &d) in kernel.iter_mut().zip(squared_distances) {
            let d = f64::from(d) - min_distance;
            *k = (-beta * d).exp();
            sum += *k;
            weighted += d * *k;
        }

        let entropy = beta * weighted / sum + sum.ln();
        let diff = entropy - target_entropy;

        if diff.abs() < tolerance {
            for (p, k) in distribution.iter_mut().zip(&kernel) {
                *p = (k / sum) as f32;
            }
            return Some(beta);
        }

        if diff > 0.0 {
            min_beta = beta;
            beta = if max_beta.is_infinite() {
                beta * 2.0
            } else {
                (beta + max_beta) / 2.0
            };
        } else {
            max_beta = beta;
            beta = if min_beta.is_infinite() {
                beta / 2.0
            } else {
                (beta + min_beta) / 2.0
            };
        }
    }

    distribution.fill(1.0 / n as f32);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn perplexity_of(p: &[f32]) -> f64 {
        let h: f64 = p
            .iter()
            .map(|&v| f64::from(v))
            .filter(|&v| v > 0.0)
            .map(|v| -v * v.ln())
            .sum();
        h.exp()
    }

    #[test]
    fn test_perplexity_is_matched() {
        let distances: Vec<f32> = (0..90).map(|i| i as f32 * 0.1).collect();
        let mut p = vec![0.0; distances.len()];

        let beta = gaussian_distribution_with_fixed_perplexity(&distances, 30.0, 200, 1e-5, &mut p);

        assert!(beta.is_some(), "Search should converge");
        assert_abs_diff_eq!(p.iter().sum::<f32>(), 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(perplexity_of(&p), 30.0, epsilon = 1e-2);
        assert!(p.windows(2).all(|w| w[0] >= w[1]), "Closer neighbors weigh more");
    }

    #[test]
    fn test_zero_variance_falls_back_to_uniform() {
        let distances = vec![2.0_f32; 10];
        let mut p = vec![0.0; 10];

        let beta = gaussian_distribution_with_fixed_perplexity(&distances, 5.0, 200, 1e-5, &mut p);

        assert!(beta.is_none());
        assert!(p.iter().all(|&v| (v - 0.1).abs() < 1e-7));
    }

    #[test]
    fn test_equidistant_neighbors_sum_to_one() {
        let distances = vec![0.5_f32; 90];
        let mut p = vec![0.0; 90];

        let beta = gaussian_distribution_with_fixed_perplexity(&distances, 30.0, 200, 1e-5, &mut p);

        assert!(beta.is_none());
        assert!(p.iter().all(|&v| (v - 1.0 / 90.0).abs() < 1e-7));
        assert_abs_diff_eq!(p.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_converged_rows_sum_to_one_with_large_beta() {
        // A single close neighbor forces a large precision
        let mut distances = vec![40.0_f32; 20];
        distances[0] = 1.0;
        distances[1] = 1.5;
        let mut p = vec![0.0; distances.len()];

        let beta = gaussian_distribution_with_fixed_perplexity(&distances, 2.0, 200, 1e-5, &mut p);

        assert!(beta.is_some());
        assert_abs_diff_eq!(p.iter().map(|&v| f64::from(v)).sum::<f64>(), 1.0, epsilon = 1e-6);
        assert!(p[0] > p[1]);
    }

    #[test]
    fn test_far_neighbors_still_converge() {
        // Neighbors 50 apart need a precision well below the starting one
        let distances: Vec<f32> = (0..40).map(|i| 5_000.0 + i as f32 * 50.0).collect();
        let mut p = vec![0.0; distances.len()];

        let beta = gaussian_distribution_with_fixed_perplexity(&distances, 10.0, 200, 1e-5, &mut p);

        assert!(beta.is_some_and(|b| b < 1.0));
        assert_abs_diff_eq!(perplexity_of(&p), 10.0, epsilon = 1e-2);
    }

    #[test]
    fn test_rows_are_normalized() {
        let mut rng = SmallRng::seed_from_u64(3);
        let data = Array2::from_shape_fn((120, 6), |_| rng.gen::<f32>());
        let config = CalibrationConfiguration::builder().perplexity(10.0).build();

        let calibration = compute_probability_distributions(data.view(), &config).expect("calibration");
        let p = calibration.probabilities;

        assert_eq!(p.len(), 120);
        for (i, row) in p.iter().enumerate() {
            assert_eq!(row.len(), config.num_neighbors() - 1);
            assert!(row.get(i as u32).is_none(), "Point {i} is its own neighbor");
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_joint_distribution_is_symmetric() {
        let mut rng = SmallRng::seed_from_u64(5);
        let data = Array2::from_shape_fn((80, 4), |_| rng.gen::<f32>());
        let config = CalibrationConfiguration::builder().perplexity(5.0).build();

        let joint = compute_joint_probability_distribution(data.view(), &config).expect("joint");
        for (i, row) in joint.iter().enumerate() {
            assert!(!row.is_empty());
            for (j, v) in row.iter() {
                assert_eq!(joint[j as usize].get(i as u32), Some(v));
            }
        }
    }

    #[test]
    fn test_too_few_points() {
        let data = Array2::<f32>::zeros((50, 3));
        let config = CalibrationConfiguration::default();
        let result = compute_probability_distributions(data.view(), &config);
        assert!(matches!(
            result,
            Err(HsneError::TooFewPoints {
                required: 91,
                available: 50
            })
        ));
    }
}
