//! t-SNE gradient calculation.
//!
//! The cost is the Kullback-Leibler divergence between the joint
//! high-dimensional distribution `P` and the Student-t similarities `Q` of the
//! embedding. Its gradient with respect to point `i` is
//!
//! ```text
//! ∂C/∂y_i = 4 Σ_j (ex·p_ij·w_ij − w_ij² / Z)(y_i − y_j)
//! ```
//!
//! with `w_ij = 1 / (1 + ‖y_i − y_j‖²)`, `Z = Σ_{k≠l} w_kl` and `ex` the
//! current exaggeration. The attractive half only visits the sparse entries of
//! `P`. The repulsive half is either computed exactly over all pairs or
//! approximated with a Barnes-Hut tree.

use crate::sparse::SparseMatrix;
use crate::sptree::{SpTree, MAX_DIMENSIONS};
use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;

/// Normalizations below this leave no repulsion to apply.
const MIN_NORMALIZATION: f64 = 1e-12;

/// Student-t kernel between rows `i` and `j`, along with their difference.
#[inline]
fn kernel(y: ArrayView2<f32>, i: usize, j: usize, diff: &mut [f64]) -> f64 {
    let mut dist_sq = 0.0_f64;
    for (d, v) in diff.iter_mut().enumerate() {
        *v = f64::from(y[[i, d]]) - f64::from(y[[j, d]]);
        dist_sq += *v * *v;
    }
    1.0 / (1.0 + dist_sq)
}

/// Attractive forces `Σ_j p_ij·w_ij·(y_i − y_j)` on point `i`.
fn edge_forces(y: ArrayView2<f32>, p: &SparseMatrix, i: usize, pos_force: &mut [f64]) {
    let dims = pos_force.len();
    let mut diff = [0.0_f64; MAX_DIMENSIONS];
    for (j, p_ij) in p[i].iter() {
        let j = j as usize;
        if j == i {
            continue;
        }
        let w = kernel(y, i, j, &mut diff[..dims]);
        let mult = f64::from(p_ij) * w;
        for d in 0..dims {
            pos_force[d] += mult * diff[d];
        }
    }
}

/// Normalization `Z = Σ_{i≠j} w_ij` of the Student-t similarities.
pub fn normalization(y: ArrayView2<f32>) -> f64 {
    let (n, dims) = y.dim();
    (0..n)
        .into_par_iter()
        .map(|i| {
            let mut diff = [0.0_f64; MAX_DIMENSIONS];
            (0..n)
                .filter(|&j| j != i)
                .map(|j| kernel(y, i, j, &mut diff[..dims]))
                .sum::<f64>()
        })
        .sum()
}

/// Computes the exact gradient over all pairs of points.
///
/// # Arguments
/// * `y` - Current embedding, one row per point
/// * `p` - Symmetric joint distribution summing to one
/// * `exaggeration` - Multiplier of the attractive forces
///
/// # Returns
/// The gradient, with the same shape as `y`.
pub fn exact_gradient(y: ArrayView2<f32>, p: &SparseMatrix, exaggeration: f32) -> Array2<f32> {
    let (n, dims) = y.dim();
    let z = normalization(y);
    let ex = f64::from(exaggeration);

    let mut grad = Array2::zeros((n, dims));
    grad.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut g)| {
            let mut pos_force = [0.0_f64; MAX_DIMENSIONS];
            let mut neg_force = [0.0_f64; MAX_DIMENSIONS];
            let mut diff = [0.0_f64; MAX_DIMENSIONS];

            edge_forces(y, p, i, &mut pos_force[..dims]);
            if z > MIN_NORMALIZATION {
                for j in (0..n).filter(|&j| j != i) {
                    let w = kernel(y, i, j, &mut diff[..dims]);
                    for d in 0..dims {
                        neg_force[d] += w * w * diff[d];
                    }
                }
            }

            for d in 0..dims {
                let repulsion = if z > MIN_NORMALIZATION { neg_force[d] / z } else { 0.0 };
                g[d] = (4.0 * (ex * pos_force[d] - repulsion)) as f32;
            }
        });

    grad
}

/// Computes the gradient with Barnes-Hut approximated repulsion.
///
/// Same contract as [`exact_gradient`]; `theta` trades accuracy for speed
/// and `theta = 0` reproduces the exact repulsion.
pub fn barnes_hut_gradient(
    y: ArrayView2<f32>,
    p: &SparseMatrix,
    exaggeration: f32,
    theta: f32,
) -> Array2<f32> {
    let (n, dims) = y.dim();
    let tree = SpTree::new(y);
    let ex = f64::from(exaggeration);

    let forces: Vec<([f64; MAX_DIMENSIONS], [f64; MAX_DIMENSIONS], f64)> = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut pos_force = [0.0_f64; MAX_DIMENSIONS];
            let mut neg_force = [0.0_f64; MAX_DIMENSIONS];
            edge_forces(y, p, i, &mut pos_force[..dims]);
            let sum_q = tree.compute_non_edge_forces(i, theta, &mut neg_force[..dims]);
            (pos_force, neg_force, sum_q)
        })
        .collect();

    let z: f64 = forces.iter().map(|(_, _, sum_q)| sum_q).sum();

    let mut grad = Array2::zeros((n, dims));
    for (mut g, (pos_force, neg_force, _)) in grad.axis_iter_mut(Axis(0)).zip(&forces) {
        for d in 0..dims {
            let repulsion = if z > MIN_NORMALIZATION { neg_force[d] / z } else { 0.0 };
            g[d] = (4.0 * (ex * pos_force[d] - repulsion)) as f32;
        }
    }
    grad
}

/// Kullback-Leibler divergence `Σ p_ij ln(p_ij / q_ij)` of the embedding.
///
/// Only the sparse entries of `p` contribute; `Z` is computed exactly.
pub fn kl_divergence(y: ArrayView2<f32>, p: &SparseMatrix) -> f64 {
    let dims = y.ncols();
    let z = normalization(y);
    if z <= MIN_NORMALIZATION {
        return 0.0;
    }

    p.rows()
        .par_iter()
        .enumerate()
        .map(|(i, row)| {
            let mut diff = [0.0_f64; MAX_DIMENSIONS];
            row.iter()
                .filter(|&(j, p_ij)| j as usize != i && p_ij > 0.0)
                .map(|(j, p_ij)| {
                    let q = kernel(y, i, j as usize, &mut diff[..dims]) / z;
                    let p_ij = f64::from(p_ij);
                    p_ij * (p_ij / q.max(f64::MIN_POSITIVE)).ln()
                })
                .sum::<f64>()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::SparseRow;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn random_joint(n: usize, rng: &mut SmallRng) -> SparseMatrix {
        let conditional: SparseMatrix = (0..n)
            .map(|i| {
                let mut row = SparseRow::new();
                for _ in 0..5 {
                    let j = rng.gen_range(0..n as u32);
                    if j as usize != i {
                        row.insert(j, rng.gen::<f32>() + 0.1);
                    }
                }
                row.normalize();
                row
            })
            .collect();
        let mut joint = conditional.symmetrize();
        let total = joint.total_sum() as f32;
        for i in 0..joint.len() {
            if let Some(row) = joint.row_mut(i) {
                row.values_mut().for_each(|v| *v /= total);
            }
        }
        joint
    }

    #[test]
    fn test_two_points_attract() {
        let y = array![[0.0_f32, 0.0], [1.0, 0.0]];
        let p: SparseMatrix = vec![
            SparseRow::from_entries([(1, 0.5)]),
            SparseRow::from_entries([(0, 0.5)]),
        ]
        .into();

        // w = 1/2, Z = 1, gradient = 4 (2·0.5·0.5 − 0.25)(y_0 − y_1)
        let grad = exact_gradient(y.view(), &p, 2.0);
        assert_abs_diff_eq!(grad[[0, 0]], -1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(grad[[1, 0]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(grad[[0, 1]], 0.0, epsilon = 1e-6);

        // Without exaggeration the forces cancel out
        let grad = exact_gradient(y.view(), &p, 1.0);
        assert!(grad.iter().all(|g| g.abs() < 1e-6));
    }

    #[test]
    fn test_barnes_hut_matches_exact_at_theta_zero() {
        let mut rng = SmallRng::seed_from_u64(11);
        let y = Array2::from_shape_fn((60, 2), |_| rng.gen_range(-3.0_f32..3.0));
        let p = random_joint(60, &mut rng);

        let exact = exact_gradient(y.view(), &p, 4.0);
        let approx = barnes_hut_gradient(y.view(), &p, 4.0, 0.0);

        for (e, a) in exact.iter().zip(approx.iter()) {
            assert_abs_diff_eq!(e, a, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_barnes_hut_approximates_exact() {
        let mut rng = SmallRng::seed_from_u64(12);
        let y = Array2::from_shape_fn((200, 2), |_| rng.gen_range(-10.0_f32..10.0));
        let p = random_joint(200, &mut rng);

        let exact = exact_gradient(y.view(), &p, 1.0);
        let approx = barnes_hut_gradient(y.view(), &p, 1.0, 0.5);

        let error: f32 = (&exact - &approx).mapv(|v| v * v).sum().sqrt();
        let norm: f32 = exact.mapv(|v| v * v).sum().sqrt();
        assert!(error / norm < 0.15, "Relative error {}", error / norm);
    }

    #[test]
    fn test_single_point_has_no_gradient() {
        let y = array![[0.5_f32, -0.5]];
        let p: SparseMatrix = vec![SparseRow::new()].into();
        assert!(exact_gradient(y.view(), &p, 4.0).iter().all(|&g| g == 0.0));
        assert!(barnes_hut_gradient(y.view(), &p, 4.0, 0.5).iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_kl_divergence_prefers_faithful_layout() {
        // Two tight pairs far apart, P only links within pairs
        let p: SparseMatrix = vec![
            SparseRow::from_entries([(1, 0.25)]),
            SparseRow::from_entries([(0, 0.25)]),
            SparseRow::from_entries([(3, 0.25)]),
            SparseRow::from_entries([(2, 0.25)]),
        ]
        .into();
        let faithful = array![[0.0_f32, 0.0], [0.1, 0.0], [10.0, 0.0], [10.1, 0.0]];
        let mixed = array![[0.0_f32, 0.0], [10.0, 0.0], [0.1, 0.0], [10.1, 0.0]];

        assert!(kl_divergence(faithful.view(), &p) < kl_divergence(mixed.view(), &p));
    }
}
