//! Helpers on embedding coordinates.

use crate::sparse::SparseMatrix;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;

/// Axis-aligned bounds of an embedding.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundingBox {
    /// Lower corner
    pub min: Array1<f32>,
    /// Upper corner
    pub max: Array1<f32>,
}

impl BoundingBox {
    /// Extent along every axis.
    pub fn size(&self) -> Array1<f32> {
        &self.max - &self.min
    }

    /// Returns `true` if `point` lies within the bounds.
    pub fn contains(&self, point: &[f32]) -> bool {
        point
            .iter()
            .zip(self.min.iter().zip(&self.max))
            .all(|(&p, (&lo, &hi))| lo <= p && p <= hi)
    }
}

/// Bounds of `embedding`, enlarged on every side by `offset` times the
/// extent of the axis.
///
/// Returns `None` for an empty embedding.
pub fn bounding_box(embedding: ArrayView2<f32>, offset: f32) -> Option<BoundingBox> {
    if embedding.nrows() == 0 {
        return None;
    }

    let fold_axis = |init: f32, pick: fn(f32, f32) -> f32| {
        embedding.fold_axis(Axis(0), init, |&acc, &v| pick(acc, v))
    };
    let mut min = fold_axis(f32::INFINITY, f32::min);
    let mut max = fold_axis(f32::NEG_INFINITY, f32::max);

    let margin = (&max - &min) * offset;
    min -= &margin;
    max += &margin;
    Some(BoundingBox { min, max })
}

/// Copy of `embedding` translated so that its mean is the origin.
pub fn zero_centered(embedding: ArrayView2<f32>) -> Array2<f32> {
    let mut centered = embedding.to_owned();
    if let Some(mean) = embedding.mean_axis(Axis(0)) {
        centered -= &mean;
    }
    centered
}

/// Places points at the weighted average of landmark positions.
///
/// Row `i` of `weights` maps landmarks to their weight for point `i`, as
/// produced by `Hierarchy::interpolation_weights`. Points without any weight
/// on an embedded landmark are placed at the origin.
pub fn interpolate_positions(
    landmark_embedding: ArrayView2<f32>,
    weights: &SparseMatrix,
) -> Array2<f32> {
    let (num_landmarks, dims) = landmark_embedding.dim();
    let mut positions = Array2::zeros((weights.len(), dims));

    positions
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(weights.rows().par_iter())
        .for_each(|(mut position, row)| {
            let mut total = 0.0_f32;
            for (l, w) in row.iter().filter(|&(l, _)| (l as usize) < num_landmarks) {
                position.scaled_add(w, &landmark_embedding.row(l as usize));
                total += w;
            }
            if total > 0.0 {
                position /= total;
            }
        });

    positions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::SparseRow;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_bounding_box() {
        let y = array![[0.0_f32, -1.0], [2.0, 3.0], [1.0, 1.0]];

        let bounds = bounding_box(y.view(), 0.0).expect("bounds");
        assert_eq!(bounds.min, array![0.0, -1.0]);
        assert_eq!(bounds.max, array![2.0, 3.0]);
        assert!(bounds.contains(&[1.0, 0.0]));
        assert!(!bounds.contains(&[3.0, 0.0]));

        let padded = bounding_box(y.view(), 0.25).expect("bounds");
        assert_eq!(padded.min, array![-0.5, -2.0]);
        assert_eq!(padded.size(), array![3.0, 6.0]);

        assert!(bounding_box(Array2::<f32>::zeros((0, 2)).view(), 0.1).is_none());
    }

    #[test]
    fn test_zero_centered() {
        let y = array![[1.0_f32, 2.0], [3.0, 6.0]];
        let centered = zero_centered(y.view());
        assert_eq!(centered, array![[-1.0, -2.0], [1.0, 2.0]]);
    }

    #[test]
    fn test_interpolate_positions() {
        let landmarks = array![[0.0_f32, 0.0], [4.0, 0.0], [0.0, 8.0]];
        let weights: SparseMatrix = vec![
            SparseRow::from_entries([(0, 1.0)]),
            SparseRow::from_entries([(0, 0.5), (1, 0.5)]),
            SparseRow::from_entries([(1, 1.0), (2, 3.0)]),
            SparseRow::new(),
        ]
        .into();

        let positions = interpolate_positions(landmarks.view(), &weights);

        assert_eq!(positions.dim(), (4, 2));
        assert_abs_diff_eq!(positions[[1, 0]], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(positions[[2, 0]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(positions[[2, 1]], 6.0, epsilon = 1e-6);
        assert_eq!(positions.row(3), array![0.0, 0.0]);
    }
}
