//! SIMD distance kernels shared by the neighbor search and the tests.
//!
//! HSNE works on squared Euclidean distances throughout: the Gaussian kernel
//! of the similarity calibrator consumes `d²` directly, so the square root is
//! only taken when a caller explicitly asks for the metric distance.

use ndarray::ArrayView1;
use tracing::warn;
use wide::f32x8;

/// Computes the squared Euclidean distance between two vectors using SIMD.
///
/// Processes the vectors in chunks of 8 lanes and handles the remainder
/// sequentially.
///
/// # Panics
/// * In debug builds, if the vectors have different lengths
pub fn simd_squared_euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have the same length");

    let a_chunks = a.chunks_exact(8);
    let a_remainder = a_chunks.remainder();

    let b_chunks = b.chunks_exact(8);
    let b_remainder = b_chunks.remainder();

    let mut sum_sq = f32x8::splat(0.0);
    for (a_chunk, b_chunk) in a_chunks.zip(b_chunks) {
        let diff = f32x8::from(a_chunk) - f32x8::from(b_chunk);
        sum_sq += diff * diff;
    }

    let mut total_sum_sq: f32 = sum_sq.as_array_ref().iter().sum();

    for (a, b) in a_remainder.iter().zip(b_remainder) {
        let diff = a - b;
        total_sum_sq += diff * diff;
    }

    total_sum_sq
}

/// Computes the Euclidean distance between two vectors using SIMD.
pub fn simd_euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    simd_squared_euclidean_distance(a, b).sqrt()
}

/// Squared Euclidean distance between array views, with a SIMD fast path for
/// contiguous rows.
///
/// Non-contiguous views are copied first, which is logged since it usually
/// means the caller passed a transposed or sliced matrix by accident.
pub fn array_squared_euclidean_distance(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    match (a.as_slice(), b.as_slice()) {
        (Some(a), Some(b)) => simd_squared_euclidean_distance(a, b),
        (Some(a), None) => {
            warn!("b is non-contiguous, requiring allocation to compute distance");
            simd_squared_euclidean_distance(a, &b.to_vec())
        }
        (None, Some(b)) => {
            warn!("a is non-contiguous, requiring allocation to compute distance");
            simd_squared_euclidean_distance(&a.to_vec(), b)
        }
        (None, None) => {
            warn!("both a and b are non-contiguous, requiring allocation to compute distance");
            simd_squared_euclidean_distance(&a.to_vec(), &b.to_vec())
        }
    }
}

/// Euclidean distance between array views.
pub fn array_euclidean_distance(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    array_squared_euclidean_distance(a, b).sqrt()
}
