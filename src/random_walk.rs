//! Bounded random walks on a sparse transition matrix.
//!
//! Each step samples the next node proportionally to the weights of the
//! current row. A walk that reaches a row with no positive weight cannot
//! continue and is reported as failed (`None`); callers simply do not count
//! it.

use crate::sparse::{SparseMatrix, SparseRow};
use rand::Rng;

/// Samples a column of `row` proportionally to its weights.
///
/// Returns `None` if the row has no positive weight.
pub fn sample_transition<R: Rng>(row: &SparseRow, rng: &mut R) -> Option<u32> {
    let total = row.sum();
    if total.partial_cmp(&0.0) != Some(std::cmp::Ordering::Greater) {
        return None;
    }

    let mut target = rng.gen::<f64>() * total;
    let mut last_positive = None;
    for (j, v) in row.iter() {
        if v <= 0.0 {
            continue;
        }
        last_positive = Some(j);
        target -= f64::from(v);
        if target < 0.0 {
            return Some(j);
        }
    }

    // Rounding can leave a sliver of mass past the last entry
    last_positive
}

/// Walks exactly `length` steps from `start` and returns the end node.
pub fn random_walk<R: Rng>(
    matrix: &SparseMatrix,
    start: u32,
    length: usize,
    rng: &mut R,
) -> Option<u32> {
    let mut node = start;
    for _ in 0..length {
        node = sample_transition(matrix.row(node as usize)?, rng)?;
    }
    Some(node)
}

/// Walks from `start` until a node satisfying `is_target` is reached.
///
/// The start node itself is never a hit, the walk always takes at least one
/// step. Returns `None` if no target is reached within `max_length` steps.
pub fn random_walk_until<R, F>(
    matrix: &SparseMatrix,
    start: u32,
    max_length: usize,
    is_target: F,
    rng: &mut R,
) -> Option<u32>
where
    R: Rng,
    F: Fn(u32) -> bool,
{
    let mut node = start;
    for _ in 0..max_length {
        node = sample_transition(matrix.row(node as usize)?, rng)?;
        if is_target(node) {
            return Some(node);
        }
    }
    None
}
