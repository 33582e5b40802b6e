//! Gradient descent with momentum and per-coordinate adaptive gains.
//!
//! A coordinate's gain grows additively while its gradient keeps pointing
//! against its velocity and decays multiplicatively once they agree.

use ndarray::{ArrayView2, ArrayViewMut2, Zip};

/// Additive gain increase when gradient and velocity disagree.
const GAIN_INCREMENT: f32 = 0.2;

/// Multiplicative gain decay when gradient and velocity agree.
const GAIN_DECAY: f32 = 0.8;

#[inline]
fn sign(x: f32) -> i8 {
    if x > 0.0 {
        1
    } else if x < 0.0 {
        -1
    } else {
        0
    }
}

/// Updates the embedding with one momentum step.
///
/// For every coordinate:
/// - `gain += 0.2` if `sign(grad) != sign(velocity)`, else `gain *= 0.8`
/// - `gain = max(gain, min_gain)`
/// - `velocity = momentum·velocity − eta·gain·grad`
/// - `y += velocity`
///
/// # Arguments
/// * `y` - Embedding coordinates to update
/// * `grad` - Gradient for this iteration
/// * `velocity` - Momentum buffer, same shape as `y`
/// * `gains` - Per-coordinate gains, same shape as `y`
/// * `eta` - Learning rate
/// * `momentum` - Momentum for this iteration
/// * `min_gain` - Floor for every gain
///
/// # Panics
/// * If the arrays do not all have the same shape
pub fn update_embedding_gains(
    y: ArrayViewMut2<f32>,
    grad: ArrayView2<f32>,
    velocity: ArrayViewMut2<f32>,
    gains: ArrayViewMut2<f32>,
    eta: f32,
    momentum: f32,
    min_gain: f32,
) {
    Zip::from(y)
        .and(grad)
        .and(velocity)
        .and(gains)
        .par_for_each(|y, &grad, velocity, gain| {
            *gain = if sign(grad) == sign(*velocity) {
                *gain * GAIN_DECAY
            } else {
                *gain + GAIN_INCREMENT
            };
            *gain = gain.max(min_gain);
            *velocity = momentum * *velocity - eta * *gain * grad;
            *y += *velocity;
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    #[test]
    fn test_update_embedding_gains() {
        let mut y = array![[1.0_f32, 2.0], [3.0, 4.0]];
        let grad = array![[0.5_f32, -0.5], [0.0, 1.0]];
        let mut velocity = array![[0.0_f32, -1.0], [0.0, 1.0]];
        let mut gains = Array2::<f32>::ones((2, 2));

        update_embedding_gains(
            y.view_mut(),
            grad.view(),
            velocity.view_mut(),
            gains.view_mut(),
            0.1,
            0.5,
            0.1,
        );

        // Signs (+, 0) differ, (−, −) agree, (0, 0) agree, (+, +) agree
        let gains_expected = array![[1.2_f32, 0.8], [0.8, 0.8]];
        let velocity_expected = array![[-0.06_f32, -0.46], [0.0, 0.42]];
        let y_expected = array![[0.94_f32, 1.54], [3.0, 4.42]];

        Zip::from(&gains).and(&gains_expected).for_each(|&g, &e| {
            assert_abs_diff_eq!(g, e, epsilon = 1e-6);
        });
        Zip::from(&velocity).and(&velocity_expected).for_each(|&v, &e| {
            assert_abs_diff_eq!(v, e, epsilon = 1e-6);
        });
        Zip::from(&y).and(&y_expected).for_each(|&v, &e| {
            assert_abs_diff_eq!(v, e, epsilon = 1e-6);
        });
    }

    #[test]
    fn test_gains_are_floored() {
        let mut y = Array2::<f32>::zeros((1, 1));
        let grad = array![[1.0_f32]];
        let mut velocity = array![[1.0_f32]];
        let mut gains = array![[0.11_f32]];

        update_embedding_gains(
            y.view_mut(),
            grad.view(),
            velocity.view_mut(),
            gains.view_mut(),
            1.0,
            0.0,
            0.1,
        );

        assert_abs_diff_eq!(gains[[0, 0]], 0.1, epsilon = 1e-7);
        assert_abs_diff_eq!(velocity[[0, 0]], -0.1, epsilon = 1e-7);
    }
}
