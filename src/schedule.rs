//! Per-iteration optimization parameters of the t-SNE gradient descent.
//!
//! Early iterations exaggerate the attractive forces so that clusters form
//! before they settle, and use a low momentum. Both switch to their final
//! values at fixed iterations.

use crate::tsne::TsneConfiguration;

/// Parameters applied during one iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule {
    /// Multiplier of the attractive forces
    pub exaggeration: f32,
    /// Momentum of the velocity update
    pub momentum: f32,
}

/// Parameters for `iteration` (0-based).
pub fn find_schedule(config: &TsneConfiguration, iteration: usize) -> Schedule {
    let exaggeration = if iteration < config.remove_exaggeration_iter {
        config.exaggeration_factor
    } else {
        1.0
    };
    let momentum = if iteration < config.mom_switching_iter {
        config.momentum
    } else {
        config.final_momentum
    };

    Schedule {
        exaggeration,
        momentum,
    }
}
