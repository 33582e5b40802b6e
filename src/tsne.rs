//! Gradient-descent t-SNE over a sparse similarity matrix.
//!
//! [`Tsne::initialize`] symmetrizes and normalizes the input similarities and
//! places the points; every call to [`Tsne::do_an_iteration`] then performs
//! exactly one gradient step. There is no convergence test, callers decide
//! how long to iterate.

use crate::gains::update_embedding_gains;
use crate::gradient::{barnes_hut_gradient, exact_gradient, kl_divergence};
use crate::schedule::find_schedule;
use crate::sparse::SparseMatrix;
use crate::sptree::MAX_DIMENSIONS;
use crate::HsneError;
use bon::Builder;
use ndarray::{Array2, ArrayView2, Axis};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::time::Instant;
use tracing::debug;

/// Options of the t-SNE optimizer.
#[derive(Builder, Clone, Debug)]
pub struct TsneConfiguration {
    /// Number of dimensions of the embedding, between 1 and 3
    #[builder(default = 2)]
    pub embedding_dimensions: usize,

    /// Barnes-Hut accuracy, 0 computes the exact gradient
    #[builder(default = 0.5)]
    pub theta: f32,

    /// Multiplier of the attractive forces during early exaggeration
    #[builder(default = 4.0)]
    pub exaggeration_factor: f32,

    /// First iteration without exaggeration
    #[builder(default = 250)]
    pub remove_exaggeration_iter: usize,

    /// First iteration using `final_momentum`
    #[builder(default = 250)]
    pub mom_switching_iter: usize,

    /// Learning rate
    #[builder(default = 200.0)]
    pub eta: f32,

    /// Momentum before `mom_switching_iter`
    #[builder(default = 0.2)]
    pub momentum: f32,

    /// Momentum from `mom_switching_iter` on
    #[builder(default = 0.5)]
    pub final_momentum: f32,

    /// Floor of the adaptive gains
    #[builder(default = 0.1)]
    pub minimum_gain: f32,

    /// Placement of the points before the first iteration
    #[builder(default)]
    pub initialization: Initialization,
}

impl Default for TsneConfiguration {
    fn default() -> Self {
        Self {
            embedding_dimensions: 2,
            theta: 0.5,
            exaggeration_factor: 4.0,
            remove_exaggeration_iter: 250,
            mom_switching_iter: 250,
            eta: 200.0,
            momentum: 0.2,
            final_momentum: 0.5,
            minimum_gain: 0.1,
            initialization: Initialization::default(),
        }
    }
}

impl TsneConfiguration {
    /// Adjusts accuracy and exaggeration to the number of embedded points.
    ///
    /// Small embeddings are computed exactly with mild exaggeration; from
    /// 1000 to 15000 points theta and exaggeration grow linearly towards 0.5
    /// and 10. The learning rate is capped at `n / (4 * exaggeration)`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn adapted_to_size(mut self, num_points: usize) -> Self {
        const SMALL: usize = 1_000;
        const LARGE: usize = 15_000;

        let (theta, exaggeration) = if num_points < SMALL {
            (0.0, 1.5)
        } else if num_points <= LARGE {
            let t = (num_points - SMALL) as f32 / (LARGE - SMALL) as f32;
            (0.5 * t, 1.5 + t * (10.0 - 1.5))
        } else {
            (0.5, 10.0)
        };

        self.theta = theta;
        self.exaggeration_factor = exaggeration;
        self.remove_exaggeration_iter = 170;
        self.eta = self.eta.min(num_points as f32 / (4.0 * exaggeration));
        self
    }
}

/// Methods for placing the points before the first iteration.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Initialization {
    /// Gaussian noise with the given standard deviation and optional seed
    Random {
        /// Standard deviation of every coordinate
        std: f32,
        /// Seed, `None` for a non-deterministic start
        seed: Option<u64>,
    },

    /// Use provided coordinate values
    Value(Array2<f32>),
}

impl Default for Initialization {
    fn default() -> Self {
        Self::Random {
            std: 1e-4,
            seed: None,
        }
    }
}

/// An initialized t-SNE optimizer.
#[derive(Clone, Debug)]
pub struct Tsne {
    config: TsneConfiguration,
    probabilities: SparseMatrix,
    y: Array2<f32>,
    velocity: Array2<f32>,
    gains: Array2<f32>,
    iteration: usize,
}

impl Tsne {
    /// Prepares an optimizer for the points of `similarities`.
    ///
    /// The similarities are symmetrized and scaled to sum to one, so both
    /// conditional probabilities and transition matrices are valid input.
    ///
    /// # Errors
    /// * `HsneError::InvalidEmbeddingDimensions` - dimensionality outside 1..=3
    /// * `HsneError::EmptySelection` - no point to embed
    /// * `HsneError::LengthMismatch` - provided coordinates have the wrong
    ///   shape
    /// * `HsneError::Normal` - invalid standard deviation for the random start
    pub fn initialize(
        similarities: &SparseMatrix,
        config: TsneConfiguration,
    ) -> Result<Self, HsneError> {
        let dims = config.embedding_dimensions;
        if dims == 0 || dims > MAX_DIMENSIONS {
            return Err(HsneError::InvalidEmbeddingDimensions(dims));
        }
        let n = similarities.len();
        if n == 0 {
            return Err(HsneError::EmptySelection);
        }

        let mut probabilities = similarities.symmetrize();
        let total = probabilities.total_sum();
        if total > 0.0 {
            for i in 0..probabilities.len() {
                if let Some(row) = probabilities.row_mut(i) {
                    row.values_mut()
                        .for_each(|v| *v = (f64::from(*v) / total) as f32);
                }
            }
        }

        let y = match &config.initialization {
            Initialization::Random { std, seed } => {
                let normal = Normal::new(0.0, *std)?;
                match seed {
                    None => Array2::random((n, dims), normal),
                    Some(seed) => {
                        Array2::random_using((n, dims), normal, &mut SmallRng::seed_from_u64(*seed))
                    }
                }
            }
            Initialization::Value(value) => {
                if value.dim() != (n, dims) {
                    return Err(HsneError::LengthMismatch {
                        expected: n * dims,
                        actual: value.len(),
                    });
                }
                value.clone()
            }
        };

        debug!(
            n,
            dims,
            nonzeros = probabilities.num_nonzeros(),
            theta = config.theta,
            "t-SNE initialized"
        );

        Ok(Self {
            velocity: Array2::zeros((n, dims)),
            gains: Array2::ones((n, dims)),
            config,
            probabilities,
            y,
            iteration: 0,
        })
    }

    /// Performs one gradient-descent step.
    pub fn do_an_iteration(&mut self) {
        let start = Instant::now();
        let schedule = find_schedule(&self.config, self.iteration);

        let grad = if self.config.theta > 0.0 {
            barnes_hut_gradient(
                self.y.view(),
                &self.probabilities,
                schedule.exaggeration,
                self.config.theta,
            )
        } else {
            exact_gradient(self.y.view(), &self.probabilities, schedule.exaggeration)
        };

        update_embedding_gains(
            self.y.view_mut(),
            grad.view(),
            self.velocity.view_mut(),
            self.gains.view_mut(),
            self.config.eta,
            schedule.momentum,
            self.config.minimum_gain,
        );
        if let Some(mean) = self.y.mean_axis(Axis(0)) {
            self.y -= &mean;
        }

        self.iteration += 1;
        if self.iteration % 100 == 0 {
            debug!(
                iteration = self.iteration,
                elapsed = ?start.elapsed(),
                "t-SNE iteration"
            );
        }
    }

    /// Number of iterations performed so far.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Current coordinates, one row per point.
    pub fn embedding(&self) -> ArrayView2<f32> {
        self.y.view()
    }

    /// Consumes the optimizer, returning the coordinates.
    pub fn into_embedding(self) -> Array2<f32> {
        self.y
    }

    /// Number of embedded points.
    pub fn len(&self) -> usize {
        self.y.nrows()
    }

    /// Returns `true` if no point is embedded.
    pub fn is_empty(&self) -> bool {
        self.y.nrows() == 0
    }

    /// Options the optimizer runs with.
    pub fn config(&self) -> &TsneConfiguration {
        &self.config
    }

    /// Normalized joint distribution being matched.
    pub fn probabilities(&self) -> &SparseMatrix {
        &self.probabilities
    }

    /// Exact Kullback-Leibler divergence of the current embedding.
    pub fn kl_divergence(&self) -> f64 {
        kl_divergence(self.y.view(), &self.probabilities)
    }
}
