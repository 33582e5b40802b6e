#![allow(clippy::multiple_crate_versions)]

//! # `HSNE`: Hierarchical Stochastic Neighbor Embedding
//!
//! This crate provides a Rust implementation of HSNE, a multiscale extension
//! of t-SNE for the interactive exploration of large high-dimensional
//! datasets.
//!
//! Instead of embedding every data point at once, HSNE builds a hierarchy of
//! landmarks. The coarsest scale holds a few hundred landmarks that summarize
//! the whole dataset and can be embedded in seconds. Selecting a region of
//! that embedding and drilling down embeds the finer-scale landmarks of just
//! that region, until the original data points are reached.
//!
//! ## Key Features
//!
//! - Perplexity-calibrated neighbor distributions over an exact or
//!   approximate (HNSW) k-nearest-neighbor graph
//! - Landmark selection and area-of-influence estimation with reproducible,
//!   parallel Markov-chain random walks
//! - Sparse transition matrices at every scale
//! - Gradient-descent t-SNE with momentum, adaptive gains, early exaggeration
//!   and optional Barnes-Hut approximation, stepped one iteration at a time
//! - A manager owning every analysis, with drill-down, selection linking,
//!   clusters, observers, binary hierarchy persistence and CSV export
//!
//! ## Examples
//!
//! Building a hierarchy and embedding its top scale:
//! ```rust,no_run
//! use hsne::{Hierarchy, HierarchyConfiguration, Tsne, TsneConfiguration};
//! use ndarray::Array2;
//!
//! let data: Array2<f32> = // ... load your high-dimensional data
//! # Array2::zeros((10_000, 50));
//! let config = HierarchyConfiguration::builder().seed(42).build();
//! let hierarchy = Hierarchy::build(data.view(), config, 3).unwrap();
//!
//! let top = hierarchy.top_scale();
//! let mut tsne = Tsne::initialize(&top.transition_matrix, TsneConfiguration::default()).unwrap();
//! for _ in 0..1000 {
//!     tsne.do_an_iteration();
//! }
//! let embedding = tsne.embedding();
//! ```
//!
//! Interactive exploration through the manager:
//! ```rust,no_run
//! use hsne::{ManagerConfiguration, MultiscaleAnalysisManager, PanelData};
//! use ndarray::Array2;
//!
//! # let data = Array2::<f32>::zeros((10_000, 50));
//! let mut manager = MultiscaleAnalysisManager::new(PanelData::new(data), ManagerConfiguration::default());
//! manager.initialize_with_max_points(500).unwrap();
//!
//! let top = manager.create_top_level_analysis().unwrap();
//! for _ in 0..500 {
//!     manager.iterate_all();
//! }
//!
//! manager.analysis_mut(top).unwrap().select(&[0, 1, 2]).unwrap();
//! let child = manager.on_new_analysis_triggered(top).unwrap();
//! let influence = manager.on_link_selection_to_data_points(top).unwrap();
//! ```
//!
//! ## Configuration
//!
//! Hierarchy parameters (`HierarchyConfiguration`):
//! - `calibration`: perplexity (default: 30), neighbor multiplier (default: 3)
//!   and neighbor index options
//! - `mcmcs_num_walks`, `mcmcs_walk_length`: landmark selection walks
//!   (default: 10 walks of 10 steps per node)
//! - `mcmcs_landmark_thresh`: visit count multiple that makes a landmark
//!   (default: 1.5)
//! - `num_walks_per_landmark`: area-of-influence walks per node (default: 100)
//! - `seed`: optional seed for reproducible hierarchies
//!
//! t-SNE parameters (`TsneConfiguration`):
//! - `embedding_dimensions`: output dimensionality, 1 to 3 (default: 2)
//! - `theta`: Barnes-Hut accuracy, 0 for the exact gradient (default: 0.5)
//! - `exaggeration_factor`, `remove_exaggeration_iter`: early exaggeration
//!   (default: 4 for 250 iterations)
//! - `eta`, `momentum`, `final_momentum`, `mom_switching_iter`,
//!   `minimum_gain`: gradient descent
//! - `initialization`: `Random { std, seed }` or `Value(array)`
//!
//! ## Implementation Notes
//!
//! - Every data-parallel loop runs on rayon; random walks derive one
//!   generator per node from the seed, so results do not depend on thread
//!   scheduling
//! - Fallible operations return [`HsneError`], classified by
//!   [`HsneError::kind`] into caller misuse and environment failures
//! - Progress and timings are reported through `tracing`
//!
//! ## References
//!
//! [Hierarchical Stochastic Neighbor Embedding](https://doi.org/10.1111/cgf.12878).
//! Pezzotti, N., Höllt, T., Lelieveldt, B., Eisemann, E., & Vilanova, A.
//! (2016). Computer Graphics Forum, 35(3), 21-30.

pub mod analysis;
pub mod calibration;
pub mod distance;
pub mod embedding;
mod gains;
pub mod gradient;
pub mod hierarchy;
pub mod io;
pub mod knn;
pub mod manager;
mod random_walk;
mod schedule;
pub mod sparse;
pub mod sptree;
pub mod tsne;


use ndarray_rand::rand_distr::NormalError;
use thiserror::Error;

pub use crate::analysis::{
    Analysis, AnalysisId, Cluster, PanelData, PointAnnotation, PointFlags,
};
pub use crate::calibration::CalibrationConfiguration;
pub use crate::hierarchy::{AddScaleOutcome, Hierarchy, HierarchyConfiguration, Scale};
pub use crate::knn::KnnError;
pub use crate::manager::{AnalysisObserver, ManagerConfiguration, MultiscaleAnalysisManager};
pub use crate::sparse::{SparseMatrix, SparseRow};
pub use crate::tsne::{Initialization, Tsne, TsneConfiguration};

/// Broad class of an [`HsneError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller violated a precondition; retrying the same call fails again
    Logic,
    /// The environment failed: I/O, corrupt files, mismatched inputs
    Runtime,
}

/// Errors that can occur while building hierarchies and analyses.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HsneError {
    /// The dataset has fewer points than neighbors required by the perplexity
    #[error("Perplexity requires {required} points, only {available} available")]
    TooFewPoints {
        /// `perplexity * multiplier + 1`
        required: usize,
        /// Number of data points
        available: usize,
    },

    /// A scale id does not exist
    #[error("Invalid scale {scale}, the hierarchy has {num_scales} scales")]
    InvalidScale {
        /// Requested scale
        scale: usize,
        /// Number of existing scales
        num_scales: usize,
    },

    /// No hierarchy was built or loaded yet
    #[error("The hierarchy is not initialized")]
    Uninitialized,

    /// The previous scale is too small to select landmarks from
    #[error("Scale {scale} has {num_landmarks} landmarks, no coarser scale can be built")]
    ScaleTooSmall {
        /// Scale the new one would be built from
        scale: usize,
        /// Its number of landmarks
        num_landmarks: usize,
    },

    /// The top-level analysis was already created
    #[error("The top-level analysis already exists")]
    TopLevelAnalysisExists,

    /// An analysis handle does not exist
    #[error("Unknown analysis {0}")]
    UnknownAnalysis(AnalysisId),

    /// Drill-down or influence query below scale 0
    #[error("Scale 0 has no finer scale")]
    NoFinerScale,

    /// An operation needs a non-empty selection
    #[error("The selection is empty")]
    EmptySelection,

    /// An index exceeds the size of its scale or analysis
    #[error("Index {index} out of range for length {len}")]
    IndexOutOfRange {
        /// Offending index
        index: usize,
        /// Valid length
        len: usize,
    },

    /// Two inputs that must agree in size do not
    #[error("Length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        /// Expected length
        expected: usize,
        /// Provided length
        actual: usize,
    },

    /// Embeddings have between 1 and 3 dimensions
    #[error("Unsupported embedding dimensionality {0}")]
    InvalidEmbeddingDimensions(usize),

    /// K-nearest neighbors error
    #[error(transparent)]
    Neighbors(#[from] KnnError),

    /// Normal distribution creation failed
    #[error(transparent)]
    Normal(#[from] NormalError),

    /// Reading or writing a file failed
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A hierarchy file is malformed
    #[error("Invalid hierarchy file: {0}")]
    InvalidFormat(String),

    /// A loaded hierarchy does not match the data
    #[error("Hierarchy has {hierarchy} data points, the data has {data}")]
    SizeMismatch {
        /// Data points of the hierarchy
        hierarchy: usize,
        /// Data points of the feature matrix
        data: usize,
    },
}

impl HsneError {
    /// Whether the error stems from caller misuse or from the environment.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Neighbors(_) | Self::Io(_) | Self::InvalidFormat(_) | Self::SizeMismatch { .. } => {
                ErrorKind::Runtime
            }
            _ => ErrorKind::Logic,
        }
    }
}
