//! Multiscale landmark hierarchy.
//!
//! Scale 0 holds every data point, with the calibrated conditional neighbor
//! distribution as its transition matrix. Each further scale is built from the
//! previous one in three phases:
//!
//! 1. **Landmark selection**: a batch of short random walks starts from every
//!    node; nodes whose visit count exceeds `beta` times the mean become
//!    landmarks.
//! 2. **Area of influence**: walks from every previous-scale node stop at the
//!    first landmark they meet. The fraction of walks ending at landmark `l`
//!    is the influence of `l` on that node, and landmark weights accumulate
//!    the influence times the node weight.
//! 3. **Transition matrix**: two landmarks are similar when their areas of
//!    influence overlap, `T[l][l'] = Σ_d aoi[d][l]·aoi[d][l']·w[d]`, followed by
//!    row normalization and pruning of negligible entries.
//!
//! The hierarchy is append-only; scale `k` is only built once scale `k-1` is
//! complete.

use crate::calibration::{compute_probability_distributions, CalibrationConfiguration};
use crate::random_walk::{random_walk, random_walk_until};
use crate::sparse::{SparseMatrix, SparseRow};
use crate::HsneError;
use bon::Builder;
use ndarray::ArrayView2;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Parameters controlling how scales are added to the hierarchy.
#[derive(Builder, Clone, Debug)]
pub struct HierarchyConfiguration {
    /// Perplexity calibration of scale 0
    #[builder(default)]
    pub calibration: CalibrationConfiguration,

    /// Seed for every random walk; `None` draws a fresh seed per scale
    pub seed: Option<u64>,

    /// Walks started from each node during landmark selection
    #[builder(default = 10)]
    pub mcmcs_num_walks: usize,

    /// Length of each landmark selection walk
    #[builder(default = 10)]
    pub mcmcs_walk_length: usize,

    /// A node becomes a landmark when visited more than this multiple of the
    /// mean visit count
    #[builder(default = 1.5)]
    pub mcmcs_landmark_thresh: f32,

    /// Walks started from each node to estimate the area of influence
    #[builder(default = 100)]
    pub num_walks_per_landmark: usize,

    /// Maximum steps of an area-of-influence walk before it is discarded
    #[builder(default = 100)]
    pub aoi_max_walk_length: usize,

    /// Influence values at or below `thresh / 100` are ignored when building
    /// the transition matrix
    #[builder(default = 1.5)]
    pub transition_matrix_prune_thresh: f32,

    /// Normalized transition entries below this value are dropped, in addition
    /// to those below `transition_matrix_prune_thresh / num_landmarks`
    #[builder(default = 0.001)]
    pub transition_min_value: f32,
}

impl Default for HierarchyConfiguration {
    fn default() -> Self {
        Self {
            calibration: CalibrationConfiguration::default(),
            seed: None,
            mcmcs_num_walks: 10,
            mcmcs_walk_length: 10,
            mcmcs_landmark_thresh: 1.5,
            num_walks_per_landmark: 100,
            aoi_max_walk_length: 100,
            transition_matrix_prune_thresh: 1.5,
            transition_min_value: 0.001,
        }
    }
}

/// One level of the hierarchy.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scale {
    /// Row-stochastic similarity between the landmarks of this scale
    pub transition_matrix: SparseMatrix,
    /// Index of each landmark in the previous scale
    pub landmark_to_parent_idx: Vec<u32>,
    /// Index of each landmark in the original data
    pub landmark_to_original_idx: Vec<u32>,
    /// Landmark of this scale for each previous-scale node, if any
    pub parent_to_landmark_idx: Vec<Option<u32>>,
    /// Number of data points each landmark stands for
    pub landmark_weight: Vec<f32>,
    /// For every previous-scale node, the influence each landmark of this
    /// scale has on it. Empty at scale 0.
    pub area_of_influence: SparseMatrix,
}

impl Scale {
    /// Scale 0: every data point is its own landmark with unit weight.
    pub fn identity(transition_matrix: SparseMatrix) -> Self {
        let n = transition_matrix.len();
        let idx: Vec<u32> = (0..n as u32).collect();
        Self {
            transition_matrix,
            landmark_to_parent_idx: idx.clone(),
            parent_to_landmark_idx: idx.iter().copied().map(Some).collect(),
            landmark_to_original_idx: idx,
            landmark_weight: vec![1.0; n],
            area_of_influence: SparseMatrix::default(),
        }
    }

    /// Number of landmarks.
    pub fn len(&self) -> usize {
        self.landmark_to_parent_idx.len()
    }

    /// Returns `true` if the scale has no landmarks.
    pub fn is_empty(&self) -> bool {
        self.landmark_to_parent_idx.is_empty()
    }
}

/// Result of [`Hierarchy::add_scale`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddScaleOutcome {
    /// A scale with this many landmarks was appended
    Added {
        /// Landmarks of the new scale
        num_landmarks: usize,
    },
    /// No node qualified as landmark; the hierarchy is unchanged
    NoLandmarks,
}

/// Timings and sizes of one added scale.
#[derive(Clone, Debug, Default)]
pub struct ScaleStatistics {
    /// Landmarks selected
    pub num_landmarks: usize,
    /// Time spent in landmark selection walks
    pub landmark_selection_time: Duration,
    /// Landmark selection walks launched
    pub landmark_selection_num_walks: usize,
    /// Time spent estimating the area of influence
    pub aoi_time: Duration,
    /// Area-of-influence walks launched
    pub aoi_num_walks: usize,
    /// Time spent building the transition matrix
    pub transition_time: Duration,
    /// Fraction of zero entries in the area of influence
    pub aoi_sparsity: f32,
    /// Fraction of zero entries in the transition matrix
    pub transition_sparsity: f32,
}

/// Timings of hierarchy construction.
#[derive(Clone, Debug, Default)]
pub struct HierarchyStatistics {
    /// Neighbor graph computation of scale 0
    pub knn_time: Duration,
    /// Perplexity calibration of scale 0
    pub probabilities_time: Duration,
    /// Points whose calibration fell back to a uniform distribution
    pub num_uniform_fallbacks: usize,
    /// One entry per scale added after scale 0
    pub scales: Vec<ScaleStatistics>,
}

impl HierarchyStatistics {
    /// Emits the statistics as structured log events.
    pub fn log(&self) {
        info!(
            knn_time = ?self.knn_time,
            probabilities_time = ?self.probabilities_time,
            num_uniform_fallbacks = self.num_uniform_fallbacks,
            "Hierarchy scale 0"
        );
        for (i, s) in self.scales.iter().enumerate() {
            info!(
                scale = i + 1,
                num_landmarks = s.num_landmarks,
                landmark_selection_time = ?s.landmark_selection_time,
                landmark_selection_num_walks = s.landmark_selection_num_walks,
                aoi_time = ?s.aoi_time,
                aoi_num_walks = s.aoi_num_walks,
                transition_time = ?s.transition_time,
                aoi_sparsity = s.aoi_sparsity,
                transition_sparsity = s.transition_sparsity,
                "Hierarchy scale"
            );
        }
    }
}

/// Append-only sequence of scales, finest first.
#[derive(Clone, Debug)]
pub struct Hierarchy {
    scales: Vec<Scale>,
    config: HierarchyConfiguration,
    statistics: HierarchyStatistics,
}

impl Hierarchy {
    /// Builds scale 0 from the data.
    ///
    /// # Errors
    /// * `HsneError::TooFewPoints` if the data is too small for the perplexity
    /// * `HsneError::Neighbors` if the neighbor index fails
    pub fn initialize(
        data: ArrayView2<f32>,
        config: HierarchyConfiguration,
    ) -> Result<Self, HsneError> {
        debug!(num_points = data.nrows(), dims = data.ncols(), "Initializing hierarchy");
        let calibration = compute_probability_distributions(data, &config.calibration)?;

        let statistics = HierarchyStatistics {
            knn_time: calibration.knn_time,
            probabilities_time: calibration.probabilities_time,
            num_uniform_fallbacks: calibration.num_uniform_fallbacks,
            scales: Vec::new(),
        };

        Ok(Self {
            scales: vec![Scale::identity(calibration.probabilities)],
            config,
            statistics,
        })
    }

    /// Wraps existing scales, e.g. loaded from disk.
    ///
    /// # Errors
    /// * `HsneError::InvalidFormat` if there is no scale or the landmark maps
    ///   are inconsistent with the matrices
    pub fn from_scales(
        scales: Vec<Scale>,
        config: HierarchyConfiguration,
    ) -> Result<Self, HsneError> {
        if scales.is_empty() {
            return Err(HsneError::InvalidFormat("hierarchy has no scale".into()));
        }

        for (s, scale) in scales.iter().enumerate() {
            let n = scale.len();
            if scale.transition_matrix.len() != n
                || scale.landmark_to_original_idx.len() != n
                || scale.landmark_weight.len() != n
            {
                return Err(HsneError::InvalidFormat(format!(
                    "scale {s}: landmark arrays and transition matrix disagree in size"
                )));
            }
            if scale.transition_matrix.num_columns() > n {
                return Err(HsneError::InvalidFormat(format!(
                    "scale {s}: transition matrix references a missing landmark"
                )));
            }

            if s > 0 {
                let prev = scales[s - 1].len();
                if scale.area_of_influence.len() != prev
                    || scale.area_of_influence.num_columns() > n
                    || scale.landmark_to_parent_idx.iter().any(|&p| p as usize >= prev)
                {
                    return Err(HsneError::InvalidFormat(format!(
                        "scale {s}: area of influence or parent indices out of range"
                    )));
                }
            }
        }

        Ok(Self {
            scales,
            config,
            statistics: HierarchyStatistics::default(),
        })
    }

    /// Builds a hierarchy with up to `num_scales` scales, stopping early when
    /// no further landmarks can be selected.
    ///
    /// # Errors
    /// See [`Hierarchy::initialize`].
    pub fn build(
        data: ArrayView2<f32>,
        config: HierarchyConfiguration,
        num_scales: usize,
    ) -> Result<Self, HsneError> {
        let mut hierarchy = Self::initialize(data, config)?;
        while hierarchy.num_scales() < num_scales && hierarchy.grow()? {}
        Ok(hierarchy)
    }

    /// Builds a hierarchy whose coarsest scale has at most `max_points`
    /// landmarks, or as close to it as the data allows.
    ///
    /// # Errors
    /// See [`Hierarchy::initialize`].
    pub fn build_with_max_points(
        data: ArrayView2<f32>,
        config: HierarchyConfiguration,
        max_points: usize,
    ) -> Result<Self, HsneError> {
        let mut hierarchy = Self::initialize(data, config)?;
        while hierarchy.top_scale().len() > max_points && hierarchy.grow()? {}
        Ok(hierarchy)
    }

    /// Adds a scale if possible, returning whether one was added.
    fn grow(&mut self) -> Result<bool, HsneError> {
        if self.top_scale().len() <= 1 {
            return Ok(false);
        }
        match self.add_scale()? {
            AddScaleOutcome::Added { .. } => Ok(true),
            AddScaleOutcome::NoLandmarks => {
                warn!(
                    num_scales = self.num_scales(),
                    "No landmark qualified, hierarchy growth stopped"
                );
                Ok(false)
            }
        }
    }

    /// Number of scales, including scale 0.
    pub fn num_scales(&self) -> usize {
        self.scales.len()
    }

    /// Number of original data points.
    pub fn num_data_points(&self) -> usize {
        self.scales[0].len()
    }

    /// All scales, finest first.
    pub fn scales(&self) -> &[Scale] {
        &self.scales
    }

    /// The scale with id `scale_id`.
    ///
    /// # Errors
    /// * `HsneError::InvalidScale` if it does not exist
    pub fn scale(&self, scale_id: usize) -> Result<&Scale, HsneError> {
        self.scales.get(scale_id).ok_or(HsneError::InvalidScale {
            scale: scale_id,
            num_scales: self.scales.len(),
        })
    }

    /// The coarsest scale.
    pub fn top_scale(&self) -> &Scale {
        &self.scales[self.scales.len() - 1]
    }

    /// Id of the coarsest scale.
    pub fn top_scale_id(&self) -> usize {
        self.scales.len() - 1
    }

    /// Parameters used to build the hierarchy.
    pub fn config(&self) -> &HierarchyConfiguration {
        &self.config
    }

    /// Construction timings.
    pub fn statistics(&self) -> &HierarchyStatistics {
        &self.statistics
    }

    /// Appends a coarser scale built from the current top scale.
    ///
    /// # Errors
    /// * `HsneError::ScaleTooSmall` if the top scale has at most one landmark
    #[allow(clippy::cast_precision_loss)]
    pub fn add_scale(&mut self) -> Result<AddScaleOutcome, HsneError> {
        let scale_id = self.scales.len();
        let prev = self.top_scale();
        let n_prev = prev.len();
        if n_prev <= 1 {
            return Err(HsneError::ScaleTooSmall {
                scale: scale_id - 1,
                num_landmarks: n_prev,
            });
        }

        let config = &self.config;
        let base_seed = config.seed.map_or_else(
            || rand::thread_rng().gen::<u64>(),
            |seed| seed.wrapping_add((scale_id as u64) << 32),
        );
        debug!(scale = scale_id, n_prev, "Adding scale");

        let start = Instant::now();
        let visits = landmark_visit_counts(prev, config, base_seed);
        let total_visits: u64 = visits.iter().map(|&v| u64::from(v)).sum();
        let threshold =
            f64::from(config.mcmcs_landmark_thresh) * total_visits as f64 / n_prev as f64;
        let landmarks: Vec<u32> = visits
            .iter()
            .enumerate()
            .filter(|&(_, &count)| f64::from(count) > threshold)
            .map(|(d, _)| d as u32)
            .collect();
        let landmark_selection_time = start.elapsed();

        if landmarks.is_empty() {
            info!(scale = scale_id, threshold, total_visits, "No node qualified as landmark");
            return Ok(AddScaleOutcome::NoLandmarks);
        }

        let num_landmarks = landmarks.len();
        let mut parent_to_landmark_idx = vec![None; n_prev];
        for (l, &d) in landmarks.iter().enumerate() {
            parent_to_landmark_idx[d as usize] = Some(l as u32);
        }
        let landmark_to_original_idx: Vec<u32> = landmarks
            .iter()
            .map(|&d| prev.landmark_to_original_idx[d as usize])
            .collect();

        let start = Instant::now();
        let area_of_influence = compute_area_of_influence(
            prev,
            &parent_to_landmark_idx,
            config,
            base_seed.wrapping_add(n_prev as u64),
        );
        let inverse_aoi = area_of_influence.transpose(num_landmarks);
        let landmark_weight: Vec<f32> = inverse_aoi
            .rows()
            .par_iter()
            .map(|row| {
                row.iter()
                    .map(|(d, v)| f64::from(v) * f64::from(prev.landmark_weight[d as usize]))
                    .sum::<f64>() as f32
            })
            .collect();
        let aoi_time = start.elapsed();

        let start = Instant::now();
        let transition_matrix =
            compute_transition_matrix(&area_of_influence, &inverse_aoi, &prev.landmark_weight, config);
        let transition_time = start.elapsed();

        let stats = ScaleStatistics {
            num_landmarks,
            landmark_selection_time,
            landmark_selection_num_walks: n_prev * config.mcmcs_num_walks,
            aoi_time,
            aoi_num_walks: n_prev * config.num_walks_per_landmark,
            transition_time,
            aoi_sparsity: sparsity(&area_of_influence, num_landmarks),
            transition_sparsity: sparsity(&transition_matrix, num_landmarks),
        };
        info!(
            scale = scale_id,
            num_landmarks,
            n_prev,
            ?landmark_selection_time,
            ?aoi_time,
            ?transition_time,
            "Scale added"
        );

        self.scales.push(Scale {
            transition_matrix,
            landmark_to_parent_idx: landmarks,
            landmark_to_original_idx,
            parent_to_landmark_idx,
            landmark_weight,
            area_of_influence,
        });
        self.statistics.scales.push(stats);

        Ok(AddScaleOutcome::Added { num_landmarks })
    }

    /// Previous-scale nodes influenced by the `selection` of landmarks at
    /// `scale_id`, with the summed influence of the selected landmarks.
    ///
    /// # Errors
    /// * `HsneError::NoFinerScale` if `scale_id` is 0
    /// * `HsneError::InvalidScale` if `scale_id` does not exist
    /// * `HsneError::IndexOutOfRange` if a selected landmark does not exist
    pub fn influenced_landmarks_in_previous_scale(
        &self,
        scale_id: usize,
        selection: &[u32],
    ) -> Result<SparseRow, HsneError> {
        if scale_id == 0 {
            return Err(HsneError::NoFinerScale);
        }
        let scale = self.scale(scale_id)?;
        let selected = selection_mask(selection, scale.len())?;

        let influenced: Vec<(u32, f32)> = scale
            .area_of_influence
            .rows()
            .par_iter()
            .enumerate()
            .filter_map(|(d, row)| {
                let prob: f32 = row
                    .iter()
                    .filter(|&(l, _)| selected[l as usize])
                    .map(|(_, v)| v)
                    .sum();
                (prob > 0.0).then_some((d as u32, prob))
            })
            .collect();

        Ok(SparseRow::from_entries(influenced))
    }

    /// Influence of a `selection` of landmarks at `scale_id` on every original
    /// data point, in `[0, 1]`.
    ///
    /// At scale 0 this is the indicator vector of the selection; above, the
    /// selection is propagated down through every area-of-influence matrix.
    ///
    /// # Errors
    /// * `HsneError::InvalidScale` if `scale_id` does not exist
    /// * `HsneError::IndexOutOfRange` if a selected landmark does not exist
    pub fn area_of_influence(
        &self,
        scale_id: usize,
        selection: &[u32],
    ) -> Result<Vec<f32>, HsneError> {
        let scale = self.scale(scale_id)?;
        let mut influence: Vec<f32> = selection_mask(selection, scale.len())?
            .into_iter()
            .map(|s| if s { 1.0 } else { 0.0 })
            .collect();

        for s in (1..=scale_id).rev() {
            influence = self.scales[s].area_of_influence.mul_vector(&influence);
        }

        for v in &mut influence {
            *v = v.clamp(0.0, 1.0);
        }
        Ok(influence)
    }

    /// For every data point, its influence distribution over the landmarks of
    /// `scale_id`. Used to place data points relative to landmark positions.
    ///
    /// # Errors
    /// * `HsneError::InvalidScale` if `scale_id` does not exist
    pub fn interpolation_weights(&self, scale_id: usize) -> Result<SparseMatrix, HsneError> {
        self.scale(scale_id)?;
        Ok((0..self.num_data_points() as u32)
            .into_par_iter()
            .map(|i| self.chain_influence(SparseRow::from_entries([(i, 1.0)]), 0, scale_id))
            .collect::<Vec<_>>()
            .into())
    }

    /// For each node of `subset` at `orig_scale`, its influence distribution
    /// over the landmarks of the coarser `dest_scale`.
    ///
    /// # Errors
    /// * `HsneError::InvalidScale` if `dest_scale` does not exist or is not
    ///   coarser than `orig_scale`
    /// * `HsneError::IndexOutOfRange` if a node of `subset` does not exist
    pub fn stochastic_location_at_higher_scale(
        &self,
        orig_scale: usize,
        dest_scale: usize,
        subset: &[u32],
    ) -> Result<SparseMatrix, HsneError> {
        self.scale(dest_scale)?;
        if dest_scale <= orig_scale {
            return Err(HsneError::InvalidScale {
                scale: dest_scale,
                num_scales: self.num_scales(),
            });
        }
        let len = self.scales[orig_scale].len();
        if let Some(&bad) = subset.iter().find(|&&i| i as usize >= len) {
            return Err(HsneError::IndexOutOfRange {
                index: bad as usize,
                len,
            });
        }

        Ok(subset
            .par_iter()
            .map(|&i| self.chain_influence(SparseRow::from_entries([(i, 1.0)]), orig_scale, dest_scale))
            .collect::<Vec<_>>()
            .into())
    }

    /// Landmarks influencing data point `dp` at every scale.
    ///
    /// Entry `s` maps landmarks of scale `s` to their influence on `dp`. Above
    /// scale 1 only landmarks with influence of at least `thresh` are
    /// propagated further. With `normalized`, every scale sums to one.
    ///
    /// # Errors
    /// * `HsneError::IndexOutOfRange` if `dp` is not a data point
    pub fn influence_on_data_point(
        &self,
        dp: u32,
        thresh: f32,
        normalized: bool,
    ) -> Result<Vec<SparseRow>, HsneError> {
        let n = self.num_data_points();
        if dp as usize >= n {
            return Err(HsneError::IndexOutOfRange {
                index: dp as usize,
                len: n,
            });
        }

        let mut influence = vec![SparseRow::from_entries([(dp, 1.0)])];
        for s in 1..self.num_scales() {
            let mut previous = influence[s - 1].clone();
            if s > 1 {
                previous.retain(|_, v| v >= thresh);
            }
            let mut current = self.chain_influence(previous, s - 1, s);
            if normalized {
                current.normalize();
            }
            influence.push(current);
        }
        Ok(influence)
    }

    /// Composes the areas of influence of scales `from+1..=to`, mapping a
    /// distribution over nodes of scale `from` to one over landmarks of `to`.
    fn chain_influence(&self, mut row: SparseRow, from: usize, to: usize) -> SparseRow {
        for s in from + 1..=to {
            let aoi = &self.scales[s].area_of_influence;
            let mut next: HashMap<u32, f32> = HashMap::new();
            for (node, w) in row.iter() {
                if let Some(links) = aoi.row(node as usize) {
                    for (l, v) in links.iter() {
                        *next.entry(l).or_insert(0.0) += w * v;
                    }
                }
            }
            row = SparseRow::from(next);
        }
        row
    }
}

/// Endpoint visit counts of the landmark selection walks.
fn landmark_visit_counts(prev: &Scale, config: &HierarchyConfiguration, seed: u64) -> Vec<u32> {
    let n = prev.len();
    (0..n)
        .into_par_iter()
        .fold(
            || vec![0_u32; n],
            |mut counts, d| {
                let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(d as u64));
                for _ in 0..config.mcmcs_num_walks {
                    if let Some(end) = random_walk(
                        &prev.transition_matrix,
                        d as u32,
                        config.mcmcs_walk_length,
                        &mut rng,
                    ) {
                        counts[end as usize] += 1;
                    }
                }
                counts
            },
        )
        .reduce(
            || vec![0_u32; n],
            |mut a, b| {
                a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
                a
            },
        )
}

/// Fraction of walks from each previous-scale node that first reach each
/// landmark.
#[allow(clippy::cast_precision_loss)]
fn compute_area_of_influence(
    prev: &Scale,
    parent_to_landmark_idx: &[Option<u32>],
    config: &HierarchyConfiguration,
    seed: u64,
) -> SparseMatrix {
    let walks = config.num_walks_per_landmark;
    let is_landmark = |node: u32| {
        parent_to_landmark_idx
            .get(node as usize)
            .is_some_and(Option::is_some)
    };

    (0..prev.len())
        .into_par_iter()
        .map(|d| {
            let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(d as u64));
            let mut hits: HashMap<u32, u32> = HashMap::new();
            for _ in 0..walks {
                let end = random_walk_until(
                    &prev.transition_matrix,
                    d as u32,
                    config.aoi_max_walk_length,
                    is_landmark,
                    &mut rng,
                );
                if let Some(l) = end.and_then(|node| parent_to_landmark_idx[node as usize]) {
                    *hits.entry(l).or_insert(0) += 1;
                }
            }
            hits.into_iter()
                .map(|(l, count)| (l, count as f32 / walks as f32))
                .collect::<SparseRow>()
        })
        .collect::<Vec<_>>()
        .into()
}

/// Similarity between landmarks from the overlap of their areas of influence.
///
/// Normalized entries below `prune_thresh / num_landmarks`, or below
/// `transition_min_value` when that is larger, are dropped and the row is
/// renormalized. A row that would lose every entry is kept unpruned.
#[allow(clippy::cast_precision_loss)]
fn compute_transition_matrix(
    aoi: &SparseMatrix,
    inverse_aoi: &SparseMatrix,
    prev_weight: &[f32],
    config: &HierarchyConfiguration,
) -> SparseMatrix {
    let single_landmark_thresh = config.transition_matrix_prune_thresh / 100.0;
    let num_landmarks = inverse_aoi.len().max(1) as f32;
    let min_value = config
        .transition_min_value
        .max(config.transition_matrix_prune_thresh / num_landmarks);

    inverse_aoi
        .rows()
        .par_iter()
        .enumerate()
        .map(|(l, influenced)| {
            let mut row: HashMap<u32, f32> = HashMap::new();
            for (d, aoi_d_l) in influenced.iter() {
                if aoi_d_l <= single_landmark_thresh {
                    continue;
                }
                let weight = prev_weight[d as usize];
                for (l2, aoi_d_l2) in aoi[d as usize].iter() {
                    if l2 as usize == l || aoi_d_l2 <= single_landmark_thresh {
                        continue;
                    }
                    *row.entry(l2).or_insert(0.0) += aoi_d_l * aoi_d_l2 * weight;
                }
            }

            let mut row = SparseRow::from(row);
            row.normalize();

            let mut pruned = row.clone();
            pruned.retain(|_, v| v >= min_value);
            if pruned.is_empty() {
                row
            } else {
                pruned.normalize();
                pruned
            }
        })
        .collect::<Vec<_>>()
        .into()
}

#[allow(clippy::cast_precision_loss)]
fn sparsity(matrix: &SparseMatrix, num_cols: usize) -> f32 {
    let total = matrix.len() * num_cols;
    if total == 0 {
        return 1.0;
    }
    1.0 - matrix.num_nonzeros() as f32 / total as f32
}

/// Boolean mask of `selection` over `len` landmarks.
fn selection_mask(selection: &[u32], len: usize) -> Result<Vec<bool>, HsneError> {
    let mut mask = vec![false; len];
    for &i in selection {
        *mask.get_mut(i as usize).ok_or(HsneError::IndexOutOfRange {
            index: i as usize,
            len,
        })? = true;
    }
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::gaussian_blobs;
    use approx::assert_abs_diff_eq;

    fn config() -> HierarchyConfiguration {
        HierarchyConfiguration::builder()
            .calibration(CalibrationConfiguration::builder().perplexity(10.0).build())
            .seed(17)
            .build()
    }

    fn two_scale_hierarchy() -> Hierarchy {
        let data = gaussian_blobs(3, 50, 5, 20.0, 1);
        let mut hierarchy = Hierarchy::initialize(data.view(), config()).expect("initialize");
        let outcome = hierarchy.add_scale().expect("add_scale");
        assert!(matches!(outcome, AddScaleOutcome::Added { .. }), "{outcome:?}");
        hierarchy
    }

    fn transition_rows(aoi: Vec<SparseRow>, num_landmarks: usize, prune_thresh: f32) -> SparseMatrix {
        let aoi: SparseMatrix = aoi.into();
        let inverse_aoi = aoi.transpose(num_landmarks);
        let weights = vec![1.0; aoi.len()];
        let config = HierarchyConfiguration::builder()
            .transition_matrix_prune_thresh(prune_thresh)
            .build();
        compute_transition_matrix(&aoi, &inverse_aoi, &weights, &config)
    }

    #[test]
    fn test_transition_entries_below_landmark_share_are_pruned() {
        let transitions = transition_rows(
            vec![
                SparseRow::from_entries([(0, 0.5), (1, 0.5)]),
                SparseRow::from_entries([(0, 0.4), (2, 0.6)]),
                SparseRow::from_entries([(0, 0.9), (3, 0.1)]),
                SparseRow::from_entries([(1, 0.5), (2, 0.5)]),
            ],
            4,
            1.5,
        );

        // Landmark 3 holds 0.09 / 0.58 of the row, below 1.5 / 4
        let row = &transitions[0];
        assert_eq!(row.get(3), None);
        assert_abs_diff_eq!(row.get(1).unwrap(), 0.25 / 0.49, epsilon = 1e-5);
        assert_abs_diff_eq!(row.get(2).unwrap(), 0.24 / 0.49, epsilon = 1e-5);
        for row in transitions.iter() {
            assert!(!row.is_empty());
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_transition_row_below_cut_is_kept_whole() {
        // Cut 2.0 / 3 is above every entry of these balanced rows
        let transitions = transition_rows(
            vec![
                SparseRow::from_entries([(0, 0.5), (1, 0.5)]),
                SparseRow::from_entries([(0, 0.5), (2, 0.5)]),
                SparseRow::from_entries([(1, 0.5), (2, 0.5)]),
            ],
            3,
            2.0,
        );

        for row in transitions.iter() {
            assert_eq!(row.len(), 2);
            assert!(row.iter().all(|(_, v)| (v - 0.5).abs() < 1e-6));
        }
    }

    #[test]
    fn test_scale_zero_is_identity() {
        let data = gaussian_blobs(3, 50, 5, 20.0, 1);
        let hierarchy = Hierarchy::initialize(data.view(), config()).expect("initialize");
        let scale = hierarchy.top_scale();

        assert_eq!(hierarchy.num_scales(), 1);
        assert_eq!(scale.len(), 150);
        assert_eq!(scale.landmark_to_original_idx[42], 42);
        assert!(scale.landmark_weight.iter().all(|&w| w == 1.0));
        for row in scale.transition_matrix.iter() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_add_scale_invariants() {
        let hierarchy = two_scale_hierarchy();
        let prev = &hierarchy.scales()[0];
        let scale = hierarchy.top_scale();
        let n = scale.len();

        assert!(n > 0 && n < prev.len(), "landmarks: {n}");
        assert_eq!(scale.transition_matrix.len(), n);
        assert_eq!(scale.area_of_influence.len(), prev.len());

        for (l, &parent) in scale.landmark_to_parent_idx.iter().enumerate() {
            assert_eq!(scale.parent_to_landmark_idx[parent as usize], Some(l as u32));
            assert_eq!(scale.landmark_to_original_idx[l], parent);
        }

        for row in scale.transition_matrix.iter().filter(|r| !r.is_empty()) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-4);
            assert!(row.iter().all(|(j, _)| (j as usize) < n));
        }

        for row in scale.area_of_influence.iter() {
            assert!(row.sum() <= 1.0 + 1e-5);
            assert!(row.iter().all(|(_, v)| v > 0.0));
        }

        let total_weight: f32 = scale.landmark_weight.iter().sum();
        assert!(total_weight > 0.0 && total_weight <= prev.len() as f32 + 1e-3);

        assert_eq!(hierarchy.statistics().scales.len(), 1);
        hierarchy.statistics().log();
    }

    #[test]
    fn test_walks_are_reproducible() {
        let a = two_scale_hierarchy();
        let b = two_scale_hierarchy();
        assert_eq!(a.top_scale(), b.top_scale());
    }

    #[test]
    fn test_no_landmarks_leaves_hierarchy_unchanged() {
        let data = gaussian_blobs(2, 40, 4, 20.0, 2);
        let config = HierarchyConfiguration::builder()
            .calibration(CalibrationConfiguration::builder().perplexity(5.0).build())
            .mcmcs_landmark_thresh(1_000.0)
            .seed(3)
            .build();
        let mut hierarchy = Hierarchy::initialize(data.view(), config).expect("initialize");

        assert_eq!(hierarchy.add_scale().expect("add_scale"), AddScaleOutcome::NoLandmarks);
        assert_eq!(hierarchy.num_scales(), 1);
    }

    #[test]
    fn test_single_landmark_scale_cannot_grow() {
        let scale0 = Scale::identity(
            vec![
                SparseRow::from_entries([(1, 1.0)]),
                SparseRow::from_entries([(0, 1.0)]),
            ]
            .into(),
        );
        let scale1 = Scale {
            transition_matrix: vec![SparseRow::new()].into(),
            landmark_to_parent_idx: vec![0],
            landmark_to_original_idx: vec![0],
            parent_to_landmark_idx: vec![Some(0), None],
            landmark_weight: vec![2.0],
            area_of_influence: vec![
                SparseRow::from_entries([(0, 1.0)]),
                SparseRow::from_entries([(0, 1.0)]),
            ]
            .into(),
        };
        let mut hierarchy =
            Hierarchy::from_scales(vec![scale0, scale1], HierarchyConfiguration::default())
                .expect("valid scales");

        let err = hierarchy.add_scale().expect_err("must refuse");
        assert!(matches!(err, HsneError::ScaleTooSmall { scale: 1, num_landmarks: 1 }));
        assert_eq!(hierarchy.num_scales(), 2);

        // Selecting the only landmark covers both data points
        let aoi = hierarchy.area_of_influence(1, &[0]).expect("aoi");
        assert_eq!(aoi, vec![1.0, 1.0]);
    }

    #[test]
    fn test_area_of_influence() {
        let hierarchy = two_scale_hierarchy();
        let n = hierarchy.num_data_points();

        let aoi0 = hierarchy.area_of_influence(0, &[3, 7]).expect("scale 0");
        assert_eq!(aoi0.len(), n);
        assert_eq!(aoi0[3], 1.0);
        assert_eq!(aoi0[0], 0.0);

        let all: Vec<u32> = (0..hierarchy.top_scale().len() as u32).collect();
        let aoi1 = hierarchy.area_of_influence(1, &all).expect("scale 1");
        assert!(aoi1.iter().all(|&v| (0.0..=1.0).contains(&v)));
        // Selecting every landmark yields the share of walks that reached one
        for (d, row) in hierarchy.top_scale().area_of_influence.iter().enumerate() {
            assert_abs_diff_eq!(aoi1[d], row.sum() as f32, epsilon = 1e-5);
        }

        assert!(matches!(
            hierarchy.area_of_influence(5, &[0]),
            Err(HsneError::InvalidScale { .. })
        ));
        assert!(matches!(
            hierarchy.area_of_influence(1, &[10_000]),
            Err(HsneError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_influenced_landmarks_match_area_of_influence() {
        let hierarchy = two_scale_hierarchy();
        let influenced = hierarchy
            .influenced_landmarks_in_previous_scale(1, &[0])
            .expect("influenced");
        let aoi = hierarchy.area_of_influence(1, &[0]).expect("aoi");

        for (d, prob) in influenced.iter() {
            assert_abs_diff_eq!(prob, aoi[d as usize], epsilon = 1e-6);
        }
        assert!(matches!(
            hierarchy.influenced_landmarks_in_previous_scale(0, &[0]),
            Err(HsneError::NoFinerScale)
        ));
    }

    #[test]
    fn test_interpolation_and_influence_queries() {
        let hierarchy = two_scale_hierarchy();
        let weights = hierarchy.interpolation_weights(1).expect("weights");
        assert_eq!(weights.len(), hierarchy.num_data_points());
        assert_eq!(weights[5], hierarchy.top_scale().area_of_influence[5]);

        let location = hierarchy
            .stochastic_location_at_higher_scale(0, 1, &[5, 9])
            .expect("location");
        assert_eq!(location[0], weights[5]);
        assert_eq!(location[1], weights[9]);

        let influence = hierarchy.influence_on_data_point(5, 0.0, true).expect("influence");
        assert_eq!(influence.len(), 2);
        assert_eq!(influence[0].get(5), Some(1.0));
        if !influence[1].is_empty() {
            assert_abs_diff_eq!(influence[1].sum(), 1.0, epsilon = 1e-5);
        }

        assert!(hierarchy.stochastic_location_at_higher_scale(1, 1, &[0]).is_err());
    }
}
