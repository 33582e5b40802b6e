//! Multiscale analysis manager.
//!
//! Owns the data panel, the hierarchy, every analysis and the clusters of
//! each scale. Analyses live in a per-scale arena and are addressed by
//! [`AnalysisId`] handles; observers registered with
//! [`MultiscaleAnalysisManager::register_observer`] are told about new
//! analyses, linked selections and cluster changes.

use crate::analysis::{Analysis, AnalysisId, Cluster, PanelData, PointAnnotation};
use crate::hierarchy::{Hierarchy, HierarchyConfiguration};
use crate::io::{export_analysis, load_hierarchy, save_hierarchy};
use crate::sparse::SparseMatrix;
use crate::tsne::{Tsne, TsneConfiguration};
use crate::HsneError;
use bon::Builder;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

/// Name of the implicit cluster holding every landmark of a scale.
pub const UNCLUSTERED: &str = "Unclustered";

/// Options of the analysis manager.
#[derive(Builder, Clone, Debug)]
pub struct ManagerConfiguration {
    /// Construction of the hierarchy
    #[builder(default)]
    pub hierarchy: HierarchyConfiguration,

    /// Optimizer options of every analysis
    #[builder(default)]
    pub tsne: TsneConfiguration,

    /// Previous-scale nodes are kept by a drill-down when the selection's
    /// influence on them exceeds this value
    #[builder(default = 0.5)]
    pub drill_down_threshold: f32,

    /// Transition weight above which a neighbor of the kept nodes joins the
    /// drilled-down subgraph
    #[builder(default = 0.01)]
    pub subgraph_neighbor_threshold: f32,

    /// Adapt t-SNE accuracy and exaggeration to the size of each analysis.
    ///
    /// When set, `theta`, `exaggeration_factor` and `remove_exaggeration_iter`
    /// of `tsne` are replaced per analysis and `eta` may be lowered, see
    /// [`TsneConfiguration::adapted_to_size`]. Clear it to use `tsne` as given.
    #[builder(default = true)]
    pub adaptive_tsne: bool,
}

impl Default for ManagerConfiguration {
    fn default() -> Self {
        Self {
            hierarchy: HierarchyConfiguration::default(),
            tsne: TsneConfiguration::default(),
            drill_down_threshold: 0.5,
            subgraph_neighbor_threshold: 0.01,
            adaptive_tsne: true,
        }
    }
}

/// Callbacks invoked by the manager. Every method defaults to a no-op.
pub trait AnalysisObserver: Send + Sync {
    /// A new analysis was created.
    fn on_analysis_created(&self, _analysis: &Analysis) {}

    /// The selection of `id` was propagated to the data points.
    fn on_selection_linked(&self, _id: AnalysisId, _influence: &[f32]) {}

    /// The clusters of `scale` changed.
    fn on_clusters_changed(&self, _scale: usize, _clusters: &[Cluster]) {}
}

/// Drives hierarchy construction, embeddings, drill-downs and clusters.
pub struct MultiscaleAnalysisManager {
    config: ManagerConfiguration,
    panel: PanelData,
    hierarchy: Option<Hierarchy>,
    analyses: Vec<Vec<Analysis>>,
    clusters: Vec<Vec<Cluster>>,
    top_level: Option<AnalysisId>,
    observers: Vec<Box<dyn AnalysisObserver>>,
}

impl std::fmt::Debug for MultiscaleAnalysisManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiscaleAnalysisManager")
            .field("num_points", &self.panel.len())
            .field("num_scales", &self.hierarchy.as_ref().map(Hierarchy::num_scales))
            .field("num_analyses", &self.num_analyses())
            .field("num_observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

impl MultiscaleAnalysisManager {
    /// Creates a manager over `panel`. No hierarchy is built yet.
    pub fn new(panel: PanelData, config: ManagerConfiguration) -> Self {
        Self {
            config,
            panel,
            hierarchy: None,
            analyses: Vec::new(),
            clusters: Vec::new(),
            top_level: None,
            observers: Vec::new(),
        }
    }

    /// Builds a hierarchy with up to `num_scales` scales, replacing any
    /// previous hierarchy and analyses.
    ///
    /// # Errors
    /// Any error of [`Hierarchy::build`]; the manager is then unchanged.
    pub fn initialize(&mut self, num_scales: usize) -> Result<(), HsneError> {
        let hierarchy = Hierarchy::build(
            self.panel.features(),
            self.config.hierarchy.clone(),
            num_scales,
        )?;
        self.reset(hierarchy);
        Ok(())
    }

    /// Builds a hierarchy whose top scale has at most `max_points` landmarks.
    ///
    /// # Errors
    /// Any error of [`Hierarchy::build_with_max_points`]; the manager is then
    /// unchanged.
    pub fn initialize_with_max_points(&mut self, max_points: usize) -> Result<(), HsneError> {
        let hierarchy = Hierarchy::build_with_max_points(
            self.panel.features(),
            self.config.hierarchy.clone(),
            max_points,
        )?;
        self.reset(hierarchy);
        Ok(())
    }

    /// Loads a previously saved hierarchy for the current panel.
    ///
    /// # Errors
    /// * `HsneError::SizeMismatch` if the file was built for a different
    ///   number of data points
    /// * Any other error of [`load_hierarchy`]
    pub fn initialize_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), HsneError> {
        let hierarchy = load_hierarchy(path, self.config.hierarchy.clone(), Some(self.panel.len()))?;
        self.reset(hierarchy);
        Ok(())
    }

    /// Saves the hierarchy.
    ///
    /// # Errors
    /// * `HsneError::Uninitialized` if no hierarchy exists
    /// * `HsneError::Io` if writing fails
    pub fn save_hierarchy(&self, path: impl AsRef<Path>) -> Result<(), HsneError> {
        save_hierarchy(self.hierarchy()?, path)
    }

    fn reset(&mut self, hierarchy: Hierarchy) {
        hierarchy.statistics().log();
        self.analyses = vec![Vec::new(); hierarchy.num_scales()];
        self.clusters = hierarchy
            .scales()
            .iter()
            .map(|scale| {
                vec![Cluster {
                    name: UNCLUSTERED.to_string(),
                    color: [128, 128, 128],
                    members: (0..scale.len() as u32).collect(),
                }]
            })
            .collect();
        self.top_level = None;
        self.hierarchy = Some(hierarchy);
    }

    /// Registers an observer.
    pub fn register_observer(&mut self, observer: Box<dyn AnalysisObserver>) {
        self.observers.push(observer);
    }

    /// Manager options.
    pub fn config(&self) -> &ManagerConfiguration {
        &self.config
    }

    /// The data panel.
    pub fn panel(&self) -> &PanelData {
        &self.panel
    }

    /// The hierarchy.
    ///
    /// # Errors
    /// * `HsneError::Uninitialized` if no hierarchy was built or loaded
    pub fn hierarchy(&self) -> Result<&Hierarchy, HsneError> {
        self.hierarchy.as_ref().ok_or(HsneError::Uninitialized)
    }

    /// Handle of the top-level analysis, once created.
    pub fn top_level_analysis(&self) -> Option<AnalysisId> {
        self.top_level
    }

    /// Embeds every landmark of the coarsest scale.
    ///
    /// # Errors
    /// * `HsneError::Uninitialized` if no hierarchy exists
    /// * `HsneError::TopLevelAnalysisExists` if called a second time
    pub fn create_top_level_analysis(&mut self) -> Result<AnalysisId, HsneError> {
        if self.top_level.is_some() {
            return Err(HsneError::TopLevelAnalysisExists);
        }
        let top = self.hierarchy()?.top_scale_id();
        let id = self.create_full_scale_analysis(top)?;
        self.top_level = Some(id);
        Ok(id)
    }

    /// Embeds every landmark of `scale`.
    ///
    /// # Errors
    /// * `HsneError::Uninitialized` if no hierarchy exists
    /// * `HsneError::InvalidScale` if `scale` does not exist
    pub fn create_full_scale_analysis(&mut self, scale_id: usize) -> Result<AnalysisId, HsneError> {
        let scale = self.hierarchy()?.scale(scale_id)?;
        let scale_indices: Vec<u32> = (0..scale.len() as u32).collect();
        let weights = scale.landmark_weight.clone();
        let matrix = scale.transition_matrix.clone();
        self.add_analysis(scale_id, None, scale_indices, weights, Vec::new(), &matrix)
    }

    fn add_analysis(
        &mut self,
        scale_id: usize,
        parent: Option<AnalysisId>,
        scale_indices: Vec<u32>,
        landmark_weight: Vec<f32>,
        parent_selection: Vec<u32>,
        similarities: &SparseMatrix,
    ) -> Result<AnalysisId, HsneError> {
        let mut tsne_config = self.config.tsne.clone();
        if self.config.adaptive_tsne {
            tsne_config = tsne_config.adapted_to_size(scale_indices.len());
            debug!(
                num_points = scale_indices.len(),
                theta = tsne_config.theta,
                exaggeration = tsne_config.exaggeration_factor,
                eta = tsne_config.eta,
                configured_theta = self.config.tsne.theta,
                configured_exaggeration = self.config.tsne.exaggeration_factor,
                configured_eta = self.config.tsne.eta,
                "Adapted t-SNE to analysis size"
            );
        }
        let tsne = Tsne::initialize(similarities, tsne_config)?;

        let num_scales = self.analyses.len();
        let slot = self
            .analyses
            .get_mut(scale_id)
            .ok_or(HsneError::InvalidScale {
                scale: scale_id,
                num_scales,
            })?;
        let id = AnalysisId::new(scale_id, slot.len());
        let analysis = Analysis::new(
            id,
            parent,
            scale_indices,
            landmark_weight,
            parent_selection,
            tsne,
        );
        info!(analysis = %id, ?parent, num_points = analysis.len(), "Analysis created");

        for observer in &self.observers {
            observer.on_analysis_created(&analysis);
        }
        slot.push(analysis);
        Ok(id)
    }

    /// Drills down into the selection of analysis `id`.
    ///
    /// The selected landmarks are mapped to the previous-scale nodes they
    /// influence by more than `drill_down_threshold`; these nodes and their
    /// strongest neighbors form a new analysis one scale below.
    ///
    /// # Errors
    /// * `HsneError::UnknownAnalysis` if `id` does not exist
    /// * `HsneError::NoFinerScale` if the analysis is at scale 0
    /// * `HsneError::EmptySelection` if nothing is selected or the selection
    ///   influences no node strongly enough
    pub fn on_new_analysis_triggered(&mut self, id: AnalysisId) -> Result<AnalysisId, HsneError> {
        let start = Instant::now();
        let parent = self.analysis(id)?;
        if id.scale == 0 {
            return Err(HsneError::NoFinerScale);
        }
        let parent_selection = parent.selection();
        let selected = parent.selected_scale_indices();
        if selected.is_empty() {
            return Err(HsneError::EmptySelection);
        }

        let hierarchy = self.hierarchy()?;
        let threshold = self.config.drill_down_threshold;
        let influenced: Vec<u32> = hierarchy
            .influenced_landmarks_in_previous_scale(id.scale, &selected)?
            .iter()
            .filter(|&(_, v)| v > threshold)
            .map(|(node, _)| node)
            .collect();
        if influenced.is_empty() {
            return Err(HsneError::EmptySelection);
        }

        let child_scale = id.scale - 1;
        let scale = hierarchy.scale(child_scale)?;
        let (matrix, scale_indices) = scale
            .transition_matrix
            .extract_subgraph(&influenced, self.config.subgraph_neighbor_threshold);
        let weights = scale_indices
            .iter()
            .map(|&i| scale.landmark_weight[i as usize])
            .collect();

        debug!(
            parent = %id,
            num_selected = selected.len(),
            num_influenced = influenced.len(),
            num_points = scale_indices.len(),
            elapsed = ?start.elapsed(),
            "Drill-down subgraph extracted"
        );

        self.add_analysis(
            child_scale,
            Some(id),
            scale_indices,
            weights,
            parent_selection,
            &matrix,
        )
    }

    /// Influence of the selection of analysis `id` on every data point, in
    /// `[0, 1]`.
    ///
    /// # Errors
    /// * `HsneError::UnknownAnalysis` if `id` does not exist
    pub fn on_link_selection_to_data_points(&self, id: AnalysisId) -> Result<Vec<f32>, HsneError> {
        let selected = self.analysis(id)?.selected_scale_indices();
        let influence = self.hierarchy()?.area_of_influence(id.scale, &selected)?;
        for observer in &self.observers {
            observer.on_selection_linked(id, &influence);
        }
        Ok(influence)
    }

    /// Turns the selection of analysis `id` into a new cluster of its scale.
    ///
    /// Selected landmarks leave every other cluster except the implicit
    /// unclustered one.
    ///
    /// # Returns
    /// The index of the new cluster.
    ///
    /// # Errors
    /// * `HsneError::UnknownAnalysis` if `id` does not exist
    /// * `HsneError::EmptySelection` if nothing is selected
    pub fn on_clusterize_selection(
        &mut self,
        id: AnalysisId,
        name: impl Into<String>,
        color: [u8; 3],
    ) -> Result<usize, HsneError> {
        let members: BTreeSet<u32> = self.analysis(id)?.selected_scale_indices().into_iter().collect();
        if members.is_empty() {
            return Err(HsneError::EmptySelection);
        }

        let clusters = self
            .clusters
            .get_mut(id.scale)
            .ok_or(HsneError::UnknownAnalysis(id))?;
        for cluster in clusters.iter_mut().skip(1) {
            cluster.members.retain(|m| !members.contains(m));
        }
        clusters.push(Cluster {
            name: name.into(),
            color,
            members,
        });

        let index = clusters.len() - 1;
        for observer in &self.observers {
            observer.on_clusters_changed(id.scale, clusters);
        }
        Ok(index)
    }

    /// Performs one t-SNE iteration on every analysis, analyses in parallel.
    pub fn iterate_all(&mut self) {
        self.analyses
            .par_iter_mut()
            .flat_map(|scale| scale.par_iter_mut())
            .for_each(Analysis::do_an_iteration);
    }

    /// Performs one t-SNE iteration on analysis `id`.
    ///
    /// # Errors
    /// * `HsneError::UnknownAnalysis` if `id` does not exist
    pub fn iterate_analysis(&mut self, id: AnalysisId) -> Result<(), HsneError> {
        self.analysis_mut(id)?.do_an_iteration();
        Ok(())
    }

    /// Analysis `id`.
    ///
    /// # Errors
    /// * `HsneError::UnknownAnalysis` if `id` does not exist
    pub fn analysis(&self, id: AnalysisId) -> Result<&Analysis, HsneError> {
        self.analyses
            .get(id.scale)
            .and_then(|scale| scale.get(id.analysis))
            .ok_or(HsneError::UnknownAnalysis(id))
    }

    /// Mutable analysis `id`, e.g. to set selection flags.
    ///
    /// # Errors
    /// * `HsneError::UnknownAnalysis` if `id` does not exist
    pub fn analysis_mut(&mut self, id: AnalysisId) -> Result<&mut Analysis, HsneError> {
        self.analyses
            .get_mut(id.scale)
            .and_then(|scale| scale.get_mut(id.analysis))
            .ok_or(HsneError::UnknownAnalysis(id))
    }

    /// Analyses of `scale`; empty for a scale without analyses.
    pub fn analyses_at(&self, scale: usize) -> &[Analysis] {
        self.analyses.get(scale).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of analyses.
    pub fn num_analyses(&self) -> usize {
        self.analyses.iter().map(Vec::len).sum()
    }

    /// Clusters of `scale`, the implicit unclustered one first.
    ///
    /// # Errors
    /// * `HsneError::Uninitialized` if no hierarchy exists
    /// * `HsneError::InvalidScale` if `scale` does not exist
    pub fn clusters(&self, scale: usize) -> Result<&[Cluster], HsneError> {
        let num_scales = self.hierarchy()?.num_scales();
        self.clusters
            .get(scale)
            .map(Vec::as_slice)
            .ok_or(HsneError::InvalidScale { scale, num_scales })
    }

    /// Original data indices of the selected points of analysis `id`.
    ///
    /// # Errors
    /// * `HsneError::UnknownAnalysis` if `id` does not exist
    pub fn selection_in_data(&self, id: AnalysisId) -> Result<Vec<u32>, HsneError> {
        let selected = self.analysis(id)?.selected_scale_indices();
        let scale = self.hierarchy()?.scale(id.scale)?;
        Ok(selected
            .iter()
            .map(|&l| scale.landmark_to_original_idx[l as usize])
            .collect())
    }

    /// Annotation of the data point behind every row of analysis `id`.
    ///
    /// # Errors
    /// * `HsneError::UnknownAnalysis` if `id` does not exist
    pub fn annotations(&self, id: AnalysisId) -> Result<Vec<Option<&PointAnnotation>>, HsneError> {
        let original = self.original_indices(id)?;
        Ok(original
            .iter()
            .map(|&o| self.panel.annotation(o as usize))
            .collect())
    }

    /// Original data index of every row of analysis `id`.
    ///
    /// # Errors
    /// * `HsneError::UnknownAnalysis` if `id` does not exist
    pub fn original_indices(&self, id: AnalysisId) -> Result<Vec<u32>, HsneError> {
        let analysis = self.analysis(id)?;
        let scale = self.hierarchy()?.scale(id.scale)?;
        Ok(analysis
            .scale_indices()
            .iter()
            .map(|&l| scale.landmark_to_original_idx[l as usize])
            .collect())
    }

    /// Exports every analysis below `folder`.
    ///
    /// # Errors
    /// * `HsneError::Io` if a file cannot be written
    pub fn export_csv(&self, folder: impl AsRef<Path>) -> Result<(), HsneError> {
        let folder = folder.as_ref();
        for analysis in self.analyses.iter().flatten() {
            let original = self.original_indices(analysis.id())?;
            export_analysis(folder, analysis, &original)?;
        }
        info!(folder = %folder.display(), num_analyses = self.num_analyses(), "Analyses exported");
        Ok(())
    }
}
