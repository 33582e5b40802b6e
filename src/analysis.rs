//! Analyses: independently embedded subsets of one scale.
//!
//! An [`Analysis`] is owned by the [`MultiscaleAnalysisManager`] and addressed
//! by an [`AnalysisId`] handle. It maps each of its rows to a landmark of its
//! scale, carries the landmark weights, a t-SNE optimizer and per-point flags
//! written by the interaction layer.
//!
//! [`MultiscaleAnalysisManager`]: crate::manager::MultiscaleAnalysisManager

use crate::tsne::Tsne;
use crate::HsneError;
use ndarray::{Array2, ArrayView2};
use std::collections::BTreeSet;
use std::fmt;

/// Handle of an analysis: its scale and its position among the analyses of
/// that scale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnalysisId {
    /// Scale the analysis embeds
    pub scale: usize,
    /// Index among the analyses of the scale
    pub analysis: usize,
}

impl AnalysisId {
    /// Creates a handle.
    pub const fn new(scale: usize, analysis: usize) -> Self {
        Self { scale, analysis }
    }
}

impl fmt::Display for AnalysisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}/A{}", self.scale, self.analysis)
    }
}

/// Per-point flag bits set by the interaction layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PointFlags(u32);

impl PointFlags {
    /// The point is part of the current selection.
    pub const SELECTED: Self = Self(1);
    /// The point is highlighted, e.g. by a linked view.
    pub const HIGHLIGHTED: Self = Self(1 << 1);

    /// No flag set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bit pattern.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clears the bits of `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Sets or clears the bits of `other`.
    pub fn set(&mut self, other: Self, value: bool) {
        if value {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }

    /// Shorthand for `contains(PointFlags::SELECTED)`.
    pub const fn is_selected(self) -> bool {
        self.contains(Self::SELECTED)
    }
}

/// Named subset of the landmarks of one scale.
#[derive(Clone, Debug, PartialEq)]
pub struct Cluster {
    /// Display name
    pub name: String,
    /// Display color as RGB
    pub color: [u8; 3],
    /// Scale-local landmark indices
    pub members: BTreeSet<u32>,
}

/// Opaque per-point payload of the data panel, used by viewers only.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum PointAnnotation {
    /// Position in a volume
    Voxel {
        /// Column
        x: u32,
        /// Row
        y: u32,
        /// Slice
        z: u32,
    },

    /// Position in an image
    Pixel {
        /// Column
        x: u32,
        /// Row
        y: u32,
    },

    /// Small grayscale image, row-major
    Image {
        /// Width in pixels
        width: u32,
        /// Height in pixels
        height: u32,
        /// Intensities
        pixels: Vec<u8>,
    },

    /// Free text
    Text(String),
}

/// Feature vectors of all data points plus optional annotations.
#[derive(Clone, Debug)]
pub struct PanelData {
    features: Array2<f32>,
    annotations: Option<Vec<PointAnnotation>>,
}

impl PanelData {
    /// Wraps a feature matrix, one row per data point.
    pub fn new(features: Array2<f32>) -> Self {
        Self {
            features,
            annotations: None,
        }
    }

    /// Wraps a feature matrix with one annotation per data point.
    ///
    /// # Errors
    /// * `HsneError::LengthMismatch` if the counts disagree
    pub fn with_annotations(
        features: Array2<f32>,
        annotations: Vec<PointAnnotation>,
    ) -> Result<Self, HsneError> {
        if annotations.len() != features.nrows() {
            return Err(HsneError::LengthMismatch {
                expected: features.nrows(),
                actual: annotations.len(),
            });
        }
        Ok(Self {
            features,
            annotations: Some(annotations),
        })
    }

    /// Feature matrix.
    pub fn features(&self) -> ArrayView2<f32> {
        self.features.view()
    }

    /// Number of data points.
    pub fn len(&self) -> usize {
        self.features.nrows()
    }

    /// Returns `true` if there is no data point.
    pub fn is_empty(&self) -> bool {
        self.features.nrows() == 0
    }

    /// Number of features per point.
    pub fn num_dimensions(&self) -> usize {
        self.features.ncols()
    }

    /// Annotation of data point `i`, if annotations are present.
    pub fn annotation(&self, i: usize) -> Option<&PointAnnotation> {
        self.annotations.as_ref().and_then(|a| a.get(i))
    }
}

/// One embedded subset of a scale.
#[derive(Clone, Debug)]
pub struct Analysis {
    id: AnalysisId,
    parent: Option<AnalysisId>,
    scale_indices: Vec<u32>,
    landmark_weight: Vec<f32>,
    parent_selection: Vec<u32>,
    flags: Vec<PointFlags>,
    tsne: Tsne,
}

impl Analysis {
    pub(crate) fn new(
        id: AnalysisId,
        parent: Option<AnalysisId>,
        scale_indices: Vec<u32>,
        landmark_weight: Vec<f32>,
        parent_selection: Vec<u32>,
        tsne: Tsne,
    ) -> Self {
        let n = scale_indices.len();
        Self {
            id,
            parent,
            scale_indices,
            landmark_weight,
            parent_selection,
            flags: vec![PointFlags::empty(); n],
            tsne,
        }
    }

    /// Handle of this analysis.
    pub fn id(&self) -> AnalysisId {
        self.id
    }

    /// Analysis this one was drilled down from.
    pub fn parent(&self) -> Option<AnalysisId> {
        self.parent
    }

    /// Scale of the embedded landmarks.
    pub fn scale(&self) -> usize {
        self.id.scale
    }

    /// Number of embedded points.
    pub fn len(&self) -> usize {
        self.scale_indices.len()
    }

    /// Returns `true` if nothing is embedded.
    pub fn is_empty(&self) -> bool {
        self.scale_indices.is_empty()
    }

    /// Scale-local landmark index of every row.
    pub fn scale_indices(&self) -> &[u32] {
        &self.scale_indices
    }

    /// Weight of every row's landmark.
    pub fn landmark_weight(&self) -> &[f32] {
        &self.landmark_weight
    }

    /// Rows of the parent analysis whose selection produced this analysis.
    pub fn parent_selection(&self) -> &[u32] {
        &self.parent_selection
    }

    /// Current embedding coordinates.
    pub fn embedding(&self) -> ArrayView2<f32> {
        self.tsne.embedding()
    }

    /// The optimizer of this analysis.
    pub fn tsne(&self) -> &Tsne {
        &self.tsne
    }

    /// Iterations performed so far.
    pub fn iteration(&self) -> usize {
        self.tsne.iteration()
    }

    /// Performs one t-SNE iteration.
    pub fn do_an_iteration(&mut self) {
        self.tsne.do_an_iteration();
    }

    /// Flags of every row.
    pub fn flags(&self) -> &[PointFlags] {
        &self.flags
    }

    /// Mutable flags of every row.
    pub fn flags_mut(&mut self) -> &mut [PointFlags] {
        &mut self.flags
    }

    /// Replaces the selection with `rows`.
    ///
    /// # Errors
    /// * `HsneError::IndexOutOfRange` if a row does not exist; the previous
    ///   selection is kept
    pub fn select(&mut self, rows: &[usize]) -> Result<(), HsneError> {
        let len = self.len();
        if let Some(&bad) = rows.iter().find(|&&r| r >= len) {
            return Err(HsneError::IndexOutOfRange { index: bad, len });
        }
        self.clear_selection();
        for &r in rows {
            self.flags[r].insert(PointFlags::SELECTED);
        }
        Ok(())
    }

    /// Clears the selection flag of every row.
    pub fn clear_selection(&mut self) {
        for f in &mut self.flags {
            f.remove(PointFlags::SELECTED);
        }
    }

    /// Selected rows, ascending.
    pub fn selection(&self) -> Vec<u32> {
        self.flags
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_selected())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Scale-local landmark indices of the selected rows.
    pub fn selected_scale_indices(&self) -> Vec<u32> {
        self.flags
            .iter()
            .zip(&self.scale_indices)
            .filter(|(f, _)| f.is_selected())
            .map(|(_, &idx)| idx)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::{SparseMatrix, SparseRow};
    use crate::tsne::TsneConfiguration;

    fn analysis() -> Analysis {
        let p: SparseMatrix = (0..4)
            .map(|i| SparseRow::from_entries([((i + 1) % 4, 1.0)]))
            .collect();
        let tsne = Tsne::initialize(&p, TsneConfiguration::default()).expect("initialize");
        Analysis::new(
            AnalysisId::new(1, 0),
            None,
            vec![10, 11, 12, 13],
            vec![2.0; 4],
            Vec::new(),
            tsne,
        )
    }

    #[test]
    fn test_point_flags() {
        let mut flags = PointFlags::empty();
        assert!(!flags.is_selected());
        flags.insert(PointFlags::SELECTED);
        flags.set(PointFlags::HIGHLIGHTED, true);
        assert!(flags.is_selected());
        assert_eq!(flags.bits(), 3);
        flags.remove(PointFlags::SELECTED);
        assert!(!flags.is_selected());
        assert!(flags.contains(PointFlags::HIGHLIGHTED));
    }

    #[test]
    fn test_selection() {
        let mut a = analysis();
        a.select(&[1, 3]).expect("select");
        assert_eq!(a.selection(), vec![1, 3]);
        assert_eq!(a.selected_scale_indices(), vec![11, 13]);

        let err = a.select(&[0, 4]);
        assert!(matches!(err, Err(HsneError::IndexOutOfRange { index: 4, len: 4 })));
        assert_eq!(a.selection(), vec![1, 3], "Failed selection keeps the old one");

        a.clear_selection();
        assert!(a.selection().is_empty());
    }

    #[test]
    fn test_panel_annotations() {
        let features = Array2::zeros((2, 3));
        assert!(matches!(
            PanelData::with_annotations(features.clone(), vec![PointAnnotation::Text("a".into())]),
            Err(HsneError::LengthMismatch {
                expected: 2,
                actual: 1
            })
        ));

        let panel = PanelData::with_annotations(
            features,
            vec![
                PointAnnotation::Pixel { x: 1, y: 2 },
                PointAnnotation::Text("b".into()),
            ],
        )
        .expect("panel");
        assert_eq!(panel.len(), 2);
        assert_eq!(panel.num_dimensions(), 3);
        assert_eq!(panel.annotation(0), Some(&PointAnnotation::Pixel { x: 1, y: 2 }));
        assert_eq!(panel.annotation(2), None);
        assert_eq!(PanelData::new(Array2::zeros((1, 1))).annotation(0), None);
    }

    #[test]
    fn test_analysis_id_display() {
        assert_eq!(AnalysisId::new(2, 5).to_string(), "S2/A5");
    }
}
