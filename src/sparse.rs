//! Sparse rows and matrices used for probability, transition and
//! area-of-influence matrices.
//!
//! A [`SparseRow`] is a vector of `(column, value)` pairs kept sorted by
//! column, which makes lookups logarithmic, keeps memory proportional to the
//! number of stored entries, and gives a stable iteration order for
//! serialization. A [`SparseMatrix`] is an ordered sequence of rows indexed by
//! node id.

use rayon::prelude::*;
use std::collections::HashMap;
use std::ops::Index;

/// Sparse row mapping column indices to weights, sorted by column.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SparseRow {
    entries: Vec<(u32, f32)>,
}

impl SparseRow {
    /// Creates an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty row with room for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Builds a row from unordered entries. Later duplicates of a column
    /// overwrite earlier ones.
    pub fn from_entries(entries: impl IntoIterator<Item = (u32, f32)>) -> Self {
        let mut row = Self::new();
        for (col, value) in entries {
            row.insert(col, value);
        }
        row
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no entry is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value stored for `col`, if any.
    pub fn get(&self, col: u32) -> Option<f32> {
        self.entries
            .binary_search_by_key(&col, |&(c, _)| c)
            .ok()
            .map(|pos| self.entries[pos].1)
    }

    /// Sets the value of `col`, replacing any previous value.
    pub fn insert(&mut self, col: u32, value: f32) {
        match self.entries.binary_search_by_key(&col, |&(c, _)| c) {
            Ok(pos) => self.entries[pos].1 = value,
            Err(pos) => self.entries.insert(pos, (col, value)),
        }
    }

    /// Adds `value` to the entry of `col`, creating it when absent.
    pub fn add(&mut self, col: u32, value: f32) {
        match self.entries.binary_search_by_key(&col, |&(c, _)| c) {
            Ok(pos) => self.entries[pos].1 += value,
            Err(pos) => self.entries.insert(pos, (col, value)),
        }
    }

    /// Removes the entry of `col`, returning its value.
    pub fn remove(&mut self, col: u32) -> Option<f32> {
        self.entries
            .binary_search_by_key(&col, |&(c, _)| c)
            .ok()
            .map(|pos| self.entries.remove(pos).1)
    }

    /// Keeps only the entries for which `keep` returns `true`.
    pub fn retain(&mut self, mut keep: impl FnMut(u32, f32) -> bool) {
        self.entries.retain(|&(c, v)| keep(c, v));
    }

    /// Iterates over `(column, value)` pairs in ascending column order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, f32)> + '_ {
        self.entries.iter().copied()
    }

    /// Mutable access to the values, in ascending column order.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut f32> + '_ {
        self.entries.iter_mut().map(|(_, v)| v)
    }

    /// Sum of all stored values, accumulated in double precision.
    pub fn sum(&self) -> f64 {
        self.entries.iter().map(|&(_, v)| f64::from(v)).sum()
    }

    /// Scales the row so it sums to one. Rows summing to zero are untouched.
    pub fn normalize(&mut self) {
        let sum = self.sum();
        if sum > 0.0 {
            for (_, v) in &mut self.entries {
                *v = (f64::from(*v) / sum) as f32;
            }
        }
    }
}

impl From<HashMap<u32, f32>> for SparseRow {
    fn from(map: HashMap<u32, f32>) -> Self {
        let mut entries: Vec<(u32, f32)> = map.into_iter().collect();
        entries.sort_unstable_by_key(|&(c, _)| c);
        Self { entries }
    }
}

impl FromIterator<(u32, f32)> for SparseRow {
    fn from_iter<I: IntoIterator<Item = (u32, f32)>>(iter: I) -> Self {
        Self::from_entries(iter)
    }
}

/// Ordered sequence of sparse rows, one per node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SparseMatrix {
    rows: Vec<SparseRow>,
}

impl SparseMatrix {
    /// Creates a matrix with `num_rows` empty rows.
    pub fn with_rows(num_rows: usize) -> Self {
        Self {
            rows: vec![SparseRow::new(); num_rows],
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` if the matrix has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row `i`, if present.
    pub fn row(&self, i: usize) -> Option<&SparseRow> {
        self.rows.get(i)
    }

    /// Mutable row `i`, if present.
    pub fn row_mut(&mut self, i: usize) -> Option<&mut SparseRow> {
        self.rows.get_mut(i)
    }

    /// All rows, in node order.
    pub fn rows(&self) -> &[SparseRow] {
        &self.rows
    }

    /// Appends a row.
    pub fn push(&mut self, row: SparseRow) {
        self.rows.push(row);
    }

    /// Iterates over the rows in node order.
    pub fn iter(&self) -> std::slice::Iter<'_, SparseRow> {
        self.rows.iter()
    }

    /// Total number of stored entries.
    pub fn num_nonzeros(&self) -> usize {
        self.rows.iter().map(SparseRow::len).sum()
    }

    /// Sum of every row.
    pub fn row_sums(&self) -> Vec<f64> {
        self.rows.iter().map(SparseRow::sum).collect()
    }

    /// Sum of all stored values.
    pub fn total_sum(&self) -> f64 {
        self.rows.par_iter().map(SparseRow::sum).sum()
    }

    /// Makes every non-empty row sum to one.
    pub fn normalize_rows(&mut self) {
        self.rows.par_iter_mut().for_each(SparseRow::normalize);
    }

    /// Largest column index referenced plus one, or zero for an empty matrix.
    pub fn num_columns(&self) -> usize {
        self.rows
            .iter()
            .filter_map(|row| row.entries.last().map(|&(c, _)| c as usize + 1))
            .max()
            .unwrap_or(0)
    }

    /// Transposes the matrix into one with `num_cols` rows.
    ///
    /// Columns outside `0..num_cols` are dropped.
    pub fn transpose(&self, num_cols: usize) -> SparseMatrix {
        let mut transposed = SparseMatrix::with_rows(num_cols);
        for (i, row) in self.rows.iter().enumerate() {
            for (j, v) in row.iter() {
                if let Some(target) = transposed.rows.get_mut(j as usize) {
                    // Rows are visited in ascending order, so pushes stay sorted
                    target.entries.push((i as u32, v));
                }
            }
        }
        transposed
    }

    /// Symmetrizes a square matrix: `S[i][j] = S[j][i] = (M[i][j] + M[j][i]) / 2`.
    ///
    /// Entries present on only one side are paired with an implicit zero.
    /// The operation is idempotent.
    pub fn symmetrize(&self) -> SparseMatrix {
        let n = self.len().max(self.num_columns());
        let transposed = self.transpose(n);

        let rows = (0..n)
            .into_par_iter()
            .map(|i| {
                let empty = SparseRow::new();
                let a = self.rows.get(i).unwrap_or(&empty);
                let b = transposed.rows.get(i).unwrap_or(&empty);
                merge_mean(a, b)
            })
            .collect();

        SparseMatrix { rows }
    }

    /// Multiplies the matrix with a dense vector: `out[i] = Σ_j M[i][j]·v[j]`.
    ///
    /// Columns beyond `v.len()` contribute nothing.
    pub fn mul_vector(&self, v: &[f32]) -> Vec<f32> {
        self.rows
            .par_iter()
            .map(|row| {
                row.iter()
                    .filter_map(|(j, w)| v.get(j as usize).map(|x| f64::from(w) * f64::from(*x)))
                    .sum::<f64>() as f32
            })
            .collect()
    }

    /// Extracts the subgraph induced by `selected` rows plus their one-hop
    /// neighbors whose weight exceeds `neighbor_thresh`.
    ///
    /// Returned indices list the original row of every subgraph node, selected
    /// nodes first in the given order, then neighbors in ascending order. The
    /// subgraph keeps only edges between its own nodes, and its values are
    /// scaled so that they sum to the number of nodes.
    pub fn extract_subgraph(
        &self,
        selected: &[u32],
        neighbor_thresh: f32,
    ) -> (SparseMatrix, Vec<u32>) {
        let mut new_idx: HashMap<u32, u32> = HashMap::with_capacity(selected.len());
        let mut indices: Vec<u32> = Vec::with_capacity(selected.len());
        for &s in selected {
            if (s as usize) < self.len() && !new_idx.contains_key(&s) {
                new_idx.insert(s, indices.len() as u32);
                indices.push(s);
            }
        }

        let mut neighbors: Vec<u32> = indices
            .iter()
            .flat_map(|&s| self.rows[s as usize].iter())
            .filter(|&(j, v)| v > neighbor_thresh && (j as usize) < self.len())
            .map(|(j, _)| j)
            .filter(|j| !new_idx.contains_key(j))
            .collect();
        neighbors.sort_unstable();
        neighbors.dedup();
        for j in neighbors {
            new_idx.insert(j, indices.len() as u32);
            indices.push(j);
        }

        let mut rows: Vec<SparseRow> = indices
            .par_iter()
            .map(|&orig| {
                self.rows[orig as usize]
                    .iter()
                    .filter_map(|(j, v)| new_idx.get(&j).map(|&nj| (nj, v)))
                    .collect()
            })
            .collect();

        let total: f64 = rows.iter().map(SparseRow::sum).sum();
        if total > 0.0 {
            let scale = indices.len() as f64 / total;
            for row in &mut rows {
                for v in row.values_mut() {
                    *v = (f64::from(*v) * scale) as f32;
                }
            }
        }

        (SparseMatrix { rows }, indices)
    }
}

impl Index<usize> for SparseMatrix {
    type Output = SparseRow;

    fn index(&self, i: usize) -> &SparseRow {
        &self.rows[i]
    }
}

impl From<Vec<SparseRow>> for SparseMatrix {
    fn from(rows: Vec<SparseRow>) -> Self {
        Self { rows }
    }
}

impl FromIterator<SparseRow> for SparseMatrix {
    fn from_iter<I: IntoIterator<Item = SparseRow>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a SparseMatrix {
    type Item = &'a SparseRow;
    type IntoIter = std::slice::Iter<'a, SparseRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// Merges two sorted rows into their entry-wise mean.
fn merge_mean(a: &SparseRow, b: &SparseRow) -> SparseRow {
    let mut out = SparseRow::with_capacity(a.len().max(b.len()));
    let (mut ia, mut ib) = (a.entries.iter().peekable(), b.entries.iter().peekable());
    loop {
        let next = match (ia.peek(), ib.peek()) {
            (Some(&&(ca, va)), Some(&&(cb, vb))) => {
                if ca == cb {
                    ia.next();
                    ib.next();
                    (ca, (va + vb) / 2.0)
                } else if ca < cb {
                    ia.next();
                    (ca, va / 2.0)
                } else {
                    ib.next();
                    (cb, vb / 2.0)
                }
            }
            (Some(&&(ca, va)), None) => {
                ia.next();
                (ca, va / 2.0)
            }
            (None, Some(&&(cb, vb))) => {
                ib.next();
                (cb, vb / 2.0)
            }
            (None, None) => break,
        };
        out.entries.push(next);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    fn matrix(rows: &[&[(u32, f32)]]) -> SparseMatrix {
        rows.iter()
            .map(|r| SparseRow::from_entries(r.iter().copied()))
            .collect()
    }

    #[test]
    fn test_row_operations() {
        let mut row = SparseRow::new();
        row.insert(5, 1.0);
        row.insert(1, 2.0);
        row.add(5, 0.5);
        row.add(3, 4.0);

        assert_eq!(row.iter().collect::<Vec<_>>(), vec![(1, 2.0), (3, 4.0), (5, 1.5)]);
        assert_eq!(row.get(3), Some(4.0));
        assert_eq!(row.get(2), None);
        assert_eq!(row.remove(1), Some(2.0));
        assert_eq!(row.len(), 2);

        row.normalize();
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_symmetrize() {
        let m = matrix(&[&[(1, 0.6), (2, 0.4)], &[(0, 1.0)], &[(1, 1.0)]]);
        let s = m.symmetrize();

        assert_eq!(s[0].get(1), Some(0.8));
        assert_eq!(s[1].get(0), Some(0.8));
        assert_eq!(s[0].get(2), Some(0.2));
        assert_eq!(s[2].get(0), Some(0.2));
        assert_eq!(s[1].get(2), Some(0.5));
        assert_eq!(s[2].get(1), Some(0.5));
    }

    #[test]
    fn test_transpose() {
        let m = matrix(&[&[(1, 1.0), (2, 2.0)], &[(2, 3.0)]]);
        let t = m.transpose(3);
        assert_eq!(t.len(), 3);
        assert!(t[0].is_empty());
        assert_eq!(t[1].iter().collect::<Vec<_>>(), vec![(0, 1.0)]);
        assert_eq!(t[2].iter().collect::<Vec<_>>(), vec![(0, 2.0), (1, 3.0)]);
    }

    #[test]
    fn test_mul_vector() {
        let m = matrix(&[&[(0, 0.5), (1, 0.5)], &[(1, 1.0)], &[]]);
        let out = m.mul_vector(&[1.0, 0.0]);
        assert_eq!(out, vec![0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_extract_subgraph() {
        let m = matrix(&[
            &[(1, 0.9), (2, 0.1)],
            &[(0, 0.5), (3, 0.5)],
            &[(0, 1.0)],
            &[(1, 1.0)],
        ]);

        // Node 0 plus its strong neighbor 1; node 2 is below the threshold
        let (sub, indices) = m.extract_subgraph(&[0], 0.5);
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(sub.len(), 2);
        assert_eq!(sub[0].iter().map(|(j, _)| j).collect::<Vec<_>>(), vec![1]);
        assert_eq!(sub[1].iter().map(|(j, _)| j).collect::<Vec<_>>(), vec![0]);
        assert_abs_diff_eq!(sub.total_sum(), 2.0, epsilon = 1e-5);

        // Without neighbor expansion only the selection is kept
        let (sub, indices) = m.extract_subgraph(&[3, 1], 1.0);
        assert_eq!(indices, vec![3, 1]);
        assert_abs_diff_eq!(sub[0].get(1).unwrap_or(0.0), 2.0 / 1.5, epsilon = 1e-6);
    }

    #[derive(Clone, Debug)]
    struct SmallMatrix(SparseMatrix);

    impl Arbitrary for SmallMatrix {
        fn arbitrary(g: &mut Gen) -> Self {
            let n = usize::arbitrary(g) % 12 + 1;
            let rows = (0..n)
                .map(|_| {
                    let k = usize::arbitrary(g) % (n + 1);
                    (0..k)
                        .map(|_| {
                            let col = (u32::arbitrary(g) as usize % n) as u32;
                            let value = f32::from(u8::arbitrary(g)) / 255.0;
                            (col, value)
                        })
                        .collect::<SparseRow>()
                })
                .collect();
            SmallMatrix(rows)
        }
    }

    #[quickcheck]
    fn symmetrize_is_idempotent(m: SmallMatrix) -> bool {
        let once = m.0.symmetrize();
        once.symmetrize() == once
    }

    #[quickcheck]
    fn symmetrize_is_symmetric(m: SmallMatrix) -> bool {
        let s = m.0.symmetrize();
        s.iter()
            .enumerate()
            .all(|(i, row)| row.iter().all(|(j, v)| s[j as usize].get(i as u32) == Some(v)))
    }

    #[quickcheck]
    fn normalized_rows_sum_to_one(m: SmallMatrix) -> bool {
        let mut m = m.0;
        m.normalize_rows();
        m.row_sums()
            .iter()
            .all(|&s| s == 0.0 || (s - 1.0).abs() < 1e-5)
    }
}
