//! Hierarchy persistence and CSV export of analyses.
//!
//! Hierarchies are stored in a little-endian binary format:
//!
//! ```text
//! u32 major, u32 minor, u32 num_scales
//! per scale:
//!   u32 N
//!   u32×N landmark_to_parent_idx
//!   u32×N landmark_to_original_idx
//!   f32×N landmark_weight
//!   sparse transition_matrix
//!   sparse area_of_influence
//! sparse: u32 rows, then per row u32 count followed by count (u32, f32) pairs
//! ```

use crate::analysis::Analysis;
use crate::hierarchy::{Hierarchy, HierarchyConfiguration, Scale};
use crate::sparse::{SparseMatrix, SparseRow};
use crate::HsneError;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;

/// Major version of the hierarchy format.
pub const FORMAT_MAJOR_VERSION: u32 = 1;

/// Minor version of the hierarchy format.
pub const FORMAT_MINOR_VERSION: u32 = 0;

/// Upper bound on speculative preallocation while reading.
const MAX_PREALLOCATION: usize = 1 << 20;

fn write_u32<W: Write>(writer: &mut W, value: u32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn write_f32<W: Write>(writer: &mut W, value: f32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn write_len<W: Write>(writer: &mut W, len: usize) -> Result<(), HsneError> {
    let len = u32::try_from(len)
        .map_err(|_| HsneError::InvalidFormat(format!("length {len} does not fit in 32 bits")))?;
    Ok(write_u32(writer, len)?)
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, HsneError> {
    let mut buf = [0_u8; 4];
    reader.read_exact(&mut buf).map_err(truncated)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f32<R: Read>(reader: &mut R) -> Result<f32, HsneError> {
    let mut buf = [0_u8; 4];
    reader.read_exact(&mut buf).map_err(truncated)?;
    Ok(f32::from_le_bytes(buf))
}

fn truncated(err: io::Error) -> HsneError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        HsneError::InvalidFormat("unexpected end of file".into())
    } else {
        HsneError::Io(err)
    }
}

fn write_sparse<W: Write>(writer: &mut W, matrix: &SparseMatrix) -> Result<(), HsneError> {
    write_len(writer, matrix.len())?;
    for row in matrix {
        write_len(writer, row.len())?;
        for (j, v) in row.iter() {
            write_u32(writer, j)?;
            write_f32(writer, v)?;
        }
    }
    Ok(())
}

fn read_sparse<R: Read>(reader: &mut R) -> Result<SparseMatrix, HsneError> {
    let num_rows = read_u32(reader)? as usize;
    let mut matrix = SparseMatrix::with_rows(0);
    for _ in 0..num_rows {
        let count = read_u32(reader)? as usize;
        let mut row = SparseRow::with_capacity(count.min(MAX_PREALLOCATION));
        for _ in 0..count {
            let j = read_u32(reader)?;
            let v = read_f32(reader)?;
            row.insert(j, v);
        }
        matrix.push(row);
    }
    Ok(matrix)
}

fn read_u32_array<R: Read>(reader: &mut R, n: usize) -> Result<Vec<u32>, HsneError> {
    let mut values = Vec::with_capacity(n.min(MAX_PREALLOCATION));
    for _ in 0..n {
        values.push(read_u32(reader)?);
    }
    Ok(values)
}

/// Serializes `hierarchy` into `writer`.
///
/// # Errors
/// * `HsneError::Io` if writing fails
pub fn write_hierarchy<W: Write>(hierarchy: &Hierarchy, writer: &mut W) -> Result<(), HsneError> {
    write_u32(writer, FORMAT_MAJOR_VERSION)?;
    write_u32(writer, FORMAT_MINOR_VERSION)?;
    write_len(writer, hierarchy.num_scales())?;

    for scale in hierarchy.scales() {
        write_len(writer, scale.len())?;
        for &p in &scale.landmark_to_parent_idx {
            write_u32(writer, p)?;
        }
        for &o in &scale.landmark_to_original_idx {
            write_u32(writer, o)?;
        }
        for &w in &scale.landmark_weight {
            write_f32(writer, w)?;
        }
        write_sparse(writer, &scale.transition_matrix)?;
        write_sparse(writer, &scale.area_of_influence)?;
    }
    Ok(())
}

/// Deserializes a hierarchy written by [`write_hierarchy`].
///
/// # Errors
/// * `HsneError::InvalidFormat` if the content is truncated, has an unknown
///   version or inconsistent sizes
/// * `HsneError::Io` if reading fails
pub fn read_hierarchy<R: Read>(
    reader: &mut R,
    config: HierarchyConfiguration,
) -> Result<Hierarchy, HsneError> {
    let major = read_u32(reader)?;
    let minor = read_u32(reader)?;
    if major != FORMAT_MAJOR_VERSION {
        return Err(HsneError::InvalidFormat(format!(
            "unsupported format version {major}.{minor}"
        )));
    }

    let num_scales = read_u32(reader)? as usize;
    let mut scales: Vec<Scale> = Vec::with_capacity(num_scales.min(64));
    for _ in 0..num_scales {
        let n = read_u32(reader)? as usize;
        let landmark_to_parent_idx = read_u32_array(reader, n)?;
        let landmark_to_original_idx = read_u32_array(reader, n)?;
        let mut landmark_weight = Vec::with_capacity(n.min(MAX_PREALLOCATION));
        for _ in 0..n {
            landmark_weight.push(read_f32(reader)?);
        }
        let transition_matrix = read_sparse(reader)?;
        let area_of_influence = read_sparse(reader)?;

        let prev_len = scales.last().map_or(n, Scale::len);
        let mut parent_to_landmark_idx = vec![None; prev_len];
        for (l, &p) in landmark_to_parent_idx.iter().enumerate() {
            let slot = parent_to_landmark_idx.get_mut(p as usize).ok_or_else(|| {
                HsneError::InvalidFormat(format!("parent index {p} out of range"))
            })?;
            *slot = Some(l as u32);
        }

        scales.push(Scale {
            transition_matrix,
            landmark_to_parent_idx,
            landmark_to_original_idx,
            parent_to_landmark_idx,
            landmark_weight,
            area_of_influence,
        });
    }

    Hierarchy::from_scales(scales, config)
}

/// Saves `hierarchy` to the file at `path`.
///
/// # Errors
/// * `HsneError::Io` if the file cannot be created or written
pub fn save_hierarchy(hierarchy: &Hierarchy, path: impl AsRef<Path>) -> Result<(), HsneError> {
    let path = path.as_ref();
    let mut writer = BufWriter::new(File::create(path)?);
    write_hierarchy(hierarchy, &mut writer)?;
    writer.flush()?;
    debug!(path = %path.display(), num_scales = hierarchy.num_scales(), "Hierarchy saved");
    Ok(())
}

/// Loads a hierarchy from the file at `path`.
///
/// With `expected_num_points`, the file is rejected unless its scale 0 has
/// exactly that many data points.
///
/// # Errors
/// * `HsneError::Io` if the file cannot be opened or read
/// * `HsneError::InvalidFormat` if the content is malformed
/// * `HsneError::SizeMismatch` if the scale-0 size differs from
///   `expected_num_points`
pub fn load_hierarchy(
    path: impl AsRef<Path>,
    config: HierarchyConfiguration,
    expected_num_points: Option<usize>,
) -> Result<Hierarchy, HsneError> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let hierarchy = read_hierarchy(&mut reader, config)?;

    if let Some(expected) = expected_num_points {
        if hierarchy.num_data_points() != expected {
            return Err(HsneError::SizeMismatch {
                hierarchy: hierarchy.num_data_points(),
                data: expected,
            });
        }
    }

    debug!(path = %path.display(), num_scales = hierarchy.num_scales(), "Hierarchy loaded");
    Ok(hierarchy)
}

/// Writes `x,y[,z],w,id` rows: coordinates, landmark weight and original
/// data index of every point of an analysis.
///
/// # Errors
/// * `HsneError::LengthMismatch` if the inputs disagree in length
/// * `HsneError::Io` if writing fails
pub fn write_embedding_csv<W: Write>(
    writer: &mut W,
    analysis: &Analysis,
    original_idx: &[u32],
) -> Result<(), HsneError> {
    let embedding = analysis.embedding();
    if original_idx.len() != analysis.len() || embedding.nrows() != analysis.len() {
        return Err(HsneError::LengthMismatch {
            expected: analysis.len(),
            actual: original_idx.len(),
        });
    }

    let axes = ["x", "y", "z"];
    let header: Vec<&str> = axes.iter().take(embedding.ncols()).copied().collect();
    writeln!(writer, "{},w,id", header.join(","))?;

    for ((row, w), id) in embedding
        .rows()
        .into_iter()
        .zip(analysis.landmark_weight())
        .zip(original_idx)
    {
        for v in row {
            write!(writer, "{v},")?;
        }
        writeln!(writer, "{w},{id}")?;
    }
    Ok(())
}

/// Writes one index per line.
///
/// # Errors
/// * `HsneError::Io` if writing fails
pub fn write_indices_csv<W: Write>(writer: &mut W, indices: &[u32]) -> Result<(), HsneError> {
    for i in indices {
        writeln!(writer, "{i}")?;
    }
    Ok(())
}

/// Exports an analysis into `folder/S_<scale>/A_<analysis>/`, creating the
/// directories as needed.
///
/// Writes `info.txt`, `embedding.csv` and `parent_selection.csv`.
///
/// # Errors
/// * `HsneError::Io` if a directory or file cannot be written
/// * `HsneError::LengthMismatch` if `original_idx` does not match the analysis
pub fn export_analysis(
    folder: impl AsRef<Path>,
    analysis: &Analysis,
    original_idx: &[u32],
) -> Result<(), HsneError> {
    let id = analysis.id();
    let dir = folder
        .as_ref()
        .join(format!("S_{}", id.scale))
        .join(format!("A_{}", id.analysis));
    fs::create_dir_all(&dir)?;

    let mut info = BufWriter::new(File::create(dir.join("info.txt"))?);
    writeln!(info, "scale: {}", id.scale)?;
    writeln!(info, "analysis: {}", id.analysis)?;
    match analysis.parent() {
        Some(parent) => writeln!(info, "parent: {parent}")?,
        None => writeln!(info, "parent: none")?,
    }
    writeln!(info, "points: {}", analysis.len())?;
    writeln!(info, "iterations: {}", analysis.iteration())?;
    info.flush()?;

    let mut embedding = BufWriter::new(File::create(dir.join("embedding.csv"))?);
    write_embedding_csv(&mut embedding, analysis, original_idx)?;
    embedding.flush()?;

    let mut parent_selection = BufWriter::new(File::create(dir.join("parent_selection.csv"))?);
    write_indices_csv(&mut parent_selection, analysis.parent_selection())?;
    parent_selection.flush()?;

    debug!(analysis = %id, dir = %dir.display(), "Analysis exported");
    Ok(())
}
