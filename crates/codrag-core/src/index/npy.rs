//! Minimal NPY v1.0 container for the embedding matrix.
//!
//! The matrix is persisted as a standard `.npy` file (little-endian f32,
//! C-order, 2-D shape) so external tooling can inspect it. Only the subset
//! the engine writes is accepted back: `<f4`, non-Fortran, rank 2.

use ndarray::Array2;
use std::path::Path;

use crate::error::{CoreError, CoreResult};

const MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Serialize a 2-D f32 matrix into NPY v1.0 bytes.
pub fn to_npy_bytes(matrix: &Array2<f32>) -> Vec<u8> {
    let (rows, cols) = matrix.dim();
    let mut header = format!("{{'descr': '<f4', 'fortran_order': False, 'shape': ({rows}, {cols}), }}");

    // Pad with spaces so that magic + version + len + header is 64-aligned,
    // with a trailing newline as the format requires.
    let prefix_len = MAGIC.len() + 2 + 2;
    let total = prefix_len + header.len() + 1;
    let padding = (64 - (total % 64)) % 64;
    header.push_str(&" ".repeat(padding));
    header.push('\n');

    let mut out = Vec::with_capacity(prefix_len + header.len() + rows * cols * 4);
    out.extend_from_slice(MAGIC);
    out.push(1);
    out.push(0);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());

    for value in matrix.iter() {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Parse NPY v1.0 bytes into a 2-D f32 matrix.
pub fn from_npy_bytes(bytes: &[u8], origin: &Path) -> CoreResult<Array2<f32>> {
    let corrupt = |message: String| CoreError::Corruption { path: origin.to_path_buf(), message };

    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(corrupt("not an NPY file".into()));
    }
    if bytes[6] != 1 {
        return Err(corrupt(format!("unsupported NPY version {}.{}", bytes[6], bytes[7])));
    }

    let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
    let data_start = 10 + header_len;
    if bytes.len() < data_start {
        return Err(corrupt("truncated NPY header".into()));
    }

    let header = std::str::from_utf8(&bytes[10..data_start])
        .map_err(|_| corrupt("non-UTF-8 NPY header".into()))?;

    if !header.contains("'descr': '<f4'") {
        return Err(corrupt("expected little-endian f32 matrix".into()));
    }
    if !header.contains("'fortran_order': False") {
        return Err(corrupt("Fortran-order matrices are not supported".into()));
    }

    let (rows, cols) = parse_shape(header).ok_or_else(|| corrupt("malformed NPY shape".into()))?;

    let expected = rows
        .checked_mul(cols)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| corrupt("NPY shape overflow".into()))?;
    let data = &bytes[data_start..];
    if data.len() != expected {
        return Err(corrupt(format!(
            "NPY data length {} does not match shape ({rows}, {cols})",
            data.len()
        )));
    }

    let values: Vec<f32> = data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Array2::from_shape_vec((rows, cols), values)
        .map_err(|e| corrupt(format!("NPY shape error: {e}")))
}

fn parse_shape(header: &str) -> Option<(usize, usize)> {
    let start = header.find("'shape': (")? + "'shape': (".len();
    let rest = &header[start..];
    let end = rest.find(')')?;
    let inner = &rest[..end];
    let mut parts = inner.split(',').map(str::trim).filter(|s| !s.is_empty());
    let rows = parts.next()?.parse().ok()?;
    let cols = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((rows, cols))
}

/// Write a matrix to `path` as NPY.
pub fn write_npy(path: &Path, matrix: &Array2<f32>) -> CoreResult<()> {
    std::fs::write(path, to_npy_bytes(matrix))?;
    Ok(())
}

/// Read a matrix from an NPY file.
pub fn read_npy(path: &Path) -> CoreResult<Array2<f32>> {
    let bytes = std::fs::read(path)?;
    from_npy_bytes(&bytes, path)
}
