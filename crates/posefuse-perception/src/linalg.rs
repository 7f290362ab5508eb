//! Small dense linear-algebra helpers shared by the filter and the
//! strategies.

use std::f64::consts::{PI, TAU};

use nalgebra::{DMatrix, DVector};
use posefuse_types::{PoseError, index};

/// Wrap an angle into `(-π, π]`.
pub fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped <= -PI { wrapped + TAU } else { wrapped }
}

/// Build a matrix from row vectors, checking the shape.
///
/// `expected` is `(rows, cols)`; pass `None` for a dimension that is free.
pub fn matrix_from_rows(
    what: &str,
    rows: &[Vec<f64>],
    expected: (Option<usize>, Option<usize>),
) -> Result<DMatrix<f64>, PoseError> {
    let nrows = rows.len();
    let ncols = rows.first().map_or(0, Vec::len);

    if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != ncols) {
        return Err(PoseError::DimensionMismatch {
            what: format!("{what} row {i}"),
            expected: format!("{ncols} columns"),
            found: format!("{} columns", row.len()),
        });
    }
    if expected.0.is_some_and(|r| r != nrows) || expected.1.is_some_and(|c| c != ncols) {
        return Err(PoseError::DimensionMismatch {
            what: what.to_string(),
            expected: format!(
                "{}x{}",
                expected.0.map_or("m".to_string(), |r| r.to_string()),
                expected.1.map_or("n".to_string(), |c| c.to_string())
            ),
            found: format!("{nrows}x{ncols}"),
        });
    }
    if rows.iter().flatten().any(|v| !v.is_finite()) {
        return Err(PoseError::Config(format!("{what} contains non-finite values")));
    }

    Ok(DMatrix::from_fn(nrows, ncols, |r, c| rows[r][c]))
}

/// Build a vector, checking its length.
pub fn vector_from_slice(what: &str, values: &[f64], len: usize) -> Result<DVector<f64>, PoseError> {
    if values.len() != len {
        return Err(PoseError::DimensionMismatch {
            what: what.to_string(),
            expected: len.to_string(),
            found: values.len().to_string(),
        });
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(PoseError::Config(format!("{what} contains non-finite values")));
    }
    Ok(DVector::from_column_slice(values))
}

/// Replace `m` with `(m + mᵀ) / 2`.
pub fn symmetrize(m: &mut DMatrix<f64>) {
    let transposed = m.transpose();
    *m += transposed;
    *m *= 0.5;
}

/// Ratio of the largest to the smallest singular value.
///
/// Infinite for singular or non-finite matrices.
pub fn condition_number(m: &DMatrix<f64>) -> f64 {
    if m.is_empty() || m.iter().any(|v| !v.is_finite()) {
        return f64::INFINITY;
    }
    let singular = m.clone().svd(false, false).singular_values;
    let max = singular.max();
    let min = singular.min();
    if min <= 0.0 { f64::INFINITY } else { max / min }
}

/// Scalar confidence figure for a 5×5 pose covariance: det of the position
/// block plus det of the velocity block plus the heading variance.
pub fn pose_uncertainty(p: &DMatrix<f64>) -> f64 {
    let pos = p.fixed_view::<2, 2>(index::X, index::X).clone_owned().determinant();
    let vel = p.fixed_view::<2, 2>(index::VX, index::VX).clone_owned().determinant();
    pos + vel + p[(index::THETA, index::THETA)]
}

/// Whether `m` is symmetric with a non-negative diagonal (a cheap PSD proxy).
pub fn is_symmetric_nonneg_diag(m: &DMatrix<f64>, tol: f64) -> bool {
    m.is_square()
        && (0..m.nrows()).all(|i| m[(i, i)] >= -tol)
        && (0..m.nrows()).all(|i| (0..i).all(|j| (m[(i, j)] - m[(j, i)]).abs() <= tol))
}
