//! Jacobian evaluation: per-element deformation gradients of the current
//! mapping, J_e = [∇u_e | ∇v_e | …].
//!
//! One sparse matrix–vector product per (coordinate column, axis) pair.

use crate::types::{entry_index, AssemblyError, GradientOperators, JacobianField, Result};
use ndarray::{Array1, Array2, ArrayView1};
use sprs::CsMat;

/// Evaluate the Jacobian of every element for the coordinate field `u`
/// (#vertices × d).
///
/// Entry `entry_index(d, axis, c)` of row `e` holds ∂(column c of u)/∂axis
/// on element e, i.e. the e-th entry of `G_axis · u[:, c]`.
pub fn evaluate_jacobians(ops: &GradientOperators, u: &Array2<f64>) -> Result<JacobianField> {
    let d = ops.dim();
    let ne = ops.num_elements();
    let nv = ops.num_vertices();

    if u.dim() != (nv, d) {
        return Err(AssemblyError::Shape(format!(
            "coordinate field has shape {:?}, gradient operators expect ({nv}, {d})",
            u.dim()
        )));
    }

    let mut values = Array2::zeros((ne, d * d));
    for c in 0..d {
        let column = u.column(c);
        for axis in 0..d {
            let grad = spmv(ops.axis(axis), column);
            values.column_mut(entry_index(d, axis, c)).assign(&grad);
        }
    }

    tracing::trace!(elements = ne, dim = d, "evaluated jacobians");
    Ok(JacobianField { dim: d, values })
}

// ─────────────────────────────────────────────────────────────
//  Sparse × dense helpers
// ─────────────────────────────────────────────────────────────

/// out = A x   where A is CSR (m × k).
pub(crate) fn spmv(a: &CsMat<f64>, x: ArrayView1<f64>) -> Array1<f64> {
    debug_assert!(a.is_csr());
    let mut out = Array1::zeros(a.rows());
    for (row, vec) in a.outer_iterator().enumerate() {
        let mut acc = 0.0;
        for (col, &val) in vec.iter() {
            acc += val * x[col];
        }
        out[row] = acc;
    }
    out
}

/// out = Aᵗ x   where A is CSR (m × k), without forming the transpose.
pub(crate) fn spmv_transpose(a: &CsMat<f64>, x: ArrayView1<f64>) -> Array1<f64> {
    debug_assert!(a.is_csr());
    let mut out = Array1::zeros(a.cols());
    for (row, vec) in a.outer_iterator().enumerate() {
        let xr = x[row];
        for (col, &val) in vec.iter() {
            out[col] += val * xr;
        }
    }
    out
}
