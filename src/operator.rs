//! Weighted operator and target assembly.
//!
//! A maps flatten(U) to the flattened weighted Jacobians {W_e · J_e(U)},
//! b holds the flattened weighted targets {W_e · R_e}.  Both use the row
//! layout of [`operator_row`]: d² blocks of #elements rows, block k holding
//! local entry k of every element.

use crate::types::{
    check_frame_shape, dof_index, entry_index, operator_row, AssemblyError, AssemblyOptions, ElementFrames,
    GradientOperators, Result,
};
use ndarray::{Array1, Array3};
use rayon::prelude::*;
use sprs::{CsMat, TriMat};

type Triplet = (usize, usize, f64);

// ─────────────────────────────────────────────────────────────
//  Weighted operator  A
// ─────────────────────────────────────────────────────────────

/// Build A such that A · flatten(U) = flatten({W_e J_e(U)}).
///
/// Row (e, r, c) is Σ_axis W_e[r, axis] · (row e of G_axis), placed in the
/// column block of coordinate c.  Returned in CSR.
pub fn assemble_weighted_operator(
    ops: &GradientOperators,
    weights: &Array3<f64>,
    options: &AssemblyOptions,
) -> Result<CsMat<f64>> {
    let d = ops.dim();
    let ne = ops.num_elements();
    let nv = ops.num_vertices();
    check_frame_shape("weight", weights, ne, d)?;

    let element_triplets = |e: usize| -> Vec<Triplet> {
        let mut out = Vec::with_capacity(d * d * d * (d + 1));
        for axis in 0..d {
            let Some(grad_row) = ops.axis(axis).outer_view(e) else {
                continue;
            };
            for r in 0..d {
                let w = weights[[e, r, axis]];
                for c in 0..d {
                    let row = operator_row(ne, e, entry_index(d, r, c));
                    for (v, &g) in grad_row.iter() {
                        out.push((row, dof_index(nv, v, c), w * g));
                    }
                }
            }
        }
        out
    };

    let parallel = options.run_parallel(ne);
    let per_element: Vec<Vec<Triplet>> = if parallel {
        (0..ne).into_par_iter().map(element_triplets).collect()
    } else {
        (0..ne).map(element_triplets).collect()
    };

    // Freeze: duplicates (same vertex on several axes) are summed.
    let total: usize = per_element.iter().map(Vec::len).sum();
    let mut tri = TriMat::with_capacity((d * d * ne, d * nv), total);
    for triplets in &per_element {
        for &(row, col, val) in triplets {
            tri.add_triplet(row, col, val);
        }
    }
    let a: CsMat<f64> = tri.to_csr();

    tracing::debug!(
        rows = a.rows(),
        cols = a.cols(),
        nnz = a.nnz(),
        parallel,
        "assembled weighted operator"
    );
    Ok(a)
}

// ─────────────────────────────────────────────────────────────
//  Target vector  b
// ─────────────────────────────────────────────────────────────

/// b with entry (e, r, c) = (W_e · R_e)[r, c], index-compatible with A.
pub fn assemble_targets(frames: &ElementFrames, options: &AssemblyOptions) -> Result<Array1<f64>> {
    let (ne, d, d2) = frames.weights.dim();
    if d != d2 || (d != 2 && d != 3) {
        return Err(AssemblyError::Shape(format!(
            "weight matrices must be 2×2 or 3×3, got {d}×{d2}"
        )));
    }
    frames.check_shape(ne, d)?;

    let weighted_target = |e: usize| -> Vec<f64> {
        let w = frames.weights.index_axis(ndarray::Axis(0), e);
        let r = frames.targets.index_axis(ndarray::Axis(0), e);
        let wr = w.dot(&r);
        let mut local = vec![0.0; d * d];
        for row in 0..d {
            for c in 0..d {
                local[entry_index(d, row, c)] = wr[[row, c]];
            }
        }
        local
    };

    let per_element: Vec<Vec<f64>> = if options.run_parallel(ne) {
        (0..ne).into_par_iter().map(weighted_target).collect()
    } else {
        (0..ne).map(weighted_target).collect()
    };

    let mut b = Array1::zeros(d * d * ne);
    for (e, local) in per_element.iter().enumerate() {
        for (k, &val) in local.iter().enumerate() {
            b[operator_row(ne, e, k)] = val;
        }
    }
    Ok(b)
}

// ─────────────────────────────────────────────────────────────
//  Diagonal measure  M
// ─────────────────────────────────────────────────────────────

/// Diagonal of M: the element areas/volumes repeated once per row block.
pub fn area_measure(areas: &[f64], dim: usize) -> Array1<f64> {
    let ne = areas.len();
    let mut m = Array1::zeros(dim * dim * ne);
    for k in 0..dim * dim {
        for (e, &area) in areas.iter().enumerate() {
            m[operator_row(ne, e, k)] = area;
        }
    }
    m
}
