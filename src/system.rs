//! Normal-equations assembly:
//!
//!   L   = AᵗMA + λI
//!   rhs = AᵗMb + λ·flatten(U_old)
//!
//! L is the Gauss–Newton approximation of the weighted least-squares proxy
//! Σ_e vol_e ‖W_e J_e(U) − W_e R_e‖²_F plus a proximal term anchoring U to
//! the previous iterate.  With λ = 0 and nothing pinning the global
//! translation, L is singular; that is returned as-is.
//!
//! Two paths produce the same system:
//!   - [`build_linear_system`] forms the sparse product explicitly from A.
//!   - [`assemble_system`] writes per-element blocks straight into the
//!     fixed pattern held by an [`AssemblyCache`].

use crate::jacobian::{spmv, spmv_transpose};
use crate::operator::area_measure;
use crate::types::{
    dof_index, AssemblyCache, AssemblyError, AssemblyOptions, ElementFrames, LinearSystem, Result,
};
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;
use sprs::{CsMat, TriMat};

fn check_proximal_weight(lambda: f64) -> Result<()> {
    if !(lambda.is_finite() && lambda >= 0.0) {
        return Err(AssemblyError::InvalidParameter(format!(
            "proximal weight must be finite and non-negative, got {lambda}"
        )));
    }
    if lambda == 0.0 {
        tracing::debug!("proximal weight is zero; L is singular unless constraints pin the translation");
    }
    Ok(())
}

/// Recover d from the row count of A and the number of elements.
fn operator_dim(rows: usize, num_elements: usize) -> Result<usize> {
    [2usize, 3]
        .into_iter()
        .find(|&d| num_elements > 0 && d * d * num_elements == rows)
        .ok_or_else(|| {
            AssemblyError::Shape(format!(
                "operator has {rows} rows, which is not d²·{num_elements} for d in {{2, 3}}"
            ))
        })
}

// ─────────────────────────────────────────────────────────────
//  Direct path
// ─────────────────────────────────────────────────────────────

/// Form L and rhs from an explicit weighted operator `a` (CSR), the target
/// vector `b`, per-element `areas`, the flattened previous iterate and λ.
pub fn build_linear_system(
    a: &CsMat<f64>,
    b: &Array1<f64>,
    areas: &[f64],
    u_old: &Array1<f64>,
    lambda: f64,
) -> Result<LinearSystem> {
    check_proximal_weight(lambda)?;
    let d = operator_dim(a.rows(), areas.len())?;
    let n = a.cols();
    if b.len() != a.rows() {
        return Err(AssemblyError::Shape(format!(
            "target vector has length {}, operator has {} rows",
            b.len(),
            a.rows()
        )));
    }
    if u_old.len() != n {
        return Err(AssemblyError::Shape(format!(
            "previous iterate has length {}, operator has {n} columns",
            u_old.len()
        )));
    }

    let a = if a.is_csr() { a.clone() } else { a.to_csr() };
    let m = area_measure(areas, d);

    // 1. MA: scale row k of A by m_k
    let mut ma = a.clone();
    let indptr: Vec<usize> = ma.indptr().raw_storage().to_vec();
    {
        let data = ma.data_mut();
        for row in 0..m.len() {
            for nz in indptr[row]..indptr[row + 1] {
                data[nz] *= m[row];
            }
        }
    }

    // 2. AᵗMA  (the reduction; A is complete at this point)
    let at = a.transpose_view().to_csr();
    let atma: CsMat<f64> = &at * &ma;

    // 3. + λI, frozen to CSC
    let mut tri = TriMat::with_capacity((n, n), atma.nnz() + n);
    for (&val, (row, col)) in atma.iter() {
        tri.add_triplet(row, col, val);
    }
    for i in 0..n {
        tri.add_triplet(i, i, lambda);
    }
    let matrix: CsMat<f64> = tri.to_csc();

    // 4. rhs = Aᵗ(M b) + λ U_old
    let mb = &m * b;
    let mut rhs = spmv_transpose(&a, mb.view());
    rhs.scaled_add(lambda, u_old);

    tracing::debug!(size = n, nnz = matrix.nnz(), lambda, "built linear system");
    Ok(LinearSystem { dim: d, matrix, rhs })
}

// ─────────────────────────────────────────────────────────────
//  Cached path  (numeric-only re-evaluation)
// ─────────────────────────────────────────────────────────────

/// Assemble L and rhs into the fixed pattern of `cache`.
///
/// Element e contributes vol_e·BᵗB to each of the d diagonal blocks of L and
/// vol_e·Bᵗ(W_e R_e) to rhs, with B = W_e G_e the weighted gradient block.
/// The per-element phase is independent across elements; the scatter into
/// `cache.system` runs after it completes.
pub fn assemble_system<'a>(
    cache: &'a mut AssemblyCache,
    frames: &ElementFrames,
    areas: &[f64],
    u_old: &Array1<f64>,
    lambda: f64,
    options: &AssemblyOptions,
) -> Result<&'a mut LinearSystem> {
    check_proximal_weight(lambda)?;
    let d = cache.operators.dim();
    let ne = cache.operators.num_elements();
    let nv = cache.operators.num_vertices();

    frames.check_shape(ne, d)?;
    if areas.len() != ne {
        return Err(AssemblyError::Shape(format!(
            "{} area weights for {ne} elements",
            areas.len()
        )));
    }
    if u_old.len() != d * nv {
        return Err(AssemblyError::Shape(format!(
            "previous iterate has length {}, expected {}",
            u_old.len(),
            d * nv
        )));
    }

    let blocks = &cache.blocks;
    let local_system = |e: usize| -> (Array2<f64>, Array2<f64>) {
        let w = frames.weights.index_axis(Axis(0), e);
        let r = frames.targets.index_axis(Axis(0), e);
        let bmat = w.dot(&blocks[e]); // d × s
        let wr = w.dot(&r);
        let local_l = bmat.t().dot(&bmat) * areas[e];
        let local_rhs = bmat.t().dot(&wr) * areas[e];
        (local_l, local_rhs)
    };

    let parallel = options.run_parallel(ne);
    let locals: Vec<(Array2<f64>, Array2<f64>)> = if parallel {
        (0..ne).into_par_iter().map(local_system).collect()
    } else {
        (0..ne).map(local_system).collect()
    };

    let LinearSystem { matrix, rhs, .. } = &mut cache.system;
    let data = matrix.data_mut();
    data.fill(0.0);
    rhs.fill(0.0);

    for (e, (local_l, local_rhs)) in locals.iter().enumerate() {
        let support = &cache.supports[e];
        let map = &cache.element_nz[e];
        let s = support.len();
        for c in 0..d {
            for i in 0..s {
                for j in 0..s {
                    data[map[(c * s + i) * s + j]] += local_l[[i, j]];
                }
                rhs[dof_index(nv, support[i], c)] += local_rhs[[i, c]];
            }
        }
    }

    for (i, &nz) in cache.diag_nz.iter().enumerate() {
        data[nz] += lambda;
        rhs[i] += lambda * u_old[i];
    }

    tracing::debug!(elements = ne, parallel, lambda, "assembled system into cached pattern");
    Ok(&mut cache.system)
}

// ─────────────────────────────────────────────────────────────
//  Proxy energy
// ─────────────────────────────────────────────────────────────

/// Σ_k M_k (A·U − b)_k², the weighted least-squares proxy at `u` (flattened).
pub fn proxy_energy(a: &CsMat<f64>, b: &Array1<f64>, areas: &[f64], u: &Array1<f64>) -> Result<f64> {
    let d = operator_dim(a.rows(), areas.len())?;
    if b.len() != a.rows() || u.len() != a.cols() {
        return Err(AssemblyError::Shape(format!(
            "operator is {}×{}, target has length {}, coordinates have length {}",
            a.rows(),
            a.cols(),
            b.len(),
            u.len()
        )));
    }
    let a = if a.is_csr() { a.clone() } else { a.to_csr() };
    let m = area_measure(areas, d);
    let residual = spmv(&a, u.view()) - b;
    Ok(residual.iter().zip(m.iter()).map(|(r, w)| w * r * r).sum())
}
