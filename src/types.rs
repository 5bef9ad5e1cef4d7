use ndarray::{Array1, Array2, Array3};
use sprs::CsMat;
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Every function in the public API returns `Result<T, AssemblyError>`
/// instead of panicking.  Only precondition violations are reported;
/// degenerate numerics (NaN weights, zero areas, a singular system) are
/// passed through to the consuming solver.
#[derive(Debug, Error)]
pub enum AssemblyError {
    /// Operator / vector dimensions disagree.
    #[error("shape error: {0}")]
    Shape(String),
    /// A scalar parameter or index lies outside its admissible range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// Sparsity pattern is inconsistent (should never happen after
    /// a correct `AssemblyCache::new`).
    #[error("sparsity pattern mismatch: element {element}, ({row},{col}) not in L")]
    SparsityMismatch { element: usize, row: usize, col: usize },
    /// Linear algebra failure (singular / not-SPD matrix, etc.).
    #[error("linear algebra error: {0}")]
    Linalg(#[from] sprs::errors::LinalgError),
    /// The factorization has not been computed yet.
    #[error("factorization not computed (call SystemSolver::factor first)")]
    MissingFactorization,
}

pub type Result<T> = std::result::Result<T, AssemblyError>;

// ─────────────────────────────────────────────────────────────
//  Constants
// ─────────────────────────────────────────────────────────────

pub const DEFAULT_SOFT_PENALTY: f64 = 1e5;
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 1000;

// ─────────────────────────────────────────────────────────────
//  Assembly options
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AssemblyOptions {
    /// Default soft-constraint penalty p_soft.
    pub soft_penalty: f64,
    /// Element count above which per-element work runs on the rayon pool.
    pub parallel_threshold: usize,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            soft_penalty: DEFAULT_SOFT_PENALTY,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
        }
    }
}

impl AssemblyOptions {
    pub(crate) fn run_parallel(&self, num_elements: usize) -> bool {
        num_elements > self.parallel_threshold
    }
}

// ─────────────────────────────────────────────────────────────
//  Per-entry index conventions
// ─────────────────────────────────────────────────────────────

/// Local index of matrix entry (r, c) inside one element's d² block.
///
/// Column-major, so the Jacobian layout is (∂u/∂x, ∂u/∂y, ∂v/∂x, ∂v/∂y)
/// in 2D.
#[inline]
pub fn entry_index(dim: usize, r: usize, c: usize) -> usize {
    c * dim + r
}

/// Global row of A (and of the target vector) for element `e`, local entry `k`.
#[inline]
pub fn operator_row(num_elements: usize, e: usize, k: usize) -> usize {
    k * num_elements + e
}

/// Index of (vertex, coordinate) in a flattened coordinate vector.
#[inline]
pub fn dof_index(num_vertices: usize, vertex: usize, coord: usize) -> usize {
    coord * num_vertices + vertex
}

/// Flatten an (n × d) coordinate field column by column.
pub fn flatten_coordinates(u: &Array2<f64>) -> Array1<f64> {
    let (n, d) = u.dim();
    let mut flat = Array1::zeros(n * d);
    for c in 0..d {
        for v in 0..n {
            flat[dof_index(n, v, c)] = u[[v, c]];
        }
    }
    flat
}

/// Inverse of [`flatten_coordinates`].
pub fn unflatten_coordinates(flat: &Array1<f64>, num_vertices: usize, dim: usize) -> Result<Array2<f64>> {
    if flat.len() != num_vertices * dim {
        return Err(AssemblyError::Shape(format!(
            "flattened coordinates have length {}, expected {} × {}",
            flat.len(),
            num_vertices,
            dim
        )));
    }
    let mut u = Array2::zeros((num_vertices, dim));
    for c in 0..dim {
        for v in 0..num_vertices {
            u[[v, c]] = flat[dof_index(num_vertices, v, c)];
        }
    }
    Ok(u)
}

// ─────────────────────────────────────────────────────────────
//  Gradient operators  (borrowed from geometry preprocessing)
// ─────────────────────────────────────────────────────────────

/// One sparse (#elements × #vertices) operator per spatial axis.
///
/// Stored in CSR so that the row of element `e` is a contiguous slice.
#[derive(Debug, Clone)]
pub struct GradientOperators {
    axes: Vec<CsMat<f64>>,
}

impl GradientOperators {
    /// Validate and take ownership of the per-axis operators.
    ///
    /// Requires 2 or 3 operators of identical shape.
    pub fn new(axes: Vec<CsMat<f64>>) -> Result<Self> {
        if axes.len() != 2 && axes.len() != 3 {
            return Err(AssemblyError::InvalidParameter(format!(
                "expected 2 or 3 gradient operators, got {}",
                axes.len()
            )));
        }
        let shape = axes[0].shape();
        for (axis, op) in axes.iter().enumerate() {
            if op.shape() != shape {
                return Err(AssemblyError::Shape(format!(
                    "gradient operator {axis} has shape {:?}, operator 0 has {:?}",
                    op.shape(),
                    shape
                )));
            }
        }
        let axes = axes
            .into_iter()
            .map(|op| if op.is_csr() { op } else { op.to_csr() })
            .collect();
        Ok(Self { axes })
    }

    pub fn dim(&self) -> usize {
        self.axes.len()
    }

    pub fn num_elements(&self) -> usize {
        self.axes[0].rows()
    }

    pub fn num_vertices(&self) -> usize {
        self.axes[0].cols()
    }

    pub fn axis(&self, axis: usize) -> &CsMat<f64> {
        &self.axes[axis]
    }

    pub fn axes(&self) -> &[CsMat<f64>] {
        &self.axes
    }

    /// Sorted union of the vertex columns touched by element `e` on any axis.
    pub fn element_support(&self, e: usize) -> Vec<usize> {
        let mut support = BTreeSet::new();
        for op in &self.axes {
            if let Some(row) = op.outer_view(e) {
                support.extend(row.indices().iter().copied());
            }
        }
        support.into_iter().collect()
    }

    /// Dense (d × |support|) block of gradient coefficients for element `e`.
    pub fn element_block(&self, e: usize, support: &[usize]) -> Array2<f64> {
        let mut block = Array2::zeros((self.dim(), support.len()));
        for (axis, op) in self.axes.iter().enumerate() {
            if let Some(row) = op.outer_view(e) {
                for (col, &val) in row.iter() {
                    if let Ok(local) = support.binary_search(&col) {
                        block[[axis, local]] += val;
                    }
                }
            }
        }
        block
    }
}

// ─────────────────────────────────────────────────────────────
//  Per-element weight matrices and target frames
// ─────────────────────────────────────────────────────────────

/// W_e and R_e for every element, each an (#elements, d, d) array indexed
/// `[e, r, c]`.  Produced by the distortion-metric step every iteration.
#[derive(Debug, Clone)]
pub struct ElementFrames {
    pub weights: Array3<f64>,
    pub targets: Array3<f64>,
}

impl ElementFrames {
    /// Identity weights and identity targets.
    pub fn identity(num_elements: usize, dim: usize) -> Self {
        let mut eye = Array3::zeros((num_elements, dim, dim));
        for e in 0..num_elements {
            for i in 0..dim {
                eye[[e, i, i]] = 1.0;
            }
        }
        Self {
            weights: eye.clone(),
            targets: eye,
        }
    }

    pub fn num_elements(&self) -> usize {
        self.weights.dim().0
    }

    pub fn check_shape(&self, num_elements: usize, dim: usize) -> Result<()> {
        check_frame_shape("weight", &self.weights, num_elements, dim)?;
        check_frame_shape("target", &self.targets, num_elements, dim)
    }
}

pub(crate) fn check_frame_shape(name: &str, frames: &Array3<f64>, num_elements: usize, dim: usize) -> Result<()> {
    if frames.dim() != (num_elements, dim, dim) {
        return Err(AssemblyError::Shape(format!(
            "{name} matrices have shape {:?}, expected ({num_elements}, {dim}, {dim})",
            frames.dim()
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────
//  Jacobian field
// ─────────────────────────────────────────────────────────────

/// Per-element Jacobians, one row of d² entries per element in the
/// order given by [`entry_index`].
#[derive(Debug, Clone, PartialEq)]
pub struct JacobianField {
    pub dim: usize,
    pub values: Array2<f64>, // ne × d²
}

impl JacobianField {
    pub fn num_elements(&self) -> usize {
        self.values.nrows()
    }

    /// ∂(coordinate `c`)/∂(`axis`) on element `e`.
    pub fn entry(&self, e: usize, axis: usize, c: usize) -> f64 {
        self.values[[e, entry_index(self.dim, axis, c)]]
    }

    /// The d × d Jacobian J_e with `J[axis, c]` = ∂c/∂axis.
    pub fn matrix(&self, e: usize) -> Array2<f64> {
        Array2::from_shape_fn((self.dim, self.dim), |(axis, c)| self.entry(e, axis, c))
    }

    /// Flattened with the same row layout as the weighted operator A.
    pub fn as_flat(&self) -> Array1<f64> {
        let ne = self.num_elements();
        let mut flat = Array1::zeros(ne * self.dim * self.dim);
        for k in 0..self.dim * self.dim {
            for e in 0..ne {
                flat[operator_row(ne, e, k)] = self.values[[e, k]];
            }
        }
        flat
    }
}

// ─────────────────────────────────────────────────────────────
//  Soft constraints
// ─────────────────────────────────────────────────────────────

/// Penalty-based positional anchors on a set of distinct vertices.
#[derive(Debug, Clone)]
pub struct SoftConstraints {
    pub indices: Vec<usize>,
    pub targets: Array2<f64>, // n_constrained × d
    pub penalty: f64,
}

impl SoftConstraints {
    pub fn new(indices: Vec<usize>, targets: Array2<f64>, penalty: f64) -> Result<Self> {
        if targets.nrows() != indices.len() {
            return Err(AssemblyError::Shape(format!(
                "{} constrained vertices but {} target rows",
                indices.len(),
                targets.nrows()
            )));
        }
        if !(penalty.is_finite() && penalty > 0.0) {
            return Err(AssemblyError::InvalidParameter(format!(
                "soft-constraint penalty must be positive and finite, got {penalty}"
            )));
        }
        let mut seen = HashSet::with_capacity(indices.len());
        for &v in &indices {
            if !seen.insert(v) {
                return Err(AssemblyError::InvalidParameter(format!(
                    "vertex {v} is constrained more than once"
                )));
            }
        }
        Ok(Self { indices, targets, penalty })
    }

    pub fn with_default_penalty(indices: Vec<usize>, targets: Array2<f64>, options: &AssemblyOptions) -> Result<Self> {
        Self::new(indices, targets, options.soft_penalty)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────
//  Assembled linear system
// ─────────────────────────────────────────────────────────────

/// L (CSC, symmetric PSD, d·nv × d·nv) and rhs, in flattened dof order.
#[derive(Debug, Clone)]
pub struct LinearSystem {
    /// Spatial dimension d of the coordinates the dofs belong to.
    pub dim: usize,
    pub matrix: CsMat<f64>,
    pub rhs: Array1<f64>,
}

impl LinearSystem {
    /// Number of dofs, d·nv.
    pub fn size(&self) -> usize {
        self.rhs.len()
    }

    pub fn num_vertices(&self) -> usize {
        self.size() / self.dim
    }

    /// L·x − rhs.
    pub fn residual(&self, x: &Array1<f64>) -> Result<Array1<f64>> {
        if x.len() != self.size() {
            return Err(AssemblyError::Shape(format!(
                "vector of length {} against system of size {}",
                x.len(),
                self.size()
            )));
        }
        let mut r = -&self.rhs;
        for (&val, (row, col)) in self.matrix.iter() {
            r[row] += val * x[col];
        }
        Ok(r)
    }
}

// ─────────────────────────────────────────────────────────────
//  Pattern-reuse solver state
// ─────────────────────────────────────────────────────────────

/// Workspace for repeated assembly on a fixed topology.
///
/// The sparsity pattern of AᵗMA + λI only depends on which vertices each
/// element touches, so it is built once here.  Every later assembly only
/// rewrites `system.matrix.data()` via the precomputed `element_nz` map.
#[derive(Debug)]
pub struct AssemblyCache {
    pub operators: GradientOperators,
    /// Sorted vertex support of each element.
    pub supports: Vec<Vec<usize>>,
    /// Constant (d × |support|) gradient block per element.
    pub blocks: Vec<Array2<f64>>,
    /// For element e: nz index of (c·nv + s_i, c·nv + s_j), stored at
    /// `(c·s + i)·s + j` with s = |support|.
    pub element_nz: Vec<Vec<usize>>,
    /// nz index of every diagonal entry of L.
    pub diag_nz: Vec<usize>,
    /// Assembled output, overwritten on every call.
    pub system: LinearSystem,
}

impl AssemblyCache {
    /// Build the fixed sparsity pattern and nz maps from the operators.
    pub fn new(operators: GradientOperators) -> Result<Self> {
        let d = operators.dim();
        let ne = operators.num_elements();
        let nv = operators.num_vertices();
        let n = d * nv;

        let supports: Vec<Vec<usize>> = (0..ne).map(|e| operators.element_support(e)).collect();
        let blocks: Vec<Array2<f64>> = supports
            .iter()
            .enumerate()
            .map(|(e, s)| operators.element_block(e, s))
            .collect();

        // ── 1. Column sets of L (block diagonal, d identical blocks) ──
        let mut vertex_cols: Vec<BTreeSet<usize>> = (0..nv).map(|v| BTreeSet::from([v])).collect();
        for support in &supports {
            for &sj in support {
                vertex_cols[sj].extend(support.iter().copied());
            }
        }

        let mut indptr = Vec::with_capacity(n + 1);
        let mut indices = Vec::new();
        indptr.push(0);
        for c in 0..d {
            for rows in &vertex_cols {
                indices.extend(rows.iter().map(|&v| dof_index(nv, v, c)));
                indptr.push(indices.len());
            }
        }
        let nnz = indices.len();
        let matrix = CsMat::new_csc((n, n), indptr, indices, vec![0.0; nnz]);

        // ── 2. element → nz map ──
        let ip = matrix.indptr();
        let ip = ip.raw_storage();
        let idx = matrix.indices();
        let mut element_nz = Vec::with_capacity(ne);
        for (e, support) in supports.iter().enumerate() {
            let s = support.len();
            let mut map = Vec::with_capacity(d * s * s);
            for c in 0..d {
                for &si in support {
                    for &sj in support {
                        let row = dof_index(nv, si, c);
                        let col = dof_index(nv, sj, c);
                        let nz = find_nz_index(ip, idx, row, col)
                            .ok_or(AssemblyError::SparsityMismatch { element: e, row, col })?;
                        map.push(nz);
                    }
                }
            }
            element_nz.push(map);
        }

        let mut diag_nz = Vec::with_capacity(n);
        for i in 0..n {
            let nz = find_nz_index(ip, idx, i, i)
                .ok_or(AssemblyError::SparsityMismatch { element: usize::MAX, row: i, col: i })?;
            diag_nz.push(nz);
        }

        tracing::debug!(
            elements = ne,
            vertices = nv,
            dim = d,
            nnz,
            "built assembly pattern"
        );

        Ok(AssemblyCache {
            operators,
            supports,
            blocks,
            element_nz,
            diag_nz,
            system: LinearSystem {
                dim: d,
                matrix,
                rhs: Array1::zeros(n),
            },
        })
    }
}

// ─────────────────────────────────────────────────────────────
//  Helper: find nz index in CSC
// ─────────────────────────────────────────────────────────────

/// Given CSC indptr and indices arrays, find the position of element (row, col)
/// in the data array.  Returns `None` if the entry is not in the sparsity pattern.
pub fn find_nz_index(indptr: &[usize], indices: &[usize], row: usize, col: usize) -> Option<usize> {
    let start = indptr[col];
    let end_ = indptr[col + 1];
    indices[start..end_].binary_search(&row).ok().map(|off| start + off)
}
