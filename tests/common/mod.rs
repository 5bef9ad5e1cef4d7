//! Shared mesh fixtures: P1 gradient operators for triangles and tetrahedra.
#![allow(dead_code)]

use approx::assert_abs_diff_eq;
use localglobal::types::*;
use ndarray::{Array1, Array2, Array3};
use sprs::{CsMat, TriMat};

// ─────────────────────────────────────────────────────────────
//  Small dense inverse (Gauss–Jordan, d ≤ 3)
// ─────────────────────────────────────────────────────────────

fn invert(m: &Array2<f64>) -> Array2<f64> {
    let n = m.nrows();
    let mut a = m.clone();
    let mut inv = Array2::eye(n);
    for col in 0..n {
        let pivot_row = (col..n)
            .max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))
            .unwrap();
        for j in 0..n {
            a.swap([col, j], [pivot_row, j]);
            inv.swap([col, j], [pivot_row, j]);
        }
        let p = a[[col, col]];
        assert!(p.abs() > 1e-14, "degenerate element");
        for j in 0..n {
            a[[col, j]] /= p;
            inv[[col, j]] /= p;
        }
        for i in 0..n {
            if i != col {
                let f = a[[i, col]];
                for j in 0..n {
                    a[[i, j]] -= f * a[[col, j]];
                    inv[[i, j]] -= f * inv[[col, j]];
                }
            }
        }
    }
    inv
}

/// Edge matrix E with columns x_i − x_0.
fn edge_matrix(vertices: &Array2<f64>, element: &[usize]) -> Array2<f64> {
    let d = vertices.ncols();
    Array2::from_shape_fn((d, d), |(axis, i)| {
        vertices[[element[i + 1], axis]] - vertices[[element[0], axis]]
    })
}

// ─────────────────────────────────────────────────────────────
//  Gradient operators and areas
// ─────────────────────────────────────────────────────────────

/// Piecewise-linear gradient operators: G_axis[e, v] = ∂φ_v/∂axis on e.
pub fn p1_gradient_operators(vertices: &Array2<f64>, elements: &[Vec<usize>]) -> GradientOperators {
    let (nv, d) = vertices.dim();
    let ne = elements.len();
    let mut tris: Vec<TriMat<f64>> = (0..d).map(|_| TriMat::new((ne, nv))).collect();
    for (e, element) in elements.iter().enumerate() {
        let inv = invert(&edge_matrix(vertices, element));
        for axis in 0..d {
            let mut sum = 0.0;
            for i in 0..d {
                let g = inv[[i, axis]];
                tris[axis].add_triplet(e, element[i + 1], g);
                sum += g;
            }
            tris[axis].add_triplet(e, element[0], -sum);
        }
    }
    let axes: Vec<CsMat<f64>> = tris.iter().map(|t| t.to_csr()).collect();
    GradientOperators::new(axes).unwrap()
}

/// Unsigned area (2D) or volume (3D) of every element.
pub fn element_areas(vertices: &Array2<f64>, elements: &[Vec<usize>]) -> Vec<f64> {
    elements
        .iter()
        .map(|element| {
            let e = edge_matrix(vertices, element);
            let det = if e.nrows() == 2 {
                e[[0, 0]] * e[[1, 1]] - e[[0, 1]] * e[[1, 0]]
            } else {
                e[[0, 0]] * (e[[1, 1]] * e[[2, 2]] - e[[1, 2]] * e[[2, 1]])
                    - e[[0, 1]] * (e[[1, 0]] * e[[2, 2]] - e[[1, 2]] * e[[2, 0]])
                    + e[[0, 2]] * (e[[1, 0]] * e[[2, 1]] - e[[1, 1]] * e[[2, 0]])
            };
            let factorial = if e.nrows() == 2 { 2.0 } else { 6.0 };
            det.abs() / factorial
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────
//  Meshes
// ─────────────────────────────────────────────────────────────

/// (0,0), (1,0), (0,1).
pub fn unit_triangle() -> (Array2<f64>, Vec<Vec<usize>>) {
    let v = Array2::from_shape_vec((3, 2), vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0]).unwrap();
    (v, vec![vec![0, 1, 2]])
}

/// Corner tetrahedron on the unit axes.
pub fn unit_tet() -> (Array2<f64>, Vec<Vec<usize>>) {
    let v = Array2::from_shape_vec(
        (4, 3),
        vec![
            0.0, 0.0, 0.0,
            1.0, 0.0, 0.0,
            0.0, 1.0, 0.0,
            0.0, 0.0, 1.0,
        ],
    )
    .unwrap();
    (v, vec![vec![0, 1, 2, 3]])
}

/// Two tetrahedra sharing a face, slightly skewed.
pub fn two_tets() -> (Array2<f64>, Vec<Vec<usize>>) {
    let v = Array2::from_shape_vec(
        (5, 3),
        vec![
            0.0, 0.0, 0.0,
            1.0, 0.1, 0.0,
            0.2, 1.0, 0.0,
            0.1, 0.2, 1.0,
            0.9, 0.8, 0.9,
        ],
    )
    .unwrap();
    (v, vec![vec![0, 1, 2, 3], vec![1, 2, 3, 4]])
}

/// `n` × `n` square cells on [0, 1]², each split into two triangles.
pub fn grid_mesh(n: usize) -> (Array2<f64>, Vec<Vec<usize>>) {
    let side = n + 1;
    let h = 1.0 / n as f64;
    let mut v = Array2::zeros((side * side, 2));
    for j in 0..side {
        for i in 0..side {
            v[[j * side + i, 0]] = i as f64 * h;
            v[[j * side + i, 1]] = j as f64 * h;
        }
    }
    let mut elements = Vec::with_capacity(2 * n * n);
    for j in 0..n {
        for i in 0..n {
            let a = j * side + i;
            let b = a + 1;
            let c = a + side;
            let d = c + 1;
            elements.push(vec![a, b, d]);
            elements.push(vec![a, d, c]);
        }
    }
    (v, elements)
}

// ─────────────────────────────────────────────────────────────
//  Deterministic per-element frames
// ─────────────────────────────────────────────────────────────

/// Smoothly varying, non-symmetric weights and targets.
pub fn wavy_frames(num_elements: usize, dim: usize) -> ElementFrames {
    let weights = Array3::from_shape_fn((num_elements, dim, dim), |(e, r, c)| {
        let base = if r == c { 1.5 } else { 0.0 };
        base + 0.3 * (1.7 * e as f64 + 0.9 * r as f64 + 0.4 * c as f64).sin()
    });
    let targets = Array3::from_shape_fn((num_elements, dim, dim), |(e, r, c)| {
        let base = if r == c { 1.0 } else { 0.0 };
        base + 0.2 * (0.7 * e as f64 - 1.3 * r as f64 + 2.1 * c as f64).cos()
    });
    ElementFrames { weights, targets }
}

/// Smooth nonlinear deformation of the rest positions.
pub fn bent(vertices: &Array2<f64>, amount: f64) -> Array2<f64> {
    let mut u = vertices.clone();
    for mut row in u.rows_mut() {
        let x = row[0];
        let y = row[1];
        row[0] = x + amount * (2.0 * y).sin();
        row[1] = y + amount * x * x;
    }
    u
}

pub fn assert_vec_close(actual: &Array1<f64>, expected: &Array1<f64>, tol: f64) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*a, *e, epsilon = tol);
    }
}

pub fn assert_mat_close(actual: &Array2<f64>, expected: &Array2<f64>, tol: f64) {
    assert_eq!(actual.dim(), expected.dim());
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*a, *e, epsilon = tol);
    }
}
