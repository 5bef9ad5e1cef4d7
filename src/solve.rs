//! Factorization adapter for the assembled system, over `sprs-ldl`.
//!
//! The sparse solve belongs to the caller.  What this adds on top of
//! `sprs_ldl` is pattern keying: the symbolic phase is remembered together
//! with the exact structure of L it was computed for, so repeated systems
//! from one `AssemblyCache` only redo the numeric phase, while any system
//! with a different structure gets a fresh symbolic analysis.

use crate::types::{AssemblyError, LinearSystem, Result};
use ndarray::Array1;
use sprs::errors::{LinalgError, SingularMatrixInfo};
use sprs::{CsMat, FillInReduction, SymmetryCheck};
use sprs_ldl::{Ldl, LdlNumeric};

// ─────────────────────────────────────────────────────────────
//  Factorisation strategy
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorisationStrategy {
    /// LDLᵗ with every pivot required to be positive.
    Cholesky,
    /// LDLᵗ with no sign requirement on the pivots.
    LDL,
}

impl FactorisationStrategy {
    /// Cholesky when λ > 0 or constraints are present, LDL otherwise.
    ///
    /// λ > 0 makes L definite.  Constraints alone only remove the null
    /// directions they touch: a disconnected mesh or a rank-deficient W_e can
    /// leave others, in which case the pivot check in [`SystemSolver::factor`]
    /// reports a `Linalg` error.
    pub fn for_system(lambda: f64, constrained: bool) -> Self {
        if lambda > 0.0 || constrained {
            Self::Cholesky
        } else {
            Self::LDL
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Structural pattern of L
// ─────────────────────────────────────────────────────────────

/// CSC structure a symbolic factorization was computed for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Pattern {
    indptr: Vec<usize>,
    indices: Vec<usize>,
}

impl Pattern {
    fn of(l: &CsMat<f64>) -> Self {
        Self {
            indptr: l.indptr().raw_storage().to_vec(),
            indices: l.indices().to_vec(),
        }
    }

    fn matches(&self, l: &CsMat<f64>) -> bool {
        let indptr = l.indptr();
        self.indptr.as_slice() == indptr.raw_storage() && self.indices.as_slice() == l.indices()
    }

    fn size(&self) -> usize {
        self.indptr.len().saturating_sub(1)
    }
}

struct Factor {
    ldl: LdlNumeric<f64, usize>,
    strategy: FactorisationStrategy,
    pattern: Pattern,
}

fn check_pivots(strategy: FactorisationStrategy, ldl: &LdlNumeric<f64, usize>) -> Result<()> {
    if strategy != FactorisationStrategy::Cholesky {
        return Ok(());
    }
    match ldl.d().iter().position(|&di| di <= 0.0) {
        Some(index) => Err(AssemblyError::Linalg(LinalgError::SingularMatrix(SingularMatrixInfo {
            index,
            reason: "non-positive pivot, L is not positive definite",
        }))),
        None => Ok(()),
    }
}

// ─────────────────────────────────────────────────────────────
//  Reusable solver
// ─────────────────────────────────────────────────────────────

/// Keeps one factorization alive across outer iterations.
pub struct SystemSolver {
    pub strategy: FactorisationStrategy,
    factor: Option<Factor>,
}

impl std::fmt::Debug for SystemSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemSolver")
            .field("strategy", &self.strategy)
            .field("factored_size", &self.factor.as_ref().map(|fac| fac.pattern.size()))
            .finish()
    }
}

impl SystemSolver {
    pub fn new(strategy: FactorisationStrategy) -> Self {
        Self { strategy, factor: None }
    }

    /// Factor `system.matrix` (CSC).
    ///
    /// The numeric phase alone is redone when the strategy and the exact
    /// structure of L match the previous call; otherwise the symbolic phase
    /// is recomputed.  On error no factorization is kept.
    pub fn factor(&mut self, system: &LinearSystem) -> Result<()> {
        let l = &system.matrix;
        if !l.is_csc() {
            return Err(AssemblyError::Shape("factorization expects a CSC system matrix".into()));
        }
        let strategy = self.strategy;
        let factor = match self.factor.take() {
            Some(mut prev) if prev.strategy == strategy && prev.pattern.matches(l) => {
                tracing::trace!(nnz = l.nnz(), "numeric refactorization on unchanged pattern");
                prev.ldl.update(l.view())?;
                check_pivots(strategy, &prev.ldl)?;
                prev
            }
            _ => {
                tracing::debug!(size = system.size(), nnz = l.nnz(), ?strategy, "symbolic factorization");
                let ldl = Ldl::new()
                    .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
                    .check_symmetry(SymmetryCheck::DontCheckSymmetry)
                    .numeric(l.view())?;
                check_pivots(strategy, &ldl)?;
                Factor {
                    ldl,
                    strategy,
                    pattern: Pattern::of(l),
                }
            }
        };
        self.factor = Some(factor);
        Ok(())
    }

    pub fn solve(&self, rhs: &Array1<f64>) -> Result<Array1<f64>> {
        let factor = self.factor.as_ref().ok_or(AssemblyError::MissingFactorization)?;
        if rhs.len() != factor.pattern.size() {
            return Err(AssemblyError::Shape(format!(
                "right-hand side has length {}, factorization has size {}",
                rhs.len(),
                factor.pattern.size()
            )));
        }
        Ok(Array1::from(factor.ldl.solve(&rhs.to_vec())))
    }
}

/// One-shot factor and solve of `system`.
pub fn solve_system(system: &LinearSystem, strategy: FactorisationStrategy) -> Result<Array1<f64>> {
    let mut solver = SystemSolver::new(strategy);
    solver.factor(system)?;
    solver.solve(&system.rhs)
}
