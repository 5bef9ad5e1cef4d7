//! **localglobal** — Jacobian evaluation and normal-equations assembly for
//! local-global distortion minimisation on triangle and tetrahedral meshes.
//!
//! One outer iteration of the surrounding solver flows through:
//!
//! 1. **Jacobians** (`jacobian`): J_e of the current map from the gradient operators.
//! 2. **Operator / targets** (`operator`): the weighted operator A and the
//!    weighted target vector b from externally fitted W_e, R_e.
//! 3. **System** (`system`): L = AᵗMA + λI, rhs = AᵗMb + λU_old, either
//!    directly or into a cached sparsity pattern.
//! 4. **Constraints** (`constraints`): soft positional anchors.
//! 5. **Solve** (`solve`): `sprs-ldl` factorization adapter for the result.
//!
//! Coordinates are flattened column by column (all u, then all v, …).

pub mod types;
pub mod jacobian;
pub mod operator;
pub mod system;
pub mod constraints;
pub mod solve;

pub use constraints::apply_soft_constraints;
pub use jacobian::evaluate_jacobians;
pub use operator::{area_measure, assemble_targets, assemble_weighted_operator};
pub use solve::{solve_system, FactorisationStrategy, SystemSolver};
pub use system::{assemble_system, build_linear_system, proxy_energy};
pub use types::*;
