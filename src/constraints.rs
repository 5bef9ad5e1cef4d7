//! Soft positional constraints.
//!
//! Adds p_soft·‖u_v − target_v‖² to the energy of an assembled system:
//! p_soft on the diagonal of L and p_soft·target on rhs for every
//! constrained (vertex, coordinate) dof.  Additive only; applying the same
//! set twice counts the penalty twice.

use crate::types::{dof_index, find_nz_index, AssemblyError, LinearSystem, Result, SoftConstraints};

/// Inject `constraints` into `system` in place.
///
/// `system.matrix` must be CSC (as produced by the builders).  A diagonal
/// entry missing from its pattern is inserted.
pub fn apply_soft_constraints(system: &mut LinearSystem, constraints: &SoftConstraints) -> Result<()> {
    if constraints.is_empty() {
        return Ok(());
    }
    let d = system.dim;
    if constraints.targets.ncols() != d {
        return Err(AssemblyError::Shape(format!(
            "constraint targets have {} columns, system is {d}-dimensional",
            constraints.targets.ncols()
        )));
    }
    if d == 0 || system.size() % d != 0 {
        return Err(AssemblyError::Shape(format!(
            "system of size {} does not split into {d} coordinate blocks",
            system.size()
        )));
    }
    if !system.matrix.is_csc() {
        return Err(AssemblyError::Shape("soft constraints expect a CSC system matrix".into()));
    }
    let nv = system.num_vertices();
    if let Some(&v) = constraints.indices.iter().find(|&&v| v >= nv) {
        return Err(AssemblyError::InvalidParameter(format!(
            "constrained vertex {v} out of range ({nv} vertices)"
        )));
    }

    let p = constraints.penalty;
    for (i, &v) in constraints.indices.iter().enumerate() {
        for c in 0..d {
            let dof = dof_index(nv, v, c);
            let nz = {
                let indptr = system.matrix.indptr();
                find_nz_index(indptr.raw_storage(), system.matrix.indices(), dof, dof)
            };
            match nz {
                Some(nz) => system.matrix.data_mut()[nz] += p,
                None => system.matrix.insert(dof, dof, p),
            }
            system.rhs[dof] += p * constraints.targets[[i, c]];
        }
    }

    tracing::debug!(vertices = constraints.len(), penalty = p, "applied soft constraints");
    Ok(())
}
