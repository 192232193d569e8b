//! Lagrange interpolation at x = 0

use super::curve::{scalar_from_id, ProjectivePoint, Scalar};
use crate::error::{NodeError, Result};
use crate::types::PartnerId;
use std::collections::BTreeSet;

fn check_indices(indices: &[PartnerId]) -> Result<()> {
    let unique: BTreeSet<_> = indices.iter().collect();
    if unique.len() != indices.len() {
        return Err(NodeError::crypto("duplicate index in interpolation set"));
    }
    if unique.contains(&0) {
        return Err(NodeError::crypto("index 0 cannot hold a share"));
    }
    Ok(())
}

/// λ_i(0) = Π_{j≠i} x_j / (x_j - x_i) over the index set
pub fn lagrange_coefficient(id: PartnerId, indices: &[PartnerId]) -> Result<Scalar> {
    check_indices(indices)?;
    if !indices.contains(&id) {
        return Err(NodeError::crypto(format!(
            "index {} not in interpolation set",
            id
        )));
    }

    let x_i = scalar_from_id(id);
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    for &j in indices.iter().filter(|&&j| j != id) {
        let x_j = scalar_from_id(j);
        numerator *= x_j;
        denominator *= x_j - x_i;
    }

    Option::<Scalar>::from(denominator.invert())
        .map(|inv| numerator * inv)
        .ok_or_else(|| NodeError::crypto("non-invertible Lagrange denominator"))
}

/// Reconstruct f(0) from (x_i, f(x_i)) pairs
pub fn interpolate_scalar(points: &[(PartnerId, Scalar)]) -> Result<Scalar> {
    let indices: Vec<PartnerId> = points.iter().map(|(id, _)| *id).collect();
    let mut result = Scalar::ZERO;
    for (id, value) in points {
        result += lagrange_coefficient(*id, &indices)? * value;
    }
    Ok(result)
}

/// Reconstruct g^{f(0)} from (x_i, g^{f(x_i)}) pairs
pub fn interpolate_point(points: &[(PartnerId, ProjectivePoint)]) -> Result<ProjectivePoint> {
    let indices: Vec<PartnerId> = points.iter().map(|(id, _)| *id).collect();
    let mut result = ProjectivePoint::IDENTITY;
    for (id, point) in points {
        result += *point * lagrange_coefficient(*id, &indices)?;
    }
    Ok(result)
}
