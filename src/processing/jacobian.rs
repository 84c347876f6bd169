use nalgebra::Matrix3;
use rayon::prelude::*;
use serde::Serialize;

use super::process_utils::axis_derivative;
use crate::error::PipelineError;
use crate::io::Grid;
use crate::registration::DeformationField;

/// Voxel-wise determinant of the Jacobian of `x -> x + u(x)`.
#[derive(Debug, Clone, PartialEq)]
pub struct JacobianMap {
    pub grid: Grid,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JacobianSummary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub folded_voxels: usize,
}

/// Determinants for every voxel, in grid order. Values are not clamped.
pub fn jacobian_determinants(field: &DeformationField) -> Vec<f64> {
    let grid = field.grid;
    (0..grid.len())
        .into_par_iter()
        .map(|idx| determinant_at(field, grid.coords(idx)))
        .collect()
}

fn determinant_at(field: &DeformationField, c: [usize; 3]) -> f64 {
    let grid = &field.grid;
    let du_dx = axis_derivative(grid, &field.vectors, c, 0);
    let du_dy = axis_derivative(grid, &field.vectors, c, 1);
    let du_dz = axis_derivative(grid, &field.vectors, c, 2);
    let jacobian = Matrix3::identity() + Matrix3::from_columns(&[du_dx, du_dy, du_dz]);
    jacobian.determinant()
}

pub fn build_jacobian_map(field: &DeformationField) -> Result<JacobianMap, PipelineError> {
    if field.grid.is_empty() || field.vectors.len() != field.grid.len() {
        return Err(PipelineError::InvalidInput(format!(
            "deformation field with {} vectors does not fill grid {:?}",
            field.vectors.len(),
            field.grid.dims
        )));
    }
    Ok(JacobianMap {
        grid: field.grid,
        values: jacobian_determinants(field),
    })
}

impl JacobianMap {
    pub fn summary(&self) -> JacobianSummary {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut folded_voxels = 0;
        for &v in &self.values {
            min = min.min(v);
            max = max.max(v);
            sum += v;
            if v <= 0.0 {
                folded_voxels += 1;
            }
        }
        JacobianSummary {
            min,
            max,
            mean: sum / self.values.len().max(1) as f64,
            folded_voxels,
        }
    }

    /// Values of one axial (constant z) slice, x-fastest.
    pub fn axial_slice(&self, z: usize) -> &[f64] {
        let len = self.grid.slice_len();
        let z = z.min(self.grid.dims[2].saturating_sub(1));
        &self.values[z * len..(z + 1) * len]
    }
}
