use nalgebra::Vector3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::backend::{check_same_grid, BackendId, DeformationBackend};
use super::field::DeformationField;
use crate::error::{BackendError, ConfigError};
use crate::io::Volume;
use crate::processing::process_utils::{axis_derivative, gaussian_kernel, smooth_separable};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassicalParams {
    /// Hard iteration budget.
    pub iterations: usize,
    /// Gaussian regularization of the field after every update, in voxels.
    pub smoothing_sigma: f64,
    /// Largest per-voxel update in one iteration, in voxels.
    pub max_step: f64,
    /// Stop early once the mean update magnitude drops below this.
    pub tolerance: f64,
}

impl Default for ClassicalParams {
    fn default() -> Self {
        Self {
            iterations: 50,
            smoothing_sigma: 1.0,
            max_step: 0.5,
            tolerance: 1e-4,
        }
    }
}

impl ClassicalParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iterations == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "classical.iterations",
                reason: "must be at least 1".into(),
            });
        }
        if !(self.smoothing_sigma.is_finite() && self.smoothing_sigma >= 0.0) {
            return Err(ConfigError::InvalidSetting {
                name: "classical.smoothing_sigma",
                reason: format!("{} is not a non-negative number", self.smoothing_sigma),
            });
        }
        if !(self.max_step.is_finite() && self.max_step > 0.0) {
            return Err(ConfigError::InvalidSetting {
                name: "classical.max_step",
                reason: format!("{} is not positive", self.max_step),
            });
        }
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            return Err(ConfigError::InvalidSetting {
                name: "classical.tolerance",
                reason: format!("{} is not a non-negative number", self.tolerance),
            });
        }
        Ok(())
    }
}

/// Demons-style diffeomorphic solver driven by the fixed-image gradient.
///
/// Deterministic and always returns a field within the iteration budget;
/// only malformed input is an error.
#[derive(Debug, Clone, Default)]
pub struct ClassicalBackend {
    params: ClassicalParams,
}

impl ClassicalBackend {
    pub fn new(params: ClassicalParams) -> Self {
        Self { params }
    }
}

impl DeformationBackend for ClassicalBackend {
    fn id(&self) -> BackendId {
        BackendId::Classical
    }

    fn register(&self, fixed: &Volume, moving: &Volume) -> Result<DeformationField, BackendError> {
        check_same_grid(fixed, moving)?;
        let grid = fixed.grid;
        let n = grid.len();
        let kernel = gaussian_kernel(self.params.smoothing_sigma);

        let gradient: Vec<Vector3<f64>> = (0..n)
            .into_par_iter()
            .map(|idx| {
                let c = grid.coords(idx);
                Vector3::new(
                    axis_derivative(&grid, &fixed.data, c, 0),
                    axis_derivative(&grid, &fixed.data, c, 1),
                    axis_derivative(&grid, &fixed.data, c, 2),
                )
            })
            .collect();

        let mut field = DeformationField::identity(grid, BackendId::Classical);
        let mut iterations_run = 0;
        for _ in 0..self.params.iterations {
            iterations_run += 1;
            let warped = field.warp(moving);
            let max_step = self.params.max_step;
            let updates: Vec<Vector3<f64>> = (0..n)
                .into_par_iter()
                .map(|idx| {
                    let diff = fixed.data[idx] - warped.data[idx];
                    let g = gradient[idx];
                    let denom = g.norm_squared() + diff * diff;
                    if denom < 1e-12 {
                        return Vector3::zeros();
                    }
                    let step = g * (diff / denom);
                    let len = step.norm();
                    if len > max_step {
                        step * (max_step / len)
                    } else {
                        step
                    }
                })
                .collect();

            // sequential sum keeps the stopping rule bit-for-bit reproducible
            let mean_update = updates.iter().map(|u| u.norm()).sum::<f64>() / n as f64;
            for (u, du) in field.vectors.iter_mut().zip(&updates) {
                *u += du;
            }
            field.vectors = smooth_separable(&grid, &field.vectors, &kernel);

            if mean_update < self.params.tolerance {
                break;
            }
        }
        debug!(iterations = iterations_run, "classical registration finished");
        Ok(field)
    }
}
