use nalgebra::Vector3;
use rayon::prelude::*;

use super::backend::BackendId;
use crate::error::BackendError;
use crate::io::{Grid, Volume};

/// Dense displacement field in voxel units. `u(x)` maps a fixed-image voxel
/// `x` to the moving-image position `x + u(x)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeformationField {
    pub grid: Grid,
    pub vectors: Vec<Vector3<f64>>,
    pub backend_id: BackendId,
    pub attempt_index: usize,
}

impl DeformationField {
    pub fn new(
        grid: Grid,
        vectors: Vec<Vector3<f64>>,
        backend_id: BackendId,
    ) -> Result<Self, BackendError> {
        if grid.is_empty() {
            return Err(BackendError::MalformedInput("empty field grid".into()));
        }
        if vectors.len() != grid.len() {
            return Err(BackendError::MalformedInput(format!(
                "field has {} vectors for a grid of {} voxels",
                vectors.len(),
                grid.len()
            )));
        }
        if let Some(voxel) = vectors.iter().position(|v| !v.iter().all(|c| c.is_finite())) {
            return Err(BackendError::MalformedInput(format!(
                "non-finite displacement at voxel {}",
                voxel
            )));
        }
        Ok(Self {
            grid,
            vectors,
            backend_id,
            attempt_index: 0,
        })
    }

    /// Zero displacement everywhere.
    pub fn identity(grid: Grid, backend_id: BackendId) -> Self {
        Self {
            grid,
            vectors: vec![Vector3::zeros(); grid.len()],
            backend_id,
            attempt_index: 0,
        }
    }

    /// Stamps the attempt that produced this field.
    pub fn tagged(mut self, attempt_index: usize) -> Self {
        self.attempt_index = attempt_index;
        self
    }

    /// Moving-image position that voxel `idx` maps to.
    #[inline]
    pub fn mapped_point(&self, idx: usize) -> [f64; 3] {
        let c = self.grid.coords(idx);
        let u = self.vectors[idx];
        [c[0] as f64 + u.x, c[1] as f64 + u.y, c[2] as f64 + u.z]
    }

    /// Resamples `moving` into the fixed frame: `warped(x) = moving(x + u(x))`.
    pub fn warp(&self, moving: &Volume) -> Volume {
        let data: Vec<f64> = (0..self.grid.len())
            .into_par_iter()
            .map(|idx| moving.sample(self.mapped_point(idx)))
            .collect();
        Volume {
            grid: self.grid,
            data,
        }
    }

    pub fn magnitudes(&self) -> Vec<f64> {
        self.vectors.iter().map(|v| v.norm()).collect()
    }
}
