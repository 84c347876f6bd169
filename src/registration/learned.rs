use nalgebra::Vector3;
use std::sync::Arc;
use tracing::{debug, warn};

use super::backend::{check_same_grid, BackendId, DeformationBackend};
use super::field::DeformationField;
use crate::error::BackendError;
use crate::io::Volume;

/// A pretrained field-prediction model living outside this crate.
///
/// One forward evaluation per call, returning one displacement per voxel in
/// grid order.
pub trait FieldPredictor: Send + Sync {
    fn predict(&self, fixed: &Volume, moving: &Volume) -> anyhow::Result<Vec<Vector3<f64>>>;
}

impl<F> FieldPredictor for F
where
    F: Fn(&Volume, &Volume) -> anyhow::Result<Vec<Vector3<f64>>> + Send + Sync,
{
    fn predict(&self, fixed: &Volume, moving: &Volume) -> anyhow::Result<Vec<Vector3<f64>>> {
        self(fixed, moving)
    }
}

/// Learned registration. Unavailable when no predictor is attached.
#[derive(Clone, Default)]
pub struct LearnedBackend {
    predictor: Option<Arc<dyn FieldPredictor>>,
}

impl LearnedBackend {
    pub fn new(predictor: Option<Arc<dyn FieldPredictor>>) -> Self {
        Self { predictor }
    }

    pub fn unavailable() -> Self {
        Self { predictor: None }
    }
}

impl DeformationBackend for LearnedBackend {
    fn id(&self) -> BackendId {
        BackendId::Learned
    }

    fn is_available(&self) -> bool {
        self.predictor.is_some()
    }

    fn uses_accelerator(&self) -> bool {
        true
    }

    fn register(&self, fixed: &Volume, moving: &Volume) -> Result<DeformationField, BackendError> {
        let predictor = self
            .predictor
            .as_ref()
            .ok_or(BackendError::Unavailable(BackendId::Learned))?;
        check_same_grid(fixed, moving)?;

        let vectors = predictor
            .predict(fixed, moving)
            .map_err(|e| BackendError::PredictionFailed(format!("{:#}", e)))?;
        let grid = fixed.grid;
        if vectors.len() != grid.len() {
            return Err(BackendError::PredictionFailed(format!(
                "model returned {} vectors for {} voxels",
                vectors.len(),
                grid.len()
            )));
        }
        if vectors.iter().any(|v| !v.iter().all(|c| c.is_finite())) {
            return Err(BackendError::PredictionFailed(
                "model returned non-finite displacements".into(),
            ));
        }

        let field = DeformationField::new(grid, vectors, BackendId::Learned)?;
        if let Some(voxel) = (0..grid.len()).find(|&idx| !grid.contains_point(field.mapped_point(idx))) {
            warn!(voxel, "learned field maps outside the image grid");
            return Err(BackendError::OutOfGrid { voxel });
        }
        debug!(voxels = grid.len(), "learned field predicted");
        Ok(field)
    }
}
