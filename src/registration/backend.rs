use serde::{Deserialize, Serialize};
use std::fmt;

use super::field::DeformationField;
use crate::error::BackendError;
use crate::io::Volume;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendId {
    Learned,
    Classical,
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendId::Learned => write!(f, "learned"),
            BackendId::Classical => write!(f, "classical"),
        }
    }
}

/// A deformable registration solver.
///
/// Implementations map the fixed volume's coordinates onto the moving
/// volume's, returning one displacement vector per voxel. They must not keep
/// mutable state between calls; the fallback controller only ever talks to
/// this trait.
pub trait DeformationBackend: Send + Sync {
    fn id(&self) -> BackendId;

    /// Whether the backend is configured and can be attempted at all.
    fn is_available(&self) -> bool {
        true
    }

    /// Accelerator-bound backends are serialized through the shared
    /// accelerator pool.
    fn uses_accelerator(&self) -> bool {
        false
    }

    fn register(&self, fixed: &Volume, moving: &Volume) -> Result<DeformationField, BackendError>;
}

pub(crate) fn check_same_grid(
    fixed: &Volume,
    moving: &Volume,
) -> Result<(), BackendError> {
    if fixed.grid.is_empty() {
        return Err(BackendError::MalformedInput("empty image grid".into()));
    }
    if fixed.grid != moving.grid {
        return Err(BackendError::MalformedInput(format!(
            "fixed grid {:?} and moving grid {:?} differ",
            fixed.grid.dims, moving.grid.dims
        )));
    }
    if fixed.data.len() != fixed.grid.len() || moving.data.len() != moving.grid.len() {
        return Err(BackendError::MalformedInput(
            "volume data does not fill its grid".into(),
        ));
    }
    Ok(())
}
