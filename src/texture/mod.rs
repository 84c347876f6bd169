pub mod texture;

use anyhow::Context;
use std::path::{Path, PathBuf};

use crate::io::Volume;
use crate::processing::jacobian::JacobianMap;
use texture::{create_grayscale_slice, create_heatmap, deviation_span};

/// File names of the rendered context images inside a subject's output directory.
pub const HEATMAP_FILE: &str = "jacobian_heatmap.png";
pub const FOLLOWUP_SLICE_FILE: &str = "followup_axial_slice.png";

/// Pixels per voxel in the exported images.
const UPSCALE: u32 = 4;

/// Writes the mid-axial slice of the Jacobian map as a diverging heatmap PNG.
pub fn write_jacobian_heatmap(map: &JacobianMap, path: &Path) -> anyhow::Result<PathBuf> {
    let [nx, ny, nz] = map.grid.dims;
    let slice = map.axial_slice(nz / 2);
    let span = deviation_span(slice, 1e-6);
    let img = create_heatmap(slice, nx as u32, ny as u32, span, UPSCALE);
    img.save(path)
        .with_context(|| format!("failed to write Jacobian heatmap {:?}", path))?;
    Ok(path.to_path_buf())
}

/// Writes the mid-axial slice of a scan as a windowed grayscale PNG.
pub fn write_scan_slice(volume: &Volume, path: &Path) -> anyhow::Result<PathBuf> {
    let [nx, ny, nz] = volume.grid.dims;
    let len = volume.grid.slice_len();
    let z = nz / 2;
    let slice = &volume.data[z * len..(z + 1) * len];
    let img = create_grayscale_slice(slice, nx as u32, ny as u32, UPSCALE);
    img.save(path)
        .with_context(|| format!("failed to write scan slice {:?}", path))?;
    Ok(path.to_path_buf())
}
