use anyhow::{anyhow, Result};
use std::path::{Component, Path};
use tracing::warn;

use super::SubjectInput;

pub fn check_subject_integrity(input: &SubjectInput) -> Result<()> {
    if input.subject_id.trim().is_empty() {
        return Err(anyhow!("Subject has an empty id"));
    }

    let checks: &[(&str, fn(&SubjectInput) -> Result<()>)] = &[
        ("check_subject_id", check_subject_id),
        ("check_scan_grids", check_scan_grids),
        ("check_label_grid", check_label_grid),
        ("check_finite_intensities", check_finite_intensities),
        ("check_interval", check_interval),
    ];

    for (name, f) in checks {
        if let Err(e) = f(input) {
            warn!(subject = %input.subject_id, check = *name, error = %e, "integrity check failed");
            return Err(e);
        }
    }

    Ok(())
}

fn check_subject_id(input: &SubjectInput) -> Result<()> {
    validate_subject_id(&input.subject_id)
}

/// The id names the subject's output directory, so it must be one plain path component.
pub fn validate_subject_id(id: &str) -> Result<()> {
    let mut components = Path::new(id).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !single_normal || id.contains(['/', '\\']) || id == ".." || id == "." {
        return Err(anyhow!("Subject id '{}' is not a plain directory name", id));
    }
    Ok(())
}

/// Baseline and follow-up share one non-empty grid and fill it
fn check_scan_grids(input: &SubjectInput) -> Result<()> {
    let scans = &input.scans;
    if scans.baseline.grid.is_empty() {
        return Err(anyhow!("Baseline grid {:?} has no voxels", scans.baseline.grid.dims));
    }
    if scans.baseline.grid != scans.followup.grid {
        return Err(anyhow!(
            "Baseline grid {:?} and follow-up grid {:?} differ",
            scans.baseline.grid.dims,
            scans.followup.grid.dims
        ));
    }
    for (name, volume) in [("baseline", &scans.baseline), ("follow-up", &scans.followup)] {
        if volume.data.len() != volume.grid.len() {
            return Err(anyhow!(
                "{} holds {} values for {} voxels",
                name,
                volume.data.len(),
                volume.grid.len()
            ));
        }
    }
    Ok(())
}

/// Label volume sits on the scan grid
fn check_label_grid(input: &SubjectInput) -> Result<()> {
    let grid = input.scans.grid();
    if input.labels.grid != grid || input.labels.labels.len() != grid.len() {
        return Err(anyhow!(
            "Label grid {:?} does not match scan grid {:?}",
            input.labels.grid.dims,
            grid.dims
        ));
    }
    Ok(())
}

fn check_finite_intensities(input: &SubjectInput) -> Result<()> {
    for (name, volume) in [("baseline", &input.scans.baseline), ("follow-up", &input.scans.followup)] {
        if let Some(idx) = volume.data.iter().position(|v| !v.is_finite()) {
            return Err(anyhow!("{} intensity at voxel {} is not finite", name, idx));
        }
    }
    Ok(())
}

fn check_interval(input: &SubjectInput) -> Result<()> {
    match input.interval_days {
        Some(days) if !(days.is_finite() && days > 0.0) => {
            Err(anyhow!("Scan interval of {} days is not a positive number", days))
        }
        _ => Ok(()),
    }
}
