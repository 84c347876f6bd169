use anyhow::{anyhow, bail, Context, Result};
use csv::ReaderBuilder;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Grid, LabelVolume, ScanPair, SubjectInput, Volume};

/// Utility: detect whether the file uses comma or tab as delimiter.
fn detect_delimiter<P: AsRef<Path>>(path: P) -> Result<u8> {
    let file = File::open(&path).with_context(|| {
        format!(
            "failed to open file for delimiter sniffing: {:?}",
            path.as_ref()
        )
    })?;
    let mut reader = BufReader::new(file);
    let mut first_line = String::new();
    reader
        .read_line(&mut first_line)
        .with_context(|| "failed to read first line for delimiter detection")?;

    let tabs = first_line.matches('\t').count();
    let commas = first_line.matches(',').count();

    if tabs > commas {
        Ok(b'\t')
    } else {
        Ok(b',')
    }
}

/// One voxel row: `x,y,z,value` with a header line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VoxelRecord {
    pub x: usize,
    pub y: usize,
    pub z: usize,
    pub value: f64,
}

/// Reads a dense voxel table. Every voxel of `dims` must appear exactly once.
pub fn read_voxel_csv<P: AsRef<Path>>(path: P, dims: [usize; 3]) -> Result<Vec<f64>> {
    let grid = Grid::new(dims);
    if grid.is_empty() {
        bail!("grid {:?} has no voxels", dims);
    }
    let delim = detect_delimiter(&path)?;
    let file = File::open(&path)
        .with_context(|| format!("failed to open voxel file {:?}", path.as_ref()))?;
    let mut reader = ReaderBuilder::new()
        .delimiter(delim)
        .has_headers(true)
        .from_reader(file);

    let mut values: Vec<Option<f64>> = vec![None; grid.len()];
    for (row, result) in reader.deserialize().enumerate() {
        let record: VoxelRecord =
            result.with_context(|| format!("invalid voxel row {} in {:?}", row + 1, path.as_ref()))?;
        if record.x >= dims[0] || record.y >= dims[1] || record.z >= dims[2] {
            bail!(
                "voxel ({}, {}, {}) lies outside grid {:?}",
                record.x,
                record.y,
                record.z,
                dims
            );
        }
        let slot = &mut values[grid.index(record.x, record.y, record.z)];
        if slot.is_some() {
            bail!(
                "voxel ({}, {}, {}) appears twice in {:?}",
                record.x,
                record.y,
                record.z,
                path.as_ref()
            );
        }
        *slot = Some(record.value);
    }

    values
        .into_iter()
        .enumerate()
        .map(|(idx, v)| {
            v.ok_or_else(|| {
                let [x, y, z] = grid.coords(idx);
                anyhow!("voxel ({}, {}, {}) missing from {:?}", x, y, z, path.as_ref())
            })
        })
        .collect()
}

pub fn read_volume<P: AsRef<Path>>(path: P, dims: [usize; 3]) -> Result<Volume> {
    let data = read_voxel_csv(&path, dims)?;
    Volume::new(dims, data).with_context(|| format!("invalid volume {:?}", path.as_ref()))
}

/// Label values must be non-negative integers.
pub fn read_label_volume<P: AsRef<Path>>(path: P, dims: [usize; 3]) -> Result<LabelVolume> {
    let values = read_voxel_csv(&path, dims)?;
    let labels = values
        .iter()
        .map(|v| {
            if v.fract() == 0.0 && *v >= 0.0 && *v <= u32::MAX as f64 {
                Ok(*v as u32)
            } else {
                Err(anyhow!("label value {} is not a non-negative integer", v))
            }
        })
        .collect::<Result<Vec<u32>>>()
        .with_context(|| format!("invalid label volume {:?}", path.as_ref()))?;
    LabelVolume::new(dims, labels)
}

/// `subject.toml`: where one subject's volumes live plus its demographics.
/// Relative paths resolve against the manifest's directory.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubjectManifest {
    pub subject_id: String,
    pub dims: [usize; 3],
    pub baseline: PathBuf,
    pub followup: PathBuf,
    pub labels: PathBuf,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub interval_days: Option<f64>,
}

pub fn read_manifest<P: AsRef<Path>>(path: P) -> Result<SubjectManifest> {
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read subject manifest {:?}", path.as_ref()))?;
    toml::from_str(&text).with_context(|| format!("failed to parse subject manifest {:?}", path.as_ref()))
}

pub fn load_subject<P: AsRef<Path>>(manifest_path: P) -> Result<SubjectInput> {
    let manifest = read_manifest(&manifest_path)?;
    let base = manifest_path
        .as_ref()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let resolve = |p: &Path| if p.is_absolute() { p.to_path_buf() } else { base.join(p) };

    let baseline = read_volume(resolve(manifest.baseline.as_path()), manifest.dims)
        .with_context(|| format!("baseline scan of subject '{}'", manifest.subject_id))?;
    let followup = read_volume(resolve(manifest.followup.as_path()), manifest.dims)
        .with_context(|| format!("follow-up scan of subject '{}'", manifest.subject_id))?;
    let labels = read_label_volume(resolve(manifest.labels.as_path()), manifest.dims)
        .with_context(|| format!("labels of subject '{}'", manifest.subject_id))?;

    Ok(SubjectInput {
        subject_id: manifest.subject_id,
        scans: Arc::new(ScanPair::new(baseline, followup)?),
        labels,
        age: manifest.age,
        sex: manifest.sex,
        interval_days: manifest.interval_days,
    })
}
