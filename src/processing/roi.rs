use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::jacobian::JacobianMap;
use super::RegionMap;
use crate::error::{ConfigError, PipelineError};
use crate::io::LabelVolume;

/// Voxels summed per task when aggregating regions.
const SUM_CHUNK: usize = 1 << 14;

/// A named region built from one or more atlas labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionDefinition {
    pub name: String,
    pub labels: Vec<u32>,
}

/// Region grouping. With no `regions` every distinct label is its own region.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoiConfig {
    pub regions: Vec<RegionDefinition>,
    pub background_label: Option<u32>,
    pub required_regions: Vec<String>,
}

impl RoiConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut owner: HashMap<u32, &str> = HashMap::new();
        let mut names = HashSet::new();
        for region in &self.regions {
            if region.name.trim().is_empty() {
                return Err(ConfigError::InvalidSetting {
                    name: "roi.regions",
                    reason: "region name is empty".into(),
                });
            }
            if !names.insert(region.name.as_str()) {
                return Err(ConfigError::InvalidSetting {
                    name: "roi.regions",
                    reason: format!("region '{}' is defined twice", region.name),
                });
            }
            if region.labels.is_empty() {
                return Err(ConfigError::InvalidSetting {
                    name: "roi.regions",
                    reason: format!("region '{}' has no labels", region.name),
                });
            }
            for &label in &region.labels {
                if Some(label) == self.background_label {
                    return Err(ConfigError::InvalidSetting {
                        name: "roi.regions",
                        reason: format!(
                            "region '{}' uses the background label {}",
                            region.name, label
                        ),
                    });
                }
                if let Some(first) = owner.insert(label, region.name.as_str()) {
                    if first != region.name {
                        return Err(ConfigError::OverlappingLabel {
                            label,
                            first: first.to_string(),
                            second: region.name.clone(),
                        });
                    }
                }
            }
        }
        if !self.regions.is_empty() {
            if let Some(missing) = self.required_regions.iter().find(|r| !names.contains(r.as_str())) {
                return Err(ConfigError::InvalidSetting {
                    name: "roi.required_regions",
                    reason: format!("'{}' is not a configured region", missing),
                });
            }
        }
        Ok(())
    }

    fn region_name(&self, label: u32, lookup: &HashMap<u32, &str>) -> Option<String> {
        if Some(label) == self.background_label {
            return None;
        }
        if self.regions.is_empty() {
            return Some(label.to_string());
        }
        lookup.get(&label).map(|name| name.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegionStats {
    pub mean_jacobian: f64,
    pub voxel_count: usize,
}

pub type RoiResult = RegionMap<RegionStats>;

/// Mean Jacobian determinant per region.
///
/// Regions are ordered by the first voxel (x-fastest) carrying one of their
/// labels; regions without voxels are left out.
pub fn aggregate_rois(
    jacobian: &JacobianMap,
    labels: &LabelVolume,
    config: &RoiConfig,
) -> Result<RoiResult, PipelineError> {
    if jacobian.grid != labels.grid || jacobian.values.len() != labels.labels.len() {
        return Err(PipelineError::InvalidInput(format!(
            "label grid {:?} does not match Jacobian grid {:?}",
            labels.grid.dims, jacobian.grid.dims
        )));
    }

    let lookup: HashMap<u32, &str> = config
        .regions
        .iter()
        .flat_map(|r| r.labels.iter().map(move |l| (*l, r.name.as_str())))
        .collect();

    // label -> region slot, slots numbered by first appearance
    let mut cache: HashMap<u32, Option<usize>> = HashMap::new();
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut names: Vec<String> = Vec::new();
    let assignment: Vec<Option<usize>> = labels
        .labels
        .iter()
        .map(|&label| {
            *cache.entry(label).or_insert_with(|| {
                let name = config.region_name(label, &lookup)?;
                let next = names.len();
                let slot = *slots.entry(name.clone()).or_insert(next);
                if slot == next {
                    names.push(name);
                }
                Some(slot)
            })
        })
        .collect();

    // per-chunk partial sums, merged in chunk order so the result does not
    // depend on thread scheduling
    let partials: Vec<Vec<(f64, usize)>> = assignment
        .par_chunks(SUM_CHUNK)
        .zip(jacobian.values.par_chunks(SUM_CHUNK))
        .map(|(slots, values)| {
            let mut acc = vec![(0.0, 0usize); names.len()];
            for (slot, v) in slots.iter().zip(values) {
                if let Some(slot) = slot {
                    acc[*slot].0 += v;
                    acc[*slot].1 += 1;
                }
            }
            acc
        })
        .collect();
    let mut totals = vec![(0.0, 0usize); names.len()];
    for part in &partials {
        for (total, (sum, count)) in totals.iter_mut().zip(part) {
            total.0 += sum;
            total.1 += count;
        }
    }
    let stats = totals.into_iter().map(|(sum, count)| RegionStats {
        mean_jacobian: sum / count as f64,
        voxel_count: count,
    });

    let result: RoiResult = names.into_iter().zip(stats).collect();
    for (name, stats) in result.iter() {
        debug!(
            region = name,
            mean_jacobian = stats.mean_jacobian,
            voxels = stats.voxel_count,
            "region aggregated"
        );
    }

    if let Some(missing) = config.required_regions.iter().find(|r| !result.contains(r)) {
        return Err(PipelineError::MissingRegion(missing.clone()));
    }
    Ok(result)
}
