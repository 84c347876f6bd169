use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

use super::roi::RoiResult;
use super::RegionMap;
use crate::error::{ConfigError, PipelineError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceStats {
    pub mean: f64,
    #[serde(alias = "standard_deviation")]
    pub std: f64,
}

/// Half-open age interval `[low, high)` with its own reference table.
#[derive(Debug, Clone, PartialEq)]
pub struct AgeBin {
    pub label: String,
    pub low: u32,
    pub high: u32,
    pub regions: HashMap<String, ReferenceStats>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ReferenceFile {
    #[serde(default)]
    regions: HashMap<String, ReferenceStats>,
    #[serde(default)]
    age_bins: HashMap<String, HashMap<String, ReferenceStats>>,
}

/// Population reference of region deltas, optionally stratified by age.
/// Loaded once and shared read-only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceDistribution {
    pub regions: HashMap<String, ReferenceStats>,
    /// Sorted by lower bound.
    pub age_bins: Vec<AgeBin>,
}

fn parse_bin_key(key: &str) -> Option<(u32, u32)> {
    let (low, high) = key.split_once('-')?;
    let low = low.trim().parse().ok()?;
    let high = high.trim().parse().ok()?;
    (low < high).then_some((low, high))
}

fn check_table(table: &HashMap<String, ReferenceStats>, scope: &str) -> Result<(), ConfigError> {
    for (region, stats) in table {
        if !stats.mean.is_finite() {
            return Err(ConfigError::InvalidReference {
                region: format!("{}{}", scope, region),
                reason: format!("mean {} is not finite", stats.mean),
            });
        }
        if !(stats.std.is_finite() && stats.std >= 0.0) {
            return Err(ConfigError::InvalidReference {
                region: format!("{}{}", scope, region),
                reason: format!("standard deviation {} is not a non-negative number", stats.std),
            });
        }
    }
    Ok(())
}

impl ReferenceDistribution {
    pub fn flat(regions: HashMap<String, ReferenceStats>) -> Self {
        Self {
            regions,
            age_bins: Vec::new(),
        }
    }

    /// Parses `{"regions": {...}}` and/or `{"age_bins": {"60-70": {...}}}`.
    /// Bin keys that are not `low-high` are skipped.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let file: ReferenceFile =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(format!("reference: {}", e)))?;

        let mut age_bins = Vec::new();
        for (label, regions) in file.age_bins {
            match parse_bin_key(&label) {
                Some((low, high)) => age_bins.push(AgeBin {
                    label,
                    low,
                    high,
                    regions,
                }),
                None => warn!(bin = %label, "skipping malformed age bin key"),
            }
        }
        age_bins.sort_by_key(|b| b.low);

        let reference = Self {
            regions: file.regions,
            age_bins,
        };
        reference.validate()?;
        Ok(reference)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let usable = !self.regions.is_empty() || self.age_bins.iter().any(|b| !b.regions.is_empty());
        if !usable {
            return Err(ConfigError::EmptyReference);
        }
        check_table(&self.regions, "")?;
        for bin in &self.age_bins {
            check_table(&bin.regions, &format!("{}/", bin.label))?;
        }
        Ok(())
    }

    /// Reference table for a subject, with the bin label when one was used.
    ///
    /// Ages outside every bin clamp to the nearest end bin. Without an age the
    /// flat table is used.
    pub fn select(
        &self,
        age: Option<u32>,
    ) -> Result<(Option<&str>, &HashMap<String, ReferenceStats>), PipelineError> {
        match (age, self.age_bins.first(), self.age_bins.last()) {
            (Some(age), Some(first), Some(last)) => {
                let bin = self
                    .age_bins
                    .iter()
                    .find(|b| b.low <= age && age < b.high)
                    .unwrap_or(if age < first.low { first } else { last });
                Ok((Some(bin.label.as_str()), &bin.regions))
            }
            _ if !self.regions.is_empty() => Ok((None, &self.regions)),
            _ => Err(PipelineError::InvalidInput(
                "subject age is required by the age-binned reference".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaUnit {
    /// `mean_jacobian - 1`
    #[default]
    Fraction,
    /// `(mean_jacobian - 1) * 100`
    Percent,
    /// Percent change divided by the scan interval in years.
    PercentPerYear,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizationConfig {
    pub unit: DeltaUnit,
    pub min_interval_days: f64,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            unit: DeltaUnit::Fraction,
            min_interval_days: 30.0,
        }
    }
}

impl NormalizationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.min_interval_days.is_finite() && self.min_interval_days > 0.0) {
            return Err(ConfigError::InvalidSetting {
                name: "normalization.min_interval_days",
                reason: format!("{} is not positive", self.min_interval_days),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegionZScore {
    pub delta: f64,
    pub zscore: f64,
    pub reference_mean: f64,
    pub reference_std: f64,
    /// The reference spread was zero, so `zscore` is pinned to 0.
    pub zero_variance: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZScoreResult {
    pub regions: RegionMap<RegionZScore>,
    /// Regions with a delta but no reference entry.
    pub unscored: Vec<String>,
    pub age_bin: Option<String>,
    pub unit: DeltaUnit,
    pub interval_years: Option<f64>,
}

impl ZScoreResult {
    pub fn zero_variance_regions(&self) -> Vec<String> {
        self.regions
            .iter()
            .filter(|(_, z)| z.zero_variance)
            .map(|(name, _)| name.to_string())
            .collect()
    }
}

pub fn normalize(
    roi: &RoiResult,
    reference: &ReferenceDistribution,
    config: &NormalizationConfig,
    age: Option<u32>,
    interval_days: Option<f64>,
) -> Result<ZScoreResult, PipelineError> {
    let interval_years = interval_days
        .filter(|days| days.is_finite() && *days > 0.0)
        .map(|days| days / 365.25);
    let scale = match config.unit {
        DeltaUnit::Fraction => 1.0,
        DeltaUnit::Percent => 100.0,
        DeltaUnit::PercentPerYear => {
            let days = interval_days.ok_or_else(|| {
                PipelineError::InvalidInput("interval_days is required for annualized deltas".into())
            })?;
            if !(days >= config.min_interval_days) {
                return Err(PipelineError::InvalidInterval {
                    days,
                    minimum: config.min_interval_days,
                });
            }
            100.0 * 365.25 / days
        }
    };

    let (age_bin, table) = reference.select(age)?;
    let mut regions = RegionMap::new();
    let mut unscored = Vec::new();

    for (name, stats) in roi.iter() {
        let delta = (stats.mean_jacobian - 1.0) * scale;

        let Some(reference) = table.get(name) else {
            debug!(region = name, "no reference entry, region left unscored");
            unscored.push(name.to_string());
            continue;
        };

        let zero_variance = !(reference.std > 0.0);
        let zscore = if zero_variance {
            warn!(region = name, "reference standard deviation is zero, z-score set to 0");
            0.0
        } else {
            (delta - reference.mean) / reference.std
        };
        regions.insert(
            name,
            RegionZScore {
                delta,
                zscore,
                reference_mean: reference.mean,
                reference_std: reference.std,
                zero_variance,
            },
        );
    }

    Ok(ZScoreResult {
        regions,
        unscored,
        age_bin: age_bin.map(str::to_string),
        unit: config.unit,
        interval_years,
    })
}

#[cfg(test)]
mod zscore_tests {
    use super::*;
    use crate::processing::roi::RegionStats;
    use approx::assert_relative_eq;

    fn roi(entries: &[(&str, f64)]) -> RoiResult {
        entries
            .iter()
            .map(|(name, mean)| {
                (
                    name.to_string(),
                    RegionStats {
                        mean_jacobian: *mean,
                        voxel_count: 10,
                    },
                )
            })
            .collect()
    }

    fn reference(entries: &[(&str, f64, f64)]) -> ReferenceDistribution {
        ReferenceDistribution::flat(
            entries
                .iter()
                .map(|(n, mean, std)| (n.to_string(), ReferenceStats { mean: *mean, std: *std }))
                .collect(),
        )
    }

    #[test]
    fn test_fraction_zscore() {
        let result = normalize(
            &roi(&[("hippocampus", 0.97)]),
            &reference(&[("hippocampus", -0.01, 0.01)]),
            &NormalizationConfig::default(),
            None,
            None,
        )
        .unwrap();
        let z = result.regions.get("hippocampus").unwrap();
        assert_relative_eq!(z.delta, -0.03, epsilon = 1e-12);
        assert_relative_eq!(z.zscore, -2.0, epsilon = 1e-9);
        assert!(!z.zero_variance);
    }

    #[test]
    fn test_zero_variance_flagged() {
        let result = normalize(
            &roi(&[("ventricles", 1.05)]),
            &reference(&[("ventricles", 0.01, 0.0)]),
            &NormalizationConfig::default(),
            None,
            None,
        )
        .unwrap();
        let z = result.regions.get("ventricles").unwrap();
        assert_eq!(z.zscore, 0.0);
        assert!(z.zero_variance);
        assert_eq!(result.zero_variance_regions(), vec!["ventricles".to_string()]);
    }

    #[test]
    fn test_missing_reference_listed_unscored() {
        let result = normalize(
            &roi(&[("hippocampus", 0.99), ("amygdala", 0.98)]),
            &reference(&[("hippocampus", 0.0, 0.01)]),
            &NormalizationConfig::default(),
            None,
            None,
        )
        .unwrap();
        assert_eq!(result.regions.len(), 1);
        assert_eq!(result.unscored, vec!["amygdala".to_string()]);
    }

    #[test]
    fn test_percent_per_year() {
        let config = NormalizationConfig {
            unit: DeltaUnit::PercentPerYear,
            ..NormalizationConfig::default()
        };
        let result = normalize(
            &roi(&[("hippocampus", 0.98)]),
            &reference(&[("hippocampus", -1.0, 1.0)]),
            &config,
            None,
            Some(730.5),
        )
        .unwrap();
        let z = result.regions.get("hippocampus").unwrap();
        assert_relative_eq!(z.delta, -1.0, epsilon = 1e-9);
        assert_relative_eq!(z.zscore, 0.0, epsilon = 1e-9);
        assert_relative_eq!(result.interval_years.unwrap(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_short_interval_rejected() {
        let config = NormalizationConfig {
            unit: DeltaUnit::PercentPerYear,
            ..NormalizationConfig::default()
        };
        let rois = roi(&[("hippocampus", 0.98)]);
        let refs = reference(&[("hippocampus", -1.0, 1.0)]);
        assert_eq!(
            normalize(&rois, &refs, &config, None, Some(10.0)),
            Err(PipelineError::InvalidInterval {
                days: 10.0,
                minimum: 30.0
            })
        );
        assert!(matches!(
            normalize(&rois, &refs, &config, None, None),
            Err(PipelineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_age_bins_select_and_clamp() {
        let json = r#"{
            "age_bins": {
                "60-70": {"hippocampus": {"mean": -1.0, "std": 0.5}},
                "70-80": {"hippocampus": {"mean": -2.0, "standard_deviation": 0.5}},
                "old": {"hippocampus": {"mean": 0.0, "std": 1.0}}
            }
        }"#;
        let reference = ReferenceDistribution::from_json_str(json).unwrap();
        assert_eq!(reference.age_bins.len(), 2);

        let label = |age| reference.select(Some(age)).unwrap().0.unwrap().to_string();
        assert_eq!(label(65), "60-70");
        assert_eq!(label(70), "70-80");
        assert_eq!(label(40), "60-70");
        assert_eq!(label(95), "70-80");
        assert!(reference.select(None).is_err());
    }

    #[test]
    fn test_invalid_reference_rejected() {
        assert!(matches!(
            ReferenceDistribution::from_json_str(r#"{"regions": {"a": {"mean": 0.0, "std": -1.0}}}"#),
            Err(ConfigError::InvalidReference { .. })
        ));
        assert!(matches!(
            ReferenceDistribution::from_json_str(r#"{"regions": {}}"#),
            Err(ConfigError::EmptyReference)
        ));
        assert!(matches!(
            ReferenceDistribution::from_json_str("not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
