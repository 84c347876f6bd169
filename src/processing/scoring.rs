use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use super::zscore::{DeltaUnit, RegionZScore, ZScoreResult};
use crate::error::ConfigError;

/// Allowed deviation of the weight sum from `weight_total`.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Sign applied to a region's z-score before weighting. `Negative` makes a
/// falling value (tissue loss) raise the composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    #[default]
    Positive,
    Negative,
}

impl Polarity {
    pub fn sign(self) -> f64 {
        match self {
            Polarity::Positive => 1.0,
            Polarity::Negative => -1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionWeight {
    pub region: String,
    pub weight: f64,
    #[serde(default)]
    pub polarity: Polarity,
}

/// Which value is compared with the cutoffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeScale {
    /// Composite divided by `sqrt(sum w^2)` over the contributing regions.
    #[default]
    Standardized,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDirection {
    Below,
    Above,
}

/// Region value a rule compares against its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMetric {
    #[default]
    Zscore,
    /// The raw delta, in whatever unit the run normalized to.
    Delta,
}

impl RuleMetric {
    fn read(self, z: &RegionZScore) -> f64 {
        match self {
            RuleMetric::Zscore => z.zscore,
            RuleMetric::Delta => z.delta,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            RuleMetric::Zscore => "z",
            RuleMetric::Delta => "delta",
        }
    }
}

/// Emits a rationale line when a region's metric is strictly beyond
/// `threshold`. A rule with a `unit` only applies to runs in that unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RationaleRule {
    pub region: String,
    pub direction: RuleDirection,
    #[serde(default)]
    pub metric: RuleMetric,
    #[serde(alias = "zscore")]
    pub threshold: f64,
    #[serde(default)]
    pub unit: Option<DeltaUnit>,
    #[serde(default)]
    pub label: Option<String>,
}

impl RationaleRule {
    fn applies_to(&self, unit: DeltaUnit) -> bool {
        self.unit.is_none_or(|u| u == unit)
    }

    fn fires(&self, value: f64) -> bool {
        match self.direction {
            RuleDirection::Below => value < self.threshold,
            RuleDirection::Above => value > self.threshold,
        }
    }

    fn describe(&self, value: f64) -> String {
        let op = match self.direction {
            RuleDirection::Below => "<",
            RuleDirection::Above => ">",
        };
        let subject = self.label.as_deref().unwrap_or(&self.region);
        format!(
            "{}: {} = {:.2} {} {:.1}",
            subject,
            self.metric.symbol(),
            value,
            op,
            self.threshold
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoringConfig {
    pub weights: Vec<RegionWeight>,
    pub weight_total: f64,
    /// `[slow, fast]`
    pub cutoffs: [f64; 2],
    pub composite_scale: CompositeScale,
    pub rules: Vec<RationaleRule>,
}

fn weight(region: &str, weight: f64, polarity: Polarity) -> RegionWeight {
    RegionWeight {
        region: region.to_string(),
        weight,
        polarity,
    }
}

fn rule(region: &str, direction: RuleDirection, threshold: f64, label: &str) -> RationaleRule {
    RationaleRule {
        region: region.to_string(),
        direction,
        metric: RuleMetric::Zscore,
        threshold,
        unit: None,
        label: Some(label.to_string()),
    }
}

impl Default for ScoringConfig {
    /// Five-region Alzheimer's atrophy pattern: medial temporal and parietal
    /// loss plus ventricular expansion.
    fn default() -> Self {
        use Polarity::*;
        use RuleDirection::*;
        Self {
            weights: vec![
                weight("hippocampus", 0.30, Negative),
                weight("entorhinal_cortex", 0.20, Negative),
                weight("temporal_lobe", 0.20, Negative),
                weight("parietal_lobe", 0.15, Negative),
                weight("ventricles", 0.15, Positive),
            ],
            weight_total: 1.0,
            cutoffs: [1.0, 2.5],
            composite_scale: CompositeScale::Standardized,
            rules: vec![
                rule("hippocampus", Below, -2.0, "Hippocampal atrophy"),
                rule("entorhinal_cortex", Below, -1.5, "Entorhinal atrophy"),
                rule("temporal_lobe", Below, -1.5, "Temporal lobe atrophy"),
                rule("parietal_lobe", Below, -1.5, "Parietal lobe atrophy"),
                rule("ventricles", Above, 2.0, "Ventricular expansion"),
                RationaleRule {
                    metric: RuleMetric::Delta,
                    unit: Some(DeltaUnit::PercentPerYear),
                    ..rule("hippocampus", Below, -3.5, "Hippocampal annual atrophy")
                },
            ],
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.weights.is_empty() {
            return Err(ConfigError::EmptyWeights);
        }
        if !(self.weight_total.is_finite() && self.weight_total > 0.0) {
            return Err(ConfigError::InvalidSetting {
                name: "scoring.weight_total",
                reason: format!("{} is not positive", self.weight_total),
            });
        }
        let mut seen = HashSet::new();
        for w in &self.weights {
            if !(w.weight.is_finite() && w.weight >= 0.0) {
                return Err(ConfigError::InvalidWeight {
                    region: w.region.clone(),
                    weight: w.weight,
                });
            }
            if !seen.insert(w.region.as_str()) {
                return Err(ConfigError::InvalidSetting {
                    name: "scoring.weights",
                    reason: format!("region '{}' is weighted twice", w.region),
                });
            }
        }
        let actual: f64 = self.weights.iter().map(|w| w.weight).sum();
        if (actual - self.weight_total).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::WeightSum {
                expected: self.weight_total,
                actual,
            });
        }
        let [slow, fast] = self.cutoffs;
        if !(slow.is_finite() && fast.is_finite() && slow <= fast) {
            return Err(ConfigError::InvalidCutoffs { slow, fast });
        }
        if let Some(bad) = self.rules.iter().find(|r| !r.threshold.is_finite()) {
            return Err(ConfigError::InvalidSetting {
                name: "scoring.rules",
                reason: format!("rule for '{}' has threshold {}", bad.region, bad.threshold),
            });
        }
        Ok(())
    }

    fn weight_for(&self, region: &str) -> Option<&RegionWeight> {
        self.weights.iter().find(|w| w.region == region)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressionCategory {
    Stable,
    SlowProgressor,
    FastProgressor,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContributingRegion {
    pub region: String,
    pub weight: f64,
    pub polarity: Polarity,
    pub zscore: f64,
    /// `weight * sign * zscore`
    pub contribution: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressionScore {
    pub composite_score: f64,
    pub standardized_score: f64,
    pub category: ProgressionCategory,
    /// Largest absolute contribution first.
    pub contributing_regions: Vec<ContributingRegion>,
    pub rationale: Vec<String>,
}

/// Ties at a cutoff take the more severe category.
pub fn classify(value: f64, cutoffs: [f64; 2]) -> ProgressionCategory {
    let [slow, fast] = cutoffs;
    if value >= fast {
        ProgressionCategory::FastProgressor
    } else if value >= slow {
        ProgressionCategory::SlowProgressor
    } else {
        ProgressionCategory::Stable
    }
}

pub fn score_progression(zscores: &ZScoreResult, config: &ScoringConfig) -> ProgressionScore {
    let mut contributing: Vec<ContributingRegion> = zscores
        .regions
        .iter()
        .filter_map(|(region, z)| {
            let w = config.weight_for(region)?;
            Some(ContributingRegion {
                region: region.to_string(),
                weight: w.weight,
                polarity: w.polarity,
                zscore: z.zscore,
                contribution: w.weight * w.polarity.sign() * z.zscore,
            })
        })
        .collect();

    let composite_score: f64 = contributing.iter().map(|c| c.contribution).sum();
    let norm = contributing.iter().map(|c| c.weight * c.weight).sum::<f64>().sqrt();
    let standardized_score = if norm > 0.0 { composite_score / norm } else { 0.0 };

    let compared = match config.composite_scale {
        CompositeScale::Standardized => standardized_score,
        CompositeScale::Raw => composite_score,
    };
    let category = classify(compared, config.cutoffs);

    // stable sort keeps region order among equal contributions
    contributing.sort_by(|a, b| b.contribution.abs().total_cmp(&a.contribution.abs()));

    let rationale = config
        .rules
        .iter()
        .filter(|rule| rule.applies_to(zscores.unit))
        .filter_map(|rule| {
            let value = rule.metric.read(zscores.regions.get(&rule.region)?);
            rule.fires(value).then(|| rule.describe(value))
        })
        .collect();

    debug!(
        composite = composite_score,
        standardized = standardized_score,
        category = ?category,
        "progression scored"
    );
    ProgressionScore {
        composite_score,
        standardized_score,
        category,
        contributing_regions: contributing,
        rationale,
    }
}
