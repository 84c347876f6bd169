use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use super::scoring::{ProgressionCategory, ProgressionScore};
use super::zscore::ZScoreResult;
use crate::error::{ConfigError, PipelineError};
use crate::io::SubjectInput;
use crate::registration::{BackendId, QualityMetrics, RegistrationAttempt};
use crate::texture::{FOLLOWUP_SLICE_FILE, HEATMAP_FILE};

pub const EXPLANATION_CONTRACT_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExplanationConfig {
    /// Number of contributing regions carried in the payload.
    pub top_n: usize,
}

impl Default for ExplanationConfig {
    fn default() -> Self {
        Self { top_n: 5 }
    }
}

impl ExplanationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.top_n == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "explanation.top_n",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectMetadata {
    pub subject_id: String,
    pub age: Option<u32>,
    pub sex: Option<String>,
    pub interval_days: Option<f64>,
    pub interval_years: Option<f64>,
    pub age_bin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressionSummary {
    pub composite_score: f64,
    pub standardized_score: f64,
    pub category: ProgressionCategory,
    pub rationale: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionEvidence {
    pub region: String,
    pub weight: f64,
    pub zscore: f64,
    pub delta: f64,
    pub contribution: f64,
    pub zero_variance: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrationEvidence {
    pub backend_id: BackendId,
    pub attempt_index: usize,
    pub attempts_made: usize,
    pub metrics: QualityMetrics,
}

/// Rendered images the reasoning collaborator reads next to the payload,
/// as file names relative to the payload's directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextImages {
    pub jacobian_overlay: String,
    pub t1_followup_slice: String,
}

impl Default for ContextImages {
    fn default() -> Self {
        Self {
            jacobian_overlay: HEATMAP_FILE.to_string(),
            t1_followup_slice: FOLLOWUP_SLICE_FILE.to_string(),
        }
    }
}

/// Versioned, fixed-shape record handed to the reasoning collaborator.
/// Holds copies of upstream numbers only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplanationPayload {
    pub contract_version: String,
    pub subject: SubjectMetadata,
    pub progression: ProgressionSummary,
    pub top_regions: Vec<RegionEvidence>,
    pub unscored_regions: Vec<String>,
    pub zero_variance_regions: Vec<String>,
    pub registration: RegistrationEvidence,
    pub context_images: ContextImages,
}

pub fn build_payload(
    subject: &SubjectInput,
    zscores: &ZScoreResult,
    score: &ProgressionScore,
    accepted: &RegistrationAttempt,
    attempts_made: usize,
    config: &ExplanationConfig,
) -> Result<ExplanationPayload, PipelineError> {
    let metrics = accepted.metrics.ok_or_else(|| {
        PipelineError::Payload(format!(
            "accepted attempt {} carries no quality metrics",
            accepted.attempt_index
        ))
    })?;

    let top_regions = score
        .contributing_regions
        .iter()
        .take(config.top_n)
        .map(|c| {
            let z = zscores.regions.get(&c.region).ok_or_else(|| {
                PipelineError::Payload(format!("region '{}' has no z-score", c.region))
            })?;
            Ok(RegionEvidence {
                region: c.region.clone(),
                weight: c.weight,
                zscore: z.zscore,
                delta: z.delta,
                contribution: c.contribution,
                zero_variance: z.zero_variance,
            })
        })
        .collect::<Result<Vec<_>, PipelineError>>()?;

    let payload = ExplanationPayload {
        contract_version: EXPLANATION_CONTRACT_VERSION.to_string(),
        subject: SubjectMetadata {
            subject_id: subject.subject_id.clone(),
            age: subject.age,
            sex: subject.sex.clone(),
            interval_days: subject.interval_days,
            interval_years: zscores.interval_years,
            age_bin: zscores.age_bin.clone(),
        },
        progression: ProgressionSummary {
            composite_score: score.composite_score,
            standardized_score: score.standardized_score,
            category: score.category,
            rationale: score.rationale.clone(),
        },
        top_regions,
        unscored_regions: zscores.unscored.clone(),
        zero_variance_regions: zscores.zero_variance_regions(),
        registration: RegistrationEvidence {
            backend_id: accepted.backend_id,
            attempt_index: accepted.attempt_index,
            attempts_made,
            metrics,
        },
        context_images: ContextImages::default(),
    };
    payload.validate(zscores)?;
    debug!(regions = payload.top_regions.len(), "explanation payload built");
    Ok(payload)
}

fn finite(name: &str, value: f64) -> Result<(), PipelineError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(PipelineError::Payload(format!("{} is not finite ({})", name, value)))
    }
}

impl ExplanationPayload {
    /// Checks the contract: finite numbers, and every region value equal to
    /// the z-score record it was copied from.
    pub fn validate(&self, zscores: &ZScoreResult) -> Result<(), PipelineError> {
        if self.contract_version != EXPLANATION_CONTRACT_VERSION {
            return Err(PipelineError::Payload(format!(
                "contract version '{}' is not '{}'",
                self.contract_version, EXPLANATION_CONTRACT_VERSION
            )));
        }
        finite("composite_score", self.progression.composite_score)?;
        finite("standardized_score", self.progression.standardized_score)?;

        let m = &self.registration.metrics;
        for (name, value) in [
            ("max_displacement", m.max_displacement),
            ("mean_displacement", m.mean_displacement),
            ("ncc_similarity", m.ncc_similarity),
            ("smoothness", m.smoothness),
            ("negative_jacobian_fraction", m.negative_jacobian_fraction),
        ] {
            finite(name, value)?;
        }

        for region in &self.top_regions {
            finite(&format!("{}.weight", region.region), region.weight)?;
            finite(&format!("{}.zscore", region.region), region.zscore)?;
            finite(&format!("{}.delta", region.region), region.delta)?;
            let source = zscores.regions.get(&region.region).ok_or_else(|| {
                PipelineError::Payload(format!("region '{}' is not in the z-score record", region.region))
            })?;
            if source.zscore != region.zscore
                || source.delta != region.delta
                || source.zero_variance != region.zero_variance
            {
                return Err(PipelineError::Payload(format!(
                    "values for region '{}' differ from the z-score record",
                    region.region
                )));
            }
        }
        for (name, file) in [
            ("jacobian_overlay", &self.context_images.jacobian_overlay),
            ("t1_followup_slice", &self.context_images.t1_followup_slice),
        ] {
            let plain = Path::new(file)
                .file_name()
                .is_some_and(|f| f == file.as_str());
            if file.is_empty() || !plain {
                return Err(PipelineError::Payload(format!(
                    "context image '{}' must be a file name next to the payload, got '{}'",
                    name, file
                )));
            }
        }
        if let Some(region) = self.unscored_regions.iter().find(|r| !zscores.unscored.contains(r)) {
            return Err(PipelineError::Payload(format!(
                "region '{}' is listed unscored but was scored",
                region
            )));
        }
        Ok(())
    }
}
