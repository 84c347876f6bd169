use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::processing::explanation::ExplanationConfig;
use crate::processing::roi::RoiConfig;
use crate::processing::scoring::ScoringConfig;
use crate::processing::zscore::NormalizationConfig;
use crate::registration::{BackendId, ClassicalParams, GateThresholds};

/// Everything a run needs besides the subject's data and the reference
/// distribution. Read from TOML once per session; every section is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub backend_priority: Vec<BackendId>,
    /// Per-attempt wall clock limit. Unlimited when absent.
    pub attempt_timeout_secs: Option<f64>,
    pub accelerator_slots: usize,
    pub gate: GateThresholds,
    pub classical: ClassicalParams,
    pub roi: RoiConfig,
    pub normalization: NormalizationConfig,
    pub scoring: ScoringConfig,
    pub explanation: ExplanationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backend_priority: vec![BackendId::Learned, BackendId::Classical],
            attempt_timeout_secs: None,
            accelerator_slots: 1,
            gate: GateThresholds::default(),
            classical: ClassicalParams::default(),
            roi: RoiConfig::default(),
            normalization: NormalizationConfig::default(),
            scoring: ScoringConfig::default(),
            explanation: ExplanationConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend_priority.is_empty() {
            return Err(ConfigError::EmptyBackendPriority);
        }
        let mut seen = HashSet::new();
        for id in &self.backend_priority {
            if !seen.insert(*id) {
                return Err(ConfigError::DuplicateBackend(*id));
            }
        }
        if let Some(secs) = self.attempt_timeout_secs {
            if !(secs.is_finite() && secs > 0.0) || Duration::try_from_secs_f64(secs).is_err() {
                return Err(ConfigError::InvalidSetting {
                    name: "attempt_timeout_secs",
                    reason: format!("{} is not a positive number of seconds", secs),
                });
            }
        }
        if self.accelerator_slots == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "accelerator_slots",
                reason: "must be at least 1".into(),
            });
        }
        self.gate.validate()?;
        self.classical.validate()?;
        self.roi.validate()?;
        self.normalization.validate()?;
        self.scoring.validate()?;
        self.explanation.validate()?;
        Ok(())
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}
