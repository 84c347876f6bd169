use thiserror::Error;

use crate::registration::BackendId;

/// A single backend attempt could not produce a usable field.
/// Always recovered by the fallback controller.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("backend '{0}' is not available")]
    Unavailable(BackendId),
    #[error("field prediction failed: {0}")]
    PredictionFailed(String),
    #[error("predicted displacement leaves the image grid at voxel {voxel}")]
    OutOfGrid { voxel: usize },
    #[error("backend '{backend}' did not finish within {timeout_ms} ms")]
    Timeout { backend: BackendId, timeout_ms: u64 },
    #[error("backend '{backend}' worker failed: {reason}")]
    Worker { backend: BackendId, reason: String },
}

/// Problems with the configuration bundle. Fatal at context load, never per run.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("region weights sum to {actual}, expected {expected}")]
    WeightSum { expected: f64, actual: f64 },
    #[error("weight for region '{region}' is invalid: {weight}")]
    InvalidWeight { region: String, weight: f64 },
    #[error("region weight table is empty")]
    EmptyWeights,
    #[error("classification cutoffs must be finite with slow <= fast, got [{slow}, {fast}]")]
    InvalidCutoffs { slow: f64, fast: f64 },
    #[error("quality gate threshold '{name}' is invalid: {value}")]
    InvalidThreshold { name: &'static str, value: f64 },
    #[error("backend priority is empty")]
    EmptyBackendPriority,
    #[error("backend '{0}' appears more than once in the priority order")]
    DuplicateBackend(BackendId),
    #[error("label {label} is assigned to both '{first}' and '{second}'")]
    OverlappingLabel {
        label: u32,
        first: String,
        second: String,
    },
    #[error("reference distribution for '{region}' is invalid: {reason}")]
    InvalidReference { region: String, reason: String },
    #[error("reference distribution has no usable entries")]
    EmptyReference,
    #[error("invalid setting '{name}': {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}

/// Failures that end a pipeline run in the Failed state.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error("no acceptable registration after {attempts} attempt(s)")]
    Exhausted { attempts: usize },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("required region '{0}' has no voxels in the label volume")]
    MissingRegion(String),
    #[error("scan interval of {days:.1} days is below the minimum of {minimum:.1} days")]
    InvalidInterval { days: f64, minimum: f64 },
    #[error("explanation payload rejected: {0}")]
    Payload(String),
}
