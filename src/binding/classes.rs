use pyo3::prelude::*;
use std::sync::Arc;

use crate::pipeline::{PipelineContext, PipelineRun};
use crate::registration::RegistrationAttempt;

/// Loaded configuration, reference distribution and backends.
///
/// Create once with ``load_context`` and reuse it for every subject.
#[pyclass(frozen)]
#[derive(Clone)]
pub struct PyPipelineContext {
    pub inner: Arc<PipelineContext>,
}

#[pymethods]
impl PyPipelineContext {
    /// Backend identifiers in priority order.
    #[getter]
    fn backends(&self) -> Vec<String> {
        self.inner.backends().iter().map(|b| b.id().to_string()).collect()
    }

    #[getter]
    fn accelerator_slots(&self) -> usize {
        self.inner.config.accelerator_slots
    }

    fn __repr__(&self) -> String {
        format!(
            "PipelineContext(backends=[{}], accelerator_slots={})",
            self.backends().join(", "),
            self.accelerator_slots()
        )
    }
}

/// One registration attempt and its quality-gate verdict.
///
/// Attributes:
///     attempt_index (int): Position in the attempt sequence
///     backend_id (str): "learned" or "classical"
///     accepted (bool): Gate verdict
///     ncc_similarity (float | None): Similarity after warping, None when the backend failed
///     rejection_reasons (list[str]): Failed gate checks or the backend error
#[pyclass]
#[derive(Debug, Clone)]
pub struct PyAttempt {
    #[pyo3(get)]
    pub attempt_index: usize,
    #[pyo3(get)]
    pub backend_id: String,
    #[pyo3(get)]
    pub accepted: bool,
    #[pyo3(get)]
    pub max_displacement: Option<f64>,
    #[pyo3(get)]
    pub mean_displacement: Option<f64>,
    #[pyo3(get)]
    pub ncc_similarity: Option<f64>,
    #[pyo3(get)]
    pub smoothness: Option<f64>,
    #[pyo3(get)]
    pub negative_jacobian_fraction: Option<f64>,
    #[pyo3(get)]
    pub rejection_reasons: Vec<String>,
    #[pyo3(get)]
    pub backend_error: Option<String>,
    #[pyo3(get)]
    pub elapsed_ms: u64,
}

#[pymethods]
impl PyAttempt {
    fn __repr__(&self) -> String {
        format!(
            "Attempt(index={}, backend={}, accepted={}, ncc={})",
            self.attempt_index,
            self.backend_id,
            self.accepted,
            self.ncc_similarity
                .map(|v| format!("{:.3}", v))
                .unwrap_or_else(|| "None".into())
        )
    }
}

impl From<&RegistrationAttempt> for PyAttempt {
    fn from(a: &RegistrationAttempt) -> Self {
        let m = a.metrics.as_ref();
        Self {
            attempt_index: a.attempt_index,
            backend_id: a.backend_id.to_string(),
            accepted: a.accepted,
            max_displacement: m.map(|m| m.max_displacement),
            mean_displacement: m.map(|m| m.mean_displacement),
            ncc_similarity: m.map(|m| m.ncc_similarity),
            smoothness: m.map(|m| m.smoothness),
            negative_jacobian_fraction: m.map(|m| m.negative_jacobian_fraction),
            rejection_reasons: a.rejection_reasons.clone(),
            backend_error: a.backend_error.clone(),
            elapsed_ms: a.elapsed_ms,
        }
    }
}

/// Result of one subject's run.
///
/// Attributes:
///     status (str): "COMPLETE" or "FAILED"
///     failure (str | None): Why the run failed
///     attempts (list[PyAttempt]): Full registration audit trail
///     dims (tuple[int, int, int]): Grid dimensions
///     jacobian (list[float] | None): Jacobian determinants, x-fastest
///     roi_means (list[tuple[str, float]]): Mean Jacobian per region
///     zscores (list[tuple[str, float]]): Region z-scores
///     category (str | None): Progression category
///     explanation_json (str | None): Explanation payload as JSON
#[pyclass]
#[derive(Debug, Clone)]
pub struct PyPipelineRun {
    #[pyo3(get)]
    pub subject_id: String,
    #[pyo3(get)]
    pub status: String,
    #[pyo3(get)]
    pub failure: Option<String>,
    #[pyo3(get)]
    pub attempts: Vec<PyAttempt>,
    #[pyo3(get)]
    pub dims: Option<(usize, usize, usize)>,
    #[pyo3(get)]
    pub jacobian: Option<Vec<f64>>,
    #[pyo3(get)]
    pub roi_means: Vec<(String, f64)>,
    #[pyo3(get)]
    pub zscores: Vec<(String, f64)>,
    #[pyo3(get)]
    pub category: Option<String>,
    #[pyo3(get)]
    pub composite_score: Option<f64>,
    #[pyo3(get)]
    pub rationale: Vec<String>,
    #[pyo3(get)]
    pub explanation_json: Option<String>,
    #[pyo3(get)]
    pub elapsed_ms: u64,
}

#[pymethods]
impl PyPipelineRun {
    fn __repr__(&self) -> String {
        format!(
            "PipelineRun(subject={}, status={}, attempts={}, category={})",
            self.subject_id,
            self.status,
            self.attempts.len(),
            self.category.as_deref().unwrap_or("None")
        )
    }

    /// Backend of the accepted attempt, if any.
    #[getter]
    fn accepted_backend(&self) -> Option<String> {
        self.attempts
            .last()
            .filter(|a| a.accepted)
            .map(|a| a.backend_id.clone())
    }
}

fn upper_name<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

impl From<&PipelineRun> for PyPipelineRun {
    fn from(run: &PipelineRun) -> Self {
        Self {
            subject_id: run.subject_id.clone(),
            status: upper_name(&run.status),
            failure: run.failure.as_ref().map(|e| e.to_string()),
            attempts: run.attempts.iter().map(PyAttempt::from).collect(),
            dims: run.jacobian.as_ref().map(|j| {
                let [x, y, z] = j.grid.dims;
                (x, y, z)
            }),
            jacobian: run.jacobian.as_ref().map(|j| j.values.clone()),
            roi_means: run
                .roi
                .iter()
                .flat_map(|roi| roi.iter().map(|(n, s)| (n.to_string(), s.mean_jacobian)))
                .collect(),
            zscores: run
                .zscores
                .iter()
                .flat_map(|z| z.regions.iter().map(|(n, r)| (n.to_string(), r.zscore)))
                .collect(),
            category: run.score.as_ref().map(|s| upper_name(&s.category)),
            composite_score: run.score.as_ref().map(|s| s.composite_score),
            rationale: run
                .score
                .as_ref()
                .map(|s| s.rationale.clone())
                .unwrap_or_default(),
            explanation_json: run
                .explanation
                .as_ref()
                .and_then(|p| serde_json::to_string(p).ok()),
            elapsed_ms: run.elapsed_ms,
        }
    }
}
