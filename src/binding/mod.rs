pub mod classes;

use anyhow::anyhow;
use nalgebra::Vector3;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::entry;
use crate::io::input::load_subject;
use crate::io::integrity_check::validate_subject_id;
use crate::io::output::write_run_outputs;
use crate::io::{SubjectInput, Volume};
use crate::pipeline::{run_subject_with_backends, PipelineRun};
use crate::registration::FieldPredictor;
use classes::{PyAttempt, PyPipelineContext, PyPipelineRun};

/// Field predictor backed by a Python callable
/// ``f(fixed, moving, dims) -> list[float]`` returning ``3 * n_voxels``
/// displacement components, x-fastest, (dx, dy, dz) per voxel.
struct PyFieldPredictor {
    callable: Py<PyAny>,
}

impl FieldPredictor for PyFieldPredictor {
    fn predict(&self, fixed: &Volume, moving: &Volume) -> anyhow::Result<Vec<Vector3<f64>>> {
        let [nx, ny, nz] = fixed.grid.dims;
        let flat: Vec<f64> = Python::with_gil(|py| -> PyResult<Vec<f64>> {
            self.callable
                .call1(py, (fixed.data.clone(), moving.data.clone(), (nx, ny, nz)))?
                .extract(py)
        })
        .map_err(|e| anyhow!("python predictor raised: {}", e))?;

        if flat.len() % 3 != 0 {
            return Err(anyhow!(
                "predictor returned {} components, not a multiple of 3",
                flat.len()
            ));
        }
        Ok(flat
            .chunks_exact(3)
            .map(|c| Vector3::new(c[0], c[1], c[2]))
            .collect())
    }
}

fn to_py_err(e: anyhow::Error) -> PyErr {
    PyRuntimeError::new_err(format!("{:#}", e))
}

fn run_with_optional_predictor(
    py: Python<'_>,
    context: &PyPipelineContext,
    input: &SubjectInput,
    predictor: Option<Py<PyAny>>,
) -> PipelineRun {
    let ctx = Arc::clone(&context.inner);
    let backends = match predictor {
        Some(callable) => ctx.backends_with_predictor(Arc::new(PyFieldPredictor { callable })),
        None => ctx.backends().to_vec(),
    };
    py.allow_threads(|| run_subject_with_backends(&ctx, input, &backends))
}

/// Loads the pipeline configuration (TOML) and reference distribution (JSON).
///
/// Arguments:
///
/// - ``config_path`` – pipeline TOML
/// - ``reference_path`` – reference distribution JSON
/// - ``predictor`` (default: None) – callable used by the learned backend;
///   without it only the classical backend runs
///
/// Example:
///
/// .. code-block:: python
///
///    import atrophyrs as ar
///    ctx = ar.load_context("config/pipeline.toml", "config/reference.json")
#[pyfunction]
#[pyo3(signature = (config_path, reference_path, predictor = None))]
pub fn load_context(
    config_path: &str,
    reference_path: &str,
    predictor: Option<Py<PyAny>>,
) -> PyResult<PyPipelineContext> {
    let predictor =
        predictor.map(|callable| Arc::new(PyFieldPredictor { callable }) as Arc<dyn FieldPredictor>);
    let inner = entry::load_context(Path::new(config_path), Path::new(reference_path), predictor)
        .map_err(to_py_err)?;
    Ok(PyPipelineContext { inner })
}

/// Runs one subject from flat, x-fastest arrays.
///
/// A per-call ``predictor`` replaces the context's learned backend for this
/// run only. Returns a ``PyPipelineRun``; a FAILED run is returned, not raised.
#[pyfunction]
#[pyo3(signature = (
    context,
    subject_id,
    dims,
    baseline,
    followup,
    labels,
    age = None,
    sex = None,
    interval_days = None,
    predictor = None,
))]
#[allow(clippy::too_many_arguments)]
pub fn run_subject(
    py: Python<'_>,
    context: &PyPipelineContext,
    subject_id: &str,
    dims: (usize, usize, usize),
    baseline: Vec<f64>,
    followup: Vec<f64>,
    labels: Vec<u32>,
    age: Option<u32>,
    sex: Option<String>,
    interval_days: Option<f64>,
    predictor: Option<Py<PyAny>>,
) -> PyResult<PyPipelineRun> {
    let input = SubjectInput::from_arrays(
        subject_id,
        [dims.0, dims.1, dims.2],
        baseline,
        followup,
        labels,
    )
    .map_err(|e| PyValueError::new_err(format!("{:#}", e)))?
    .with_demographics(age, sex)
    .with_interval_days(interval_days);

    let run = run_with_optional_predictor(py, context, &input, predictor);
    Ok(PyPipelineRun::from(&run))
}

/// Runs the subject described by a ``subject.toml`` manifest and, when
/// ``output_dir`` is given, writes its records to ``output_dir/<subject_id>``.
#[pyfunction]
#[pyo3(signature = (context, manifest_path, output_dir = None, predictor = None))]
pub fn run_subject_file(
    py: Python<'_>,
    context: &PyPipelineContext,
    manifest_path: &str,
    output_dir: Option<&str>,
    predictor: Option<Py<PyAny>>,
) -> PyResult<PyPipelineRun> {
    let input = load_subject(manifest_path).map_err(to_py_err)?;
    if output_dir.is_some() {
        validate_subject_id(&input.subject_id).map_err(|e| PyValueError::new_err(e.to_string()))?;
    }
    let run = run_with_optional_predictor(py, context, &input, predictor);
    if let Some(dir) = output_dir {
        let dir = PathBuf::from(dir).join(&input.subject_id);
        write_run_outputs(&run, &input.scans.followup, &dir).map_err(to_py_err)?;
    }
    Ok(PyPipelineRun::from(&run))
}

/// Runs several manifests in parallel on ``workers`` threads; results keep
/// the manifest order.
#[pyfunction]
#[pyo3(signature = (context, manifest_paths, workers = 4))]
pub fn run_batch(
    py: Python<'_>,
    context: &PyPipelineContext,
    manifest_paths: Vec<String>,
    workers: usize,
) -> PyResult<Vec<PyPipelineRun>> {
    let inputs = manifest_paths
        .iter()
        .map(load_subject)
        .collect::<anyhow::Result<Vec<_>>>()
        .map_err(to_py_err)?;
    let ctx = Arc::clone(&context.inner);
    let runs = py
        .allow_threads(|| entry::run_batch(&ctx, &inputs, workers))
        .map_err(to_py_err)?;
    Ok(runs.iter().map(PyPipelineRun::from).collect())
}

/// Installs the tracing subscriber; ``RUST_LOG`` overrides ``level``.
#[pyfunction]
#[pyo3(signature = (level = "info"))]
pub fn init_logging(level: &str) {
    crate::logging::init_logging(level);
}

pub fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(load_context, m)?)?;
    m.add_function(wrap_pyfunction!(run_subject, m)?)?;
    m.add_function(wrap_pyfunction!(run_subject_file, m)?)?;
    m.add_function(wrap_pyfunction!(run_batch, m)?)?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;
    m.add_class::<PyPipelineContext>()?;
    m.add_class::<PyPipelineRun>()?;
    m.add_class::<PyAttempt>()?;
    Ok(())
}
