#[cfg(feature = "python")]
pub mod binding;
pub mod config;
pub mod entry;
pub mod error;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod processing;
pub mod registration;
pub mod texture;
mod utils;

pub use config::PipelineConfig;
pub use entry::{load_context, run_and_write, run_batch};
pub use error::{BackendError, ConfigError, PipelineError};
pub use io::{ScanPair, SubjectInput, Volume};
pub use pipeline::{run_subject, PipelineContext, PipelineRun, RunStatus};
pub use processing::scoring::{ProgressionCategory, ProgressionScore};
pub use registration::{BackendId, DeformationBackend, FieldPredictor};

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// This is the module importable from Python:
///
/// ```python
/// import atrophyrs as ar
/// ctx = ar.load_context("config/pipeline.toml", "config/reference.json")
/// run = ar.run_subject_file(ctx, "data/sub-01/subject.toml", output_dir="output")
/// print(run.status, run.category)
/// ```
#[cfg(feature = "python")]
#[pymodule]
fn atrophyrs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    binding::register(m)
}
