use anyhow::{anyhow, Context, Result};
use crossbeam::channel::unbounded;
use crossbeam::thread;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::io::integrity_check::validate_subject_id;
use crate::io::output::write_run_outputs;
use crate::io::SubjectInput;
use crate::pipeline::{run_subject, PipelineContext, PipelineRun};
use crate::processing::zscore::ReferenceDistribution;
use crate::registration::FieldPredictor;

/// Loads and validates the configuration bundle once per session.
pub fn load_context(
    config_path: &Path,
    reference_path: &Path,
    predictor: Option<Arc<dyn FieldPredictor>>,
) -> Result<Arc<PipelineContext>> {
    let config = PipelineConfig::from_path(config_path)
        .with_context(|| format!("loading pipeline config {:?}", config_path))?;
    let reference = ReferenceDistribution::from_path(reference_path)
        .with_context(|| format!("loading reference distribution {:?}", reference_path))?;
    let ctx = PipelineContext::with_default_backends(config, reference, predictor)
        .context("building pipeline context")?;
    Ok(Arc::new(ctx))
}

/// Runs one subject and writes its records to `output_root/<subject_id>`.
pub fn run_and_write(
    ctx: &PipelineContext,
    input: &SubjectInput,
    output_root: &Path,
) -> Result<(PipelineRun, Vec<PathBuf>)> {
    validate_subject_id(&input.subject_id)?;
    let run = run_subject(ctx, input);
    let dir = output_root.join(&input.subject_id);
    let written = write_run_outputs(&run, &input.scans.followup, &dir)
        .with_context(|| format!("writing outputs of subject '{}'", input.subject_id))?;
    info!(
        subject = %input.subject_id,
        status = ?run.status,
        files = written.len(),
        "outputs written"
    );
    Ok((run, written))
}

/// Runs independent subjects on `workers` threads sharing one context.
///
/// Results come back in submission order. A failed run is a normal result;
/// only a panicking worker turns into an error.
pub fn run_batch(
    ctx: &PipelineContext,
    inputs: &[SubjectInput],
    workers: usize,
) -> Result<Vec<PipelineRun>> {
    let workers = workers.clamp(1, inputs.len().max(1));
    let (job_tx, job_rx) = unbounded::<usize>();
    let (result_tx, result_rx) = unbounded::<(usize, PipelineRun)>();
    for idx in 0..inputs.len() {
        // receiver is alive for the whole scope
        let _ = job_tx.send(idx);
    }
    drop(job_tx);

    info!(subjects = inputs.len(), workers, "batch started");
    thread::scope(|s| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            s.spawn(move |_| {
                for idx in job_rx.iter() {
                    let run = run_subject(ctx, &inputs[idx]);
                    if result_tx.send((idx, run)).is_err() {
                        break;
                    }
                }
            });
        }
    })
    .map_err(|panic_payload| anyhow!("batch worker panicked: {:?}", panic_payload))?;
    drop(result_tx);

    let mut slots: Vec<Option<PipelineRun>> = vec![None; inputs.len()];
    for (idx, run) in result_rx.iter() {
        slots[idx] = Some(run);
    }
    let runs = slots
        .into_iter()
        .enumerate()
        .map(|(idx, run)| run.ok_or_else(|| anyhow!("no result for subject #{}", idx)))
        .collect::<Result<Vec<_>>>()?;

    let failed = runs.iter().filter(|r| !r.is_complete()).count();
    if failed > 0 {
        warn!(failed, total = runs.len(), "batch finished with failed runs");
    } else {
        info!(total = runs.len(), "batch finished");
    }
    Ok(runs)
}

#[cfg(test)]
mod entry_tests {
    use super::*;
    use crate::io::output::{ATTEMPTS_FILE, PAYLOAD_FILE, PRODUCT_FILES, RUN_SUMMARY_FILE};
    use crate::pipeline::RunStatus;
    use crate::processing::zscore::ReferenceStats;
    use crate::utils::test_utils::{noise_scan_pair, two_region_labels};
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    const DIMS: [usize; 3] = [6, 6, 6];

    const CONFIG: &str = r#"
backend_priority = ["learned", "classical"]

[scoring]
weights = [
    { region = "17", weight = 0.5, polarity = "negative" },
    { region = "53", weight = 0.5, polarity = "negative" },
]
rules = []
"#;

    fn reference() -> ReferenceDistribution {
        let mut regions = HashMap::new();
        regions.insert("17".to_string(), ReferenceStats { mean: 0.0, std: 0.01 });
        regions.insert("53".to_string(), ReferenceStats { mean: 0.0, std: 0.01 });
        ReferenceDistribution::flat(regions)
    }

    fn subject(id: &str, seed: u64) -> SubjectInput {
        SubjectInput {
            subject_id: id.into(),
            scans: Arc::new(noise_scan_pair(DIMS, seed, 0)),
            labels: two_region_labels(DIMS),
            age: None,
            sex: None,
            interval_days: Some(365.0),
        }
    }

    fn context() -> PipelineContext {
        let config = PipelineConfig::from_toml_str(CONFIG).unwrap();
        PipelineContext::with_default_backends(config, reference(), None).unwrap()
    }

    #[test]
    fn test_load_context_from_files() {
        let tmp = TempDir::new().unwrap();
        let config_path = tmp.path().join("pipeline.toml");
        let reference_path = tmp.path().join("reference.json");
        fs::write(&config_path, CONFIG).unwrap();
        fs::write(
            &reference_path,
            r#"{ "regions": { "17": { "mean": 0.0, "std": 0.01 }, "53": { "mean": 0.0, "std": 0.01 } } }"#,
        )
        .unwrap();
        let ctx = load_context(&config_path, &reference_path, None).unwrap();
        assert_eq!(ctx.backends().len(), 2);

        let missing = load_context(&tmp.path().join("nope.toml"), &reference_path, None);
        assert!(missing.is_err());
    }

    #[test]
    fn test_run_and_write_creates_subject_dir() {
        let tmp = TempDir::new().unwrap();
        let ctx = context();
        let (run, written) = run_and_write(&ctx, &subject("sub-a", 3), tmp.path()).unwrap();
        assert!(run.is_complete());
        let dir = tmp.path().join("sub-a");
        for name in [RUN_SUMMARY_FILE, ATTEMPTS_FILE, PAYLOAD_FILE] {
            assert!(dir.join(name).exists(), "{} missing", name);
        }
        assert!(written.iter().all(|p| p.starts_with(&dir)));

        let summary: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join(RUN_SUMMARY_FILE)).unwrap()).unwrap();
        assert_eq!(summary["status"], "COMPLETE");
        assert_eq!(summary["accepted_backend"], "classical");
    }

    #[test]
    fn test_failed_run_writes_only_audit_files() {
        let tmp = TempDir::new().unwrap();
        let ctx = context();
        let mut input = subject("sub-b", 4);
        input.interval_days = Some(-1.0);
        let (run, written) = run_and_write(&ctx, &input, tmp.path()).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(written.len(), 2);
        assert!(!tmp.path().join("sub-b").join(PAYLOAD_FILE).exists());
    }

    #[test]
    fn test_failed_rerun_removes_earlier_products() {
        let tmp = TempDir::new().unwrap();
        let ctx = context();
        let (run, _) = run_and_write(&ctx, &subject("sub-c", 6), tmp.path()).unwrap();
        assert!(run.is_complete());
        let dir = tmp.path().join("sub-c");
        let payload: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join(PAYLOAD_FILE)).unwrap()).unwrap();
        for key in ["jacobian_overlay", "t1_followup_slice"] {
            let name = payload["context_images"][key].as_str().unwrap();
            assert!(dir.join(name).exists(), "{} not rendered", name);
        }

        let mut input = subject("sub-c", 6);
        input.interval_days = Some(-1.0);
        let (run, _) = run_and_write(&ctx, &input, tmp.path()).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        for name in PRODUCT_FILES {
            assert!(!dir.join(name).exists(), "stale {} left behind", name);
        }
        assert!(dir.join(RUN_SUMMARY_FILE).exists());
    }

    #[test]
    fn test_escaping_subject_id_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("out");
        let ctx = context();
        assert!(run_and_write(&ctx, &subject("../escaped", 5), &root).is_err());
        assert!(!tmp.path().join("escaped").exists());
        assert!(!root.exists());
    }

    #[test]
    fn test_batch_keeps_submission_order() {
        let ctx = context();
        let inputs: Vec<SubjectInput> = (0..5)
            .map(|i| subject(&format!("sub-{}", i), i as u64 + 10))
            .collect();
        let runs = run_batch(&ctx, &inputs, 3).unwrap();
        let ids: Vec<&str> = runs.iter().map(|r| r.subject_id.as_str()).collect();
        assert_eq!(ids, vec!["sub-0", "sub-1", "sub-2", "sub-3", "sub-4"]);
        assert!(runs.iter().all(|r| r.is_complete()));

        assert!(run_batch(&ctx, &[], 4).unwrap().is_empty());
    }
}
