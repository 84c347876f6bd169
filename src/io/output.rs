use anyhow::Context;
use serde::Serialize;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::pipeline::{PipelineRun, RunStatus};
use crate::processing::jacobian::JacobianSummary;
use crate::processing::roi::RoiResult;
use crate::processing::scoring::{ProgressionCategory, ProgressionScore};
use crate::processing::zscore::ZScoreResult;
use crate::processing::RegionMap;
use crate::registration::{BackendId, ControllerState, RegistrationAttempt};
pub use crate::texture::{FOLLOWUP_SLICE_FILE, HEATMAP_FILE};
use crate::texture::{write_jacobian_heatmap, write_scan_slice};

pub const RUN_SUMMARY_FILE: &str = "run_summary.json";
pub const ATTEMPTS_FILE: &str = "attempts.csv";
pub const ROI_JSON_FILE: &str = "roi_deltas.json";
pub const ROI_CSV_FILE: &str = "roi_deltas.csv";
pub const ZSCORES_FILE: &str = "z_scores.json";
pub const SCORE_FILE: &str = "progression_score.json";
pub const PAYLOAD_FILE: &str = "explanation_payload.json";

/// Files that only a Complete run writes.
pub const PRODUCT_FILES: [&str; 7] = [
    ROI_JSON_FILE,
    ROI_CSV_FILE,
    ZSCORES_FILE,
    SCORE_FILE,
    PAYLOAD_FILE,
    HEATMAP_FILE,
    FOLLOWUP_SLICE_FILE,
];

/// Deletes products left in `output_dir` by an earlier run of the same subject.
fn remove_stale_products(output_dir: &Path) -> anyhow::Result<()> {
    for name in PRODUCT_FILES {
        let path = output_dir.join(name);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove stale output {:?}", path))?;
        }
    }
    Ok(())
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)
        .with_context(|| format!("failed to write JSON {:?}", path))?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct RoiDeltaRecord {
    pub mean_jacobian: f64,
    pub voxel_count: usize,
    pub delta: Option<f64>,
}

#[derive(Serialize)]
struct RoiDeltaRow<'a> {
    region: &'a str,
    mean_jacobian: f64,
    voxel_count: usize,
    delta: Option<f64>,
    zscore: Option<f64>,
}

/// Region table with the delta attached where a z-score exists.
pub fn roi_deltas(roi: &RoiResult, zscores: &ZScoreResult) -> RegionMap<RoiDeltaRecord> {
    roi.iter()
        .map(|(name, stats)| {
            (
                name.to_string(),
                RoiDeltaRecord {
                    mean_jacobian: stats.mean_jacobian,
                    voxel_count: stats.voxel_count,
                    delta: zscores.regions.get(name).map(|z| z.delta),
                },
            )
        })
        .collect()
}

pub fn write_roi_csv(path: &Path, roi: &RoiResult, zscores: &ZScoreResult) -> anyhow::Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("failed to create {:?}", path))?;
    for (region, stats) in roi.iter() {
        let z = zscores.regions.get(region);
        writer.serialize(RoiDeltaRow {
            region,
            mean_jacobian: stats.mean_jacobian,
            voxel_count: stats.voxel_count,
            delta: z.map(|z| z.delta),
            zscore: z.map(|z| z.zscore),
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct AttemptRow<'a> {
    attempt_index: usize,
    backend_id: BackendId,
    verdict: &'a str,
    accepted: bool,
    max_displacement: Option<f64>,
    mean_displacement: Option<f64>,
    ncc_similarity: Option<f64>,
    smoothness: Option<f64>,
    negative_jacobian_fraction: Option<f64>,
    backend_error: Option<&'a str>,
    rejection_reasons: String,
    elapsed_ms: u64,
}

pub fn write_attempts_csv(path: &Path, attempts: &[RegistrationAttempt]) -> anyhow::Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("failed to create {:?}", path))?;
    for a in attempts {
        let m = a.metrics.as_ref();
        writer.serialize(AttemptRow {
            attempt_index: a.attempt_index,
            backend_id: a.backend_id,
            verdict: if a.accepted { "ACCEPTED" } else { "REJECTED" },
            accepted: a.accepted,
            max_displacement: m.map(|m| m.max_displacement),
            mean_displacement: m.map(|m| m.mean_displacement),
            ncc_similarity: m.map(|m| m.ncc_similarity),
            smoothness: m.map(|m| m.smoothness),
            negative_jacobian_fraction: m.map(|m| m.negative_jacobian_fraction),
            backend_error: a.backend_error.as_deref(),
            rejection_reasons: a.rejection_reasons.join("; "),
            elapsed_ms: a.elapsed_ms,
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Score plus the registration audit trail it was derived from.
#[derive(Serialize)]
pub struct ProgressionRecord<'a> {
    pub subject_id: &'a str,
    #[serde(flatten)]
    pub score: &'a ProgressionScore,
    pub attempts: &'a [RegistrationAttempt],
}

/// Written for every run, including failed ones.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub subject_id: String,
    pub status: RunStatus,
    pub failure: Option<String>,
    pub accepted_backend: Option<BackendId>,
    pub attempts: Vec<RegistrationAttempt>,
    pub transitions: Vec<ControllerState>,
    pub jacobian: Option<JacobianSummary>,
    pub category: Option<ProgressionCategory>,
    pub composite_score: Option<f64>,
    pub elapsed_ms: u64,
}

impl From<&PipelineRun> for RunSummary {
    fn from(run: &PipelineRun) -> Self {
        Self {
            subject_id: run.subject_id.clone(),
            status: run.status,
            failure: run.failure.as_ref().map(|e| e.to_string()),
            accepted_backend: run.accepted_attempt().map(|a| a.backend_id),
            attempts: run.attempts.clone(),
            transitions: run.transitions.clone(),
            jacobian: run.jacobian_summary,
            category: run.score.as_ref().map(|s| s.category),
            composite_score: run.score.as_ref().map(|s| s.composite_score),
            elapsed_ms: run.elapsed_ms,
        }
    }
}

/// Writes every record a run produced into `output_dir` and returns the paths.
/// Failed runs get the summary and the attempt table only; products of an
/// earlier run in the same directory are removed.
pub fn write_run_outputs(
    run: &PipelineRun,
    followup: &crate::io::Volume,
    output_dir: &Path,
) -> anyhow::Result<Vec<PathBuf>> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create output directory {:?}", output_dir))?;
    let mut written = Vec::new();

    let path = output_dir.join(RUN_SUMMARY_FILE);
    write_json(&path, &RunSummary::from(run))?;
    written.push(path);

    let path = output_dir.join(ATTEMPTS_FILE);
    write_attempts_csv(&path, &run.attempts)?;
    written.push(path);

    let (Some(roi), Some(zscores), Some(score), Some(payload), Some(jacobian)) = (
        run.roi.as_ref(),
        run.zscores.as_ref(),
        run.score.as_ref(),
        run.explanation.as_ref(),
        run.jacobian.as_ref(),
    ) else {
        remove_stale_products(output_dir)?;
        return Ok(written);
    };

    let path = output_dir.join(ROI_JSON_FILE);
    write_json(&path, &roi_deltas(roi, zscores))?;
    written.push(path);

    let path = output_dir.join(ROI_CSV_FILE);
    write_roi_csv(&path, roi, zscores)?;
    written.push(path);

    let path = output_dir.join(ZSCORES_FILE);
    write_json(&path, zscores)?;
    written.push(path);

    let path = output_dir.join(SCORE_FILE);
    write_json(
        &path,
        &ProgressionRecord {
            subject_id: &run.subject_id,
            score,
            attempts: &run.attempts,
        },
    )?;
    written.push(path);

    let path = output_dir.join(PAYLOAD_FILE);
    write_json(&path, payload)?;
    written.push(path);

    written.push(write_jacobian_heatmap(jacobian, &output_dir.join(HEATMAP_FILE))?);
    written.push(write_scan_slice(followup, &output_dir.join(FOLLOWUP_SLICE_FILE))?);
    Ok(written)
}

#[cfg(test)]
mod output_tests {
    use super::*;
    use crate::processing::roi::RegionStats;
    use crate::processing::zscore::{DeltaUnit, RegionZScore};
    use crate::registration::{QualityMetrics, Verdict};
    use tempfile::TempDir;

    fn attempts() -> Vec<RegistrationAttempt> {
        vec![
            RegistrationAttempt {
                attempt_index: 0,
                backend_id: BackendId::Learned,
                field: None,
                metrics: Some(QualityMetrics {
                    max_displacement: 3.0,
                    mean_displacement: 1.0,
                    ncc_similarity: 0.70,
                    smoothness: 0.1,
                    negative_jacobian_fraction: 0.0,
                }),
                verdict: Verdict::Rejected,
                accepted: false,
                rejection_reasons: vec!["ncc_similarity 0.7000 below 0.8500".into()],
                backend_error: None,
                elapsed_ms: 4,
            },
            RegistrationAttempt {
                attempt_index: 1,
                backend_id: BackendId::Classical,
                field: None,
                metrics: None,
                verdict: Verdict::Rejected,
                accepted: false,
                rejection_reasons: vec!["backend error: boom".into()],
                backend_error: Some("boom".into()),
                elapsed_ms: 9,
            },
        ]
    }

    #[test]
    fn test_attempts_csv_has_one_row_per_attempt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(ATTEMPTS_FILE);
        write_attempts_csv(&path, &attempts()).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("attempt_index,backend_id,verdict,accepted"));
        assert!(lines[1].contains("learned"));
        assert!(lines[1].contains("0.7"));
        assert!(lines[2].contains("boom"));
    }

    #[test]
    fn test_roi_deltas_keep_region_order() {
        let roi: RoiResult = vec![
            ("ventricles".to_string(), RegionStats { mean_jacobian: 1.02, voxel_count: 4 }),
            ("hippocampus".to_string(), RegionStats { mean_jacobian: 0.97, voxel_count: 6 }),
        ]
        .into_iter()
        .collect();
        let zscores = ZScoreResult {
            regions: vec![(
                "hippocampus".to_string(),
                RegionZScore {
                    delta: -0.03,
                    zscore: -2.0,
                    reference_mean: -0.01,
                    reference_std: 0.01,
                    zero_variance: false,
                },
            )]
            .into_iter()
            .collect(),
            unscored: vec!["ventricles".into()],
            age_bin: None,
            unit: DeltaUnit::Fraction,
            interval_years: None,
        };

        let json = serde_json::to_string(&roi_deltas(&roi, &zscores)).unwrap();
        assert!(json.find("ventricles").unwrap() < json.find("hippocampus").unwrap());
        assert!(json.contains(r#""delta":null"#));

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(ROI_CSV_FILE);
        write_roi_csv(&path, &roi, &zscores).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.lines().nth(2).unwrap().starts_with("hippocampus,0.97,6,-0.03,-2"));
    }
}
