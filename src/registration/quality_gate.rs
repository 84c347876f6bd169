use serde::{Deserialize, Serialize};

use super::field::DeformationField;
use crate::error::{BackendError, ConfigError};
use crate::io::ScanPair;
use crate::processing::jacobian::jacobian_determinants;
use crate::processing::process_utils::{axis_second_derivative, normalized_cross_correlation};

/// Acceptance thresholds. A metric exactly at its threshold is within tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateThresholds {
    pub max_negative_jacobian_fraction: f64,
    pub min_ncc: f64,
    pub max_displacement: f64,
    pub max_mean_displacement: f64,
    pub max_smoothness: f64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            max_negative_jacobian_fraction: 1e-3,
            min_ncc: 0.85,
            max_displacement: 15.0,
            max_mean_displacement: 5.0,
            max_smoothness: 1.0,
        }
    }
}

impl GateThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, f64, bool); 5] = [
            (
                "max_negative_jacobian_fraction",
                self.max_negative_jacobian_fraction,
                (0.0..=1.0).contains(&self.max_negative_jacobian_fraction),
            ),
            ("min_ncc", self.min_ncc, (-1.0..=1.0).contains(&self.min_ncc)),
            ("max_displacement", self.max_displacement, self.max_displacement >= 0.0),
            (
                "max_mean_displacement",
                self.max_mean_displacement,
                self.max_mean_displacement >= 0.0,
            ),
            ("max_smoothness", self.max_smoothness, self.max_smoothness >= 0.0),
        ];
        for (name, value, in_range) in checks {
            if !value.is_finite() || !in_range {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub max_displacement: f64,
    pub mean_displacement: f64,
    pub ncc_similarity: f64,
    pub smoothness: f64,
    pub negative_jacobian_fraction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateReport {
    pub metrics: QualityMetrics,
    pub verdict: Verdict,
    pub reasons: Vec<String>,
}

/// Stateless evaluator; identical inputs always give identical reports.
#[derive(Debug, Clone, Copy)]
pub struct QualityGate {
    thresholds: GateThresholds,
}

impl QualityGate {
    pub fn new(thresholds: GateThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &GateThresholds {
        &self.thresholds
    }

    pub fn evaluate(
        &self,
        field: &DeformationField,
        scans: &ScanPair,
    ) -> Result<GateReport, BackendError> {
        let metrics = compute_metrics(field, scans)?;
        Ok(self.judge(metrics))
    }

    /// Verdict from already computed metrics.
    pub fn judge(&self, metrics: QualityMetrics) -> GateReport {
        let t = &self.thresholds;
        let mut reasons = Vec::new();

        if !within_max(metrics.negative_jacobian_fraction, t.max_negative_jacobian_fraction) {
            reasons.push(format!(
                "negative_jacobian_fraction {:.6} exceeds {:.6}",
                metrics.negative_jacobian_fraction, t.max_negative_jacobian_fraction
            ));
        }
        if !(metrics.ncc_similarity.is_finite() && metrics.ncc_similarity >= t.min_ncc) {
            reasons.push(format!(
                "ncc_similarity {:.4} below {:.4}",
                metrics.ncc_similarity, t.min_ncc
            ));
        }
        if !within_max(metrics.max_displacement, t.max_displacement) {
            reasons.push(format!(
                "max_displacement {:.4} exceeds {:.4}",
                metrics.max_displacement, t.max_displacement
            ));
        }
        if !within_max(metrics.mean_displacement, t.max_mean_displacement) {
            reasons.push(format!(
                "mean_displacement {:.4} exceeds {:.4}",
                metrics.mean_displacement, t.max_mean_displacement
            ));
        }
        if !within_max(metrics.smoothness, t.max_smoothness) {
            reasons.push(format!(
                "smoothness {:.6} exceeds {:.6}",
                metrics.smoothness, t.max_smoothness
            ));
        }

        let verdict = if reasons.is_empty() {
            Verdict::Accepted
        } else {
            Verdict::Rejected
        };
        GateReport {
            metrics,
            verdict,
            reasons,
        }
    }
}

#[inline]
fn within_max(value: f64, ceiling: f64) -> bool {
    value.is_finite() && value <= ceiling
}

pub fn compute_metrics(
    field: &DeformationField,
    scans: &ScanPair,
) -> Result<QualityMetrics, BackendError> {
    if field.grid != scans.grid() || field.vectors.len() != field.grid.len() {
        return Err(BackendError::MalformedInput(format!(
            "field grid {:?} does not match scan grid {:?}",
            field.grid.dims,
            scans.grid().dims
        )));
    }
    let n = field.grid.len() as f64;

    let dets = jacobian_determinants(field);
    let folded = dets.iter().filter(|d| **d <= 0.0).count();
    let negative_jacobian_fraction = folded as f64 / n;

    let warped = field.warp(&scans.followup);
    let ncc_similarity = normalized_cross_correlation(&scans.baseline.data, &warped.data);

    let magnitudes = field.magnitudes();
    let max_displacement = magnitudes.iter().cloned().fold(0.0, f64::max);
    let mean_displacement = magnitudes.iter().sum::<f64>() / n;

    let smoothness = bending_energy(field);

    Ok(QualityMetrics {
        max_displacement,
        mean_displacement,
        ncc_similarity,
        smoothness,
        negative_jacobian_fraction,
    })
}

/// Mean squared pure second derivative over voxels, axes and components.
fn bending_energy(field: &DeformationField) -> f64 {
    let grid = field.grid;
    let mut total = 0.0;
    for idx in 0..grid.len() {
        let c = grid.coords(idx);
        for axis in 0..3 {
            total += axis_second_derivative(&grid, &field.vectors, c, axis).norm_squared();
        }
    }
    total / (grid.len() as f64 * 9.0)
}

#[cfg(test)]
mod quality_gate_tests {
    use super::*;
    use crate::registration::BackendId;
    use crate::utils::test_utils::{noise_scan_pair, scaling_field};
    use approx::assert_relative_eq;

    fn thresholds() -> GateThresholds {
        GateThresholds {
            max_negative_jacobian_fraction: 0.01,
            min_ncc: 0.85,
            max_displacement: 4.0,
            max_mean_displacement: 2.0,
            max_smoothness: 0.5,
        }
    }

    fn passing_metrics() -> QualityMetrics {
        QualityMetrics {
            max_displacement: 1.0,
            mean_displacement: 0.5,
            ncc_similarity: 0.95,
            smoothness: 0.1,
            negative_jacobian_fraction: 0.0,
        }
    }

    #[test]
    fn test_passing_metrics_accepted() {
        let report = QualityGate::new(thresholds()).judge(passing_metrics());
        assert_eq!(report.verdict, Verdict::Accepted);
        assert!(report.reasons.is_empty());
    }

    #[test]
    fn test_metrics_exactly_at_thresholds_accepted() {
        let t = thresholds();
        let metrics = QualityMetrics {
            max_displacement: t.max_displacement,
            mean_displacement: t.max_mean_displacement,
            ncc_similarity: t.min_ncc,
            smoothness: t.max_smoothness,
            negative_jacobian_fraction: t.max_negative_jacobian_fraction,
        };
        assert_eq!(QualityGate::new(t).judge(metrics).verdict, Verdict::Accepted);
    }

    #[test]
    fn test_each_threshold_plus_epsilon_rejected() {
        let t = thresholds();
        let gate = QualityGate::new(t);
        let eps = 1e-9;
        let variants: Vec<(&str, QualityMetrics)> = vec![
            (
                "negative_jacobian_fraction",
                QualityMetrics {
                    negative_jacobian_fraction: t.max_negative_jacobian_fraction + eps,
                    ..passing_metrics()
                },
            ),
            (
                "ncc_similarity",
                QualityMetrics {
                    ncc_similarity: t.min_ncc - eps,
                    ..passing_metrics()
                },
            ),
            (
                "max_displacement",
                QualityMetrics {
                    max_displacement: t.max_displacement + eps,
                    ..passing_metrics()
                },
            ),
            (
                "mean_displacement",
                QualityMetrics {
                    mean_displacement: t.max_mean_displacement + eps,
                    ..passing_metrics()
                },
            ),
            (
                "smoothness",
                QualityMetrics {
                    smoothness: t.max_smoothness + eps,
                    ..passing_metrics()
                },
            ),
        ];
        for (name, metrics) in variants {
            let report = gate.judge(metrics);
            assert_eq!(report.verdict, Verdict::Rejected, "{} should reject", name);
            assert_eq!(report.reasons.len(), 1);
            assert!(report.reasons[0].starts_with(name));
        }
    }

    #[test]
    fn test_low_ncc_sample_rejected() {
        let metrics = QualityMetrics {
            ncc_similarity: 0.70,
            ..passing_metrics()
        };
        let report = QualityGate::new(thresholds()).judge(metrics);
        assert_eq!(report.verdict, Verdict::Rejected);
    }

    #[test]
    fn test_nan_metric_rejected() {
        let metrics = QualityMetrics {
            smoothness: f64::NAN,
            ..passing_metrics()
        };
        assert_eq!(
            QualityGate::new(thresholds()).judge(metrics).verdict,
            Verdict::Rejected
        );
    }

    #[test]
    fn test_identity_field_metrics_on_identical_scans() {
        let scans = noise_scan_pair([8, 8, 8], 7, 0);
        let field = DeformationField::identity(scans.grid(), BackendId::Classical);
        let report = QualityGate::new(thresholds()).evaluate(&field, &scans).unwrap();
        assert_relative_eq!(report.metrics.ncc_similarity, 1.0, epsilon = 1e-12);
        assert_eq!(report.metrics.max_displacement, 0.0);
        assert_eq!(report.metrics.mean_displacement, 0.0);
        assert_eq!(report.metrics.smoothness, 0.0);
        assert_eq!(report.metrics.negative_jacobian_fraction, 0.0);
        assert_eq!(report.verdict, Verdict::Accepted);
    }

    #[test]
    fn test_folding_field_detected() {
        let scans = noise_scan_pair([6, 6, 6], 3, 0);
        // scale factor -0.5 in every direction flips orientation everywhere
        let field = scaling_field(scans.grid(), -0.5, BackendId::Learned);
        let metrics = compute_metrics(&field, &scans).unwrap();
        assert_relative_eq!(metrics.negative_jacobian_fraction, 1.0);
    }

    #[test]
    fn test_evaluate_is_idempotent() {
        let scans = noise_scan_pair([6, 5, 4], 11, 1);
        let field = scaling_field(scans.grid(), 1.05, BackendId::Classical);
        let gate = QualityGate::new(thresholds());
        assert_eq!(gate.evaluate(&field, &scans), gate.evaluate(&field, &scans));
    }

    #[test]
    fn test_grid_mismatch_is_malformed() {
        let scans = noise_scan_pair([4, 4, 4], 1, 0);
        let field = DeformationField::identity(crate::io::Grid::new([4, 4, 3]), BackendId::Classical);
        assert!(matches!(
            QualityGate::new(thresholds()).evaluate(&field, &scans),
            Err(BackendError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_threshold_validation() {
        assert!(GateThresholds::default().validate().is_ok());
        let bad = GateThresholds {
            min_ncc: 1.5,
            ..GateThresholds::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::InvalidThreshold { name: "min_ncc", .. })
        ));
    }
}
