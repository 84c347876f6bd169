use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::{ConfigError, PipelineError};
use crate::io::integrity_check::check_subject_integrity;
use crate::io::SubjectInput;
use crate::processing::explanation::{build_payload, ExplanationPayload};
use crate::processing::jacobian::{build_jacobian_map, JacobianMap, JacobianSummary};
use crate::processing::roi::{aggregate_rois, RoiResult};
use crate::processing::scoring::{score_progression, ProgressionScore};
use crate::processing::zscore::{normalize, ReferenceDistribution, ZScoreResult};
use crate::registration::{
    AcceleratorPool, BackendId, ClassicalBackend, ControllerState, DeformationBackend,
    DeformationField, FallbackController, FieldPredictor, LearnedBackend, QualityGate,
    RegistrationAttempt,
};

/// Session-wide, read-only state: validated configuration, reference
/// distribution, backends in priority order and the accelerator pool.
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub reference: ReferenceDistribution,
    backends: Vec<Arc<dyn DeformationBackend>>,
    accelerator: Arc<AcceleratorPool>,
}

impl PipelineContext {
    /// Backends are ordered by `config.backend_priority`; backends whose id is
    /// not listed are dropped.
    pub fn new(
        config: PipelineConfig,
        reference: ReferenceDistribution,
        backends: Vec<Arc<dyn DeformationBackend>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        reference.validate()?;
        let backends = order_backends(&config.backend_priority, backends);
        let accelerator = AcceleratorPool::new(config.accelerator_slots);
        info!(
            backends = ?backends.iter().map(|b| b.id()).collect::<Vec<_>>(),
            accelerator_slots = config.accelerator_slots,
            "pipeline context loaded"
        );
        Ok(Self {
            config,
            reference,
            backends,
            accelerator,
        })
    }

    /// Learned backend around `predictor` (unavailable without one) plus the
    /// classical solver from `config.classical`.
    pub fn with_default_backends(
        config: PipelineConfig,
        reference: ReferenceDistribution,
        predictor: Option<Arc<dyn FieldPredictor>>,
    ) -> Result<Self, ConfigError> {
        let backends: Vec<Arc<dyn DeformationBackend>> = vec![
            Arc::new(LearnedBackend::new(predictor)),
            Arc::new(ClassicalBackend::new(config.classical)),
        ];
        Self::new(config, reference, backends)
    }

    pub fn backends(&self) -> &[Arc<dyn DeformationBackend>] {
        &self.backends
    }

    pub fn accelerator(&self) -> &Arc<AcceleratorPool> {
        &self.accelerator
    }

    /// The context's backends with the learned one swapped for `predictor`.
    pub fn backends_with_predictor(
        &self,
        predictor: Arc<dyn FieldPredictor>,
    ) -> Vec<Arc<dyn DeformationBackend>> {
        let learned: Arc<dyn DeformationBackend> = Arc::new(LearnedBackend::new(Some(predictor)));
        let mut backends: Vec<Arc<dyn DeformationBackend>> = self
            .backends
            .iter()
            .filter(|b| b.id() != BackendId::Learned)
            .cloned()
            .collect();
        backends.push(learned);
        order_backends(&self.config.backend_priority, backends)
    }

    fn controller(&self, backends: &[Arc<dyn DeformationBackend>]) -> FallbackController {
        FallbackController::new(backends.to_vec(), QualityGate::new(self.config.gate))
            .with_timeout(self.config.attempt_timeout())
            .with_accelerator(Arc::clone(&self.accelerator))
    }
}

fn order_backends(
    priority: &[BackendId],
    backends: Vec<Arc<dyn DeformationBackend>>,
) -> Vec<Arc<dyn DeformationBackend>> {
    priority
        .iter()
        .filter_map(|id| {
            let found = backends.iter().find(|b| b.id() == *id).cloned();
            if found.is_none() {
                warn!(backend = %id, "no backend registered for priority entry");
            }
            found
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Registering,
    Scoring,
    Complete,
    Failed,
}

/// One subject's run. Downstream products exist only for Complete runs; the
/// attempt trail is kept in every terminal state.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub subject_id: String,
    pub status: RunStatus,
    pub attempts: Vec<RegistrationAttempt>,
    pub transitions: Vec<ControllerState>,
    pub deformation: Option<DeformationField>,
    pub jacobian: Option<JacobianMap>,
    pub jacobian_summary: Option<JacobianSummary>,
    pub roi: Option<RoiResult>,
    pub zscores: Option<ZScoreResult>,
    pub score: Option<ProgressionScore>,
    pub explanation: Option<ExplanationPayload>,
    pub failure: Option<PipelineError>,
    pub elapsed_ms: u64,
}

impl PipelineRun {
    fn pending(subject_id: &str) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            status: RunStatus::Pending,
            attempts: Vec::new(),
            transitions: Vec::new(),
            deformation: None,
            jacobian: None,
            jacobian_summary: None,
            roi: None,
            zscores: None,
            score: None,
            explanation: None,
            failure: None,
            elapsed_ms: 0,
        }
    }

    fn fail(&mut self, err: PipelineError) {
        warn!(subject = %self.subject_id, error = %err, "run failed");
        self.status = RunStatus::Failed;
        self.failure = Some(err);
    }

    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Complete
    }

    pub fn accepted_attempt(&self) -> Option<&RegistrationAttempt> {
        self.attempts.last().filter(|a| a.accepted)
    }
}

struct Products {
    jacobian: JacobianMap,
    summary: JacobianSummary,
    roi: RoiResult,
    zscores: ZScoreResult,
    score: ProgressionScore,
    explanation: ExplanationPayload,
}

fn stage<T>(
    subject: &str,
    name: &'static str,
    f: impl FnOnce() -> Result<T, PipelineError>,
) -> Result<T, PipelineError> {
    let start = Instant::now();
    info!(subject, stage = name, "stage started");
    let result = f();
    let elapsed_ms = start.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => info!(subject, stage = name, elapsed_ms, "stage finished"),
        Err(err) => warn!(subject, stage = name, elapsed_ms, error = %err, "stage failed"),
    }
    result
}

pub fn run_subject(ctx: &PipelineContext, input: &SubjectInput) -> PipelineRun {
    run_subject_with_backends(ctx, input, ctx.backends())
}

/// Runs one subject against an explicit backend list (already in priority order).
pub fn run_subject_with_backends(
    ctx: &PipelineContext,
    input: &SubjectInput,
    backends: &[Arc<dyn DeformationBackend>],
) -> PipelineRun {
    let start = Instant::now();
    let subject = input.subject_id.as_str();
    let mut run = PipelineRun::pending(subject);

    if let Err(e) = check_subject_integrity(input) {
        run.fail(PipelineError::InvalidInput(format!("{:#}", e)));
        run.elapsed_ms = start.elapsed().as_millis() as u64;
        return run;
    }

    run.status = RunStatus::Registering;
    let controller = ctx.controller(backends);
    let registration_start = Instant::now();
    info!(subject, stage = "registration", "stage started");
    let outcome = controller.run(&input.scans);
    info!(
        subject,
        stage = "registration",
        elapsed_ms = registration_start.elapsed().as_millis() as u64,
        attempts = outcome.attempts.len(),
        "stage finished"
    );
    run.attempts = outcome.attempts;
    run.transitions = outcome.transitions;

    let Some(field) = outcome.accepted else {
        run.fail(PipelineError::Exhausted {
            attempts: run.attempts.len(),
        });
        run.elapsed_ms = start.elapsed().as_millis() as u64;
        return run;
    };

    run.status = RunStatus::Scoring;
    match score_accepted(ctx, input, &field, &run.attempts) {
        Ok(products) => {
            run.deformation = Some(field);
            run.jacobian = Some(products.jacobian);
            run.jacobian_summary = Some(products.summary);
            run.roi = Some(products.roi);
            run.zscores = Some(products.zscores);
            info!(
                subject,
                category = ?products.score.category,
                composite = products.score.composite_score,
                "run complete"
            );
            run.score = Some(products.score);
            run.explanation = Some(products.explanation);
            run.status = RunStatus::Complete;
        }
        Err(err) => run.fail(err),
    }
    run.elapsed_ms = start.elapsed().as_millis() as u64;
    run
}

fn score_accepted(
    ctx: &PipelineContext,
    input: &SubjectInput,
    field: &DeformationField,
    attempts: &[RegistrationAttempt],
) -> Result<Products, PipelineError> {
    let subject = input.subject_id.as_str();
    let config = &ctx.config;

    let jacobian = stage(subject, "jacobian", || build_jacobian_map(field))?;
    let summary = jacobian.summary();
    let roi = stage(subject, "roi", || aggregate_rois(&jacobian, &input.labels, &config.roi))?;
    let zscores = stage(subject, "zscore", || {
        normalize(
            &roi,
            &ctx.reference,
            &config.normalization,
            input.age,
            input.interval_days,
        )
    })?;
    let score = stage(subject, "scoring", || Ok(score_progression(&zscores, &config.scoring)))?;
    let explanation = stage(subject, "explanation", || {
        let accepted = attempts
            .last()
            .filter(|a| a.accepted)
            .ok_or_else(|| PipelineError::Payload("no accepted attempt recorded".into()))?;
        build_payload(
            input,
            &zscores,
            &score,
            accepted,
            attempts.len(),
            &config.explanation,
        )
    })?;

    Ok(Products {
        jacobian,
        summary,
        roi,
        zscores,
        score,
        explanation,
    })
}
