use crossbeam::channel::{bounded, RecvTimeoutError};
use serde::Serialize;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::accelerator::AcceleratorPool;
use super::backend::{BackendId, DeformationBackend};
use super::field::DeformationField;
use super::quality_gate::{QualityGate, QualityMetrics, Verdict};
use crate::error::BackendError;
use crate::io::ScanPair;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Init,
    Attempting(BackendId),
    Gated(BackendId, Verdict),
    Retry(BackendId),
    Accepted(BackendId),
    Exhausted,
}

/// One backend invocation and its verdict. Never discarded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrationAttempt {
    pub attempt_index: usize,
    pub backend_id: BackendId,
    #[serde(skip)]
    pub field: Option<DeformationField>,
    pub metrics: Option<QualityMetrics>,
    pub verdict: Verdict,
    pub accepted: bool,
    pub rejection_reasons: Vec<String>,
    pub backend_error: Option<String>,
    pub elapsed_ms: u64,
}

impl RegistrationAttempt {
    fn failed(attempt_index: usize, backend_id: BackendId, err: &BackendError, elapsed_ms: u64) -> Self {
        Self {
            attempt_index,
            backend_id,
            field: None,
            metrics: None,
            verdict: Verdict::Rejected,
            accepted: false,
            rejection_reasons: vec![format!("backend error: {}", err)],
            backend_error: Some(err.to_string()),
            elapsed_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationOutcome {
    pub attempts: Vec<RegistrationAttempt>,
    pub transitions: Vec<ControllerState>,
    /// The accepted field; moved out of its attempt.
    pub accepted: Option<DeformationField>,
}

impl RegistrationOutcome {
    pub fn final_state(&self) -> ControllerState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(ControllerState::Init)
    }

    pub fn accepted_attempt(&self) -> Option<&RegistrationAttempt> {
        self.attempts.last().filter(|a| a.accepted)
    }
}

/// Sequences backend attempts under the quality gate.
///
/// Backends are tried in the given priority order, each at most once, and the
/// loop stops at the first accepted field.
pub struct FallbackController {
    backends: Vec<Arc<dyn DeformationBackend>>,
    gate: QualityGate,
    timeout: Option<Duration>,
    accelerator: Option<Arc<AcceleratorPool>>,
}

impl FallbackController {
    pub fn new(backends: Vec<Arc<dyn DeformationBackend>>, gate: QualityGate) -> Self {
        Self {
            backends,
            gate,
            timeout: None,
            accelerator: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_accelerator(mut self, pool: Arc<AcceleratorPool>) -> Self {
        self.accelerator = Some(pool);
        self
    }

    pub fn run(&self, scans: &Arc<ScanPair>) -> RegistrationOutcome {
        let mut transitions = vec![ControllerState::Init];
        let mut attempts: Vec<RegistrationAttempt> = Vec::new();

        let mut seen = HashSet::new();
        let queue: Vec<&Arc<dyn DeformationBackend>> = self
            .backends
            .iter()
            .filter(|b| {
                if !seen.insert(b.id()) {
                    warn!(backend = %b.id(), "backend listed twice, ignoring repeat");
                    return false;
                }
                if !b.is_available() {
                    info!(backend = %b.id(), "backend not available, skipping");
                    return false;
                }
                true
            })
            .collect();

        for (position, backend) in queue.iter().enumerate() {
            let id = backend.id();
            if position > 0 {
                transitions.push(ControllerState::Retry(id));
            }
            transitions.push(ControllerState::Attempting(id));

            let attempt_index = attempts.len();
            let started = Instant::now();
            info!(backend = %id, attempt = attempt_index, "registration attempt started");

            let mut attempt = match self.invoke(backend, scans) {
                Ok(field) => {
                    let field = field.tagged(attempt_index);
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    match self.gate.evaluate(&field, scans) {
                        Ok(report) => RegistrationAttempt {
                            attempt_index,
                            backend_id: id,
                            accepted: report.verdict == Verdict::Accepted,
                            verdict: report.verdict,
                            metrics: Some(report.metrics),
                            rejection_reasons: report.reasons,
                            backend_error: None,
                            field: Some(field),
                            elapsed_ms,
                        },
                        Err(err) => RegistrationAttempt::failed(attempt_index, id, &err, elapsed_ms),
                    }
                }
                Err(err) => {
                    warn!(backend = %id, error = %err, "registration backend failed");
                    RegistrationAttempt::failed(
                        attempt_index,
                        id,
                        &err,
                        started.elapsed().as_millis() as u64,
                    )
                }
            };

            transitions.push(ControllerState::Gated(id, attempt.verdict));
            if attempt.verdict == Verdict::Accepted {
                info!(backend = %id, attempt = attempt_index, "registration accepted");
                let accepted = attempt.field.take();
                attempts.push(attempt);
                transitions.push(ControllerState::Accepted(id));
                return RegistrationOutcome {
                    attempts,
                    transitions,
                    accepted,
                };
            }

            warn!(
                backend = %id,
                attempt = attempt_index,
                reasons = ?attempt.rejection_reasons,
                "registration rejected"
            );
            attempts.push(attempt);
        }

        warn!(attempts = attempts.len(), "all registration backends exhausted");
        transitions.push(ControllerState::Exhausted);
        RegistrationOutcome {
            attempts,
            transitions,
            accepted: None,
        }
    }

    fn invoke(
        &self,
        backend: &Arc<dyn DeformationBackend>,
        scans: &Arc<ScanPair>,
    ) -> Result<DeformationField, BackendError> {
        let id = backend.id();
        let on_accelerator = backend.uses_accelerator();

        let Some(timeout) = self.timeout else {
            let permit = match (&self.accelerator, on_accelerator) {
                (Some(pool), true) => Some(pool.acquire()),
                _ => None,
            };
            let result = catch_unwind(AssertUnwindSafe(|| {
                backend.register(&scans.baseline, &scans.followup)
            }));
            drop(permit);
            return result.unwrap_or_else(|_| {
                Err(BackendError::Worker {
                    backend: id,
                    reason: "backend panicked".into(),
                })
            });
        };

        // waiting for a slot counts against the attempt's budget
        let started = Instant::now();
        let timed_out = || BackendError::Timeout {
            backend: id,
            timeout_ms: timeout.as_millis() as u64,
        };
        let permit = match (&self.accelerator, on_accelerator) {
            (Some(pool), true) => match pool.acquire_timeout(timeout) {
                Some(permit) => Some(permit),
                None => {
                    warn!(backend = %id, "no accelerator slot within the attempt timeout");
                    return Err(timed_out());
                }
            },
            _ => None,
        };
        let remaining = timeout.saturating_sub(started.elapsed());

        let (tx, rx) = bounded(1);
        let worker_backend = Arc::clone(backend);
        let worker_scans = Arc::clone(scans);
        std::thread::Builder::new()
            .name(format!("register-{}", id))
            .spawn(move || {
                // the permit is held until the solver actually returns
                let _permit = permit;
                let result = worker_backend.register(&worker_scans.baseline, &worker_scans.followup);
                let _ = tx.send(result);
            })
            .map_err(|e| BackendError::Worker {
                backend: id,
                reason: format!("failed to spawn worker: {}", e),
            })?;

        match rx.recv_timeout(remaining) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(timed_out()),
            Err(RecvTimeoutError::Disconnected) => Err(BackendError::Worker {
                backend: id,
                reason: "worker exited without a result".into(),
            }),
        }
    }
}

#[cfg(test)]
mod fallback_tests {
    use super::*;
    use crate::registration::GateThresholds;
    use crate::utils::test_utils::{noise_scan_pair, shift_field, MockBackend};

    fn gate() -> QualityGate {
        QualityGate::new(GateThresholds {
            max_negative_jacobian_fraction: 0.0,
            min_ncc: 0.85,
            max_displacement: 10.0,
            max_mean_displacement: 10.0,
            max_smoothness: 1.0,
        })
    }

    fn scans() -> Arc<ScanPair> {
        Arc::new(noise_scan_pair([8, 8, 8], 42, 0))
    }

    /// Identity passes on identical scans; a 3-voxel shift of noise fails NCC.
    fn accepting(id: BackendId) -> Arc<MockBackend> {
        Arc::new(MockBackend::identity(id))
    }

    fn rejecting(id: BackendId) -> Arc<MockBackend> {
        Arc::new(MockBackend::with_field(id, |grid, id| shift_field(grid, 3.0, id)))
    }

    fn controller(backends: &[Arc<MockBackend>]) -> FallbackController {
        let backends = backends
            .iter()
            .map(|b| b.clone() as Arc<dyn DeformationBackend>)
            .collect();
        FallbackController::new(backends, gate())
    }

    #[test]
    fn test_first_backend_accepted_stops_immediately() {
        let learned = accepting(BackendId::Learned);
        let classical = accepting(BackendId::Classical);
        let controller = controller(&[learned.clone(), classical.clone()]);
        let outcome = controller.run(&scans());

        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(learned.calls(), 1);
        assert_eq!(classical.calls(), 0);
        assert_eq!(
            outcome.transitions,
            vec![
                ControllerState::Init,
                ControllerState::Attempting(BackendId::Learned),
                ControllerState::Gated(BackendId::Learned, Verdict::Accepted),
                ControllerState::Accepted(BackendId::Learned),
            ]
        );
        let field = outcome.accepted.as_ref().unwrap();
        assert_eq!(field.backend_id, BackendId::Learned);
        assert!(outcome.attempts[0].field.is_none());
    }

    #[test]
    fn test_rejection_falls_back_in_order() {
        let learned = rejecting(BackendId::Learned);
        let classical = accepting(BackendId::Classical);
        let controller = controller(&[learned.clone(), classical.clone()]);
        let outcome = controller.run(&scans());

        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].verdict, Verdict::Rejected);
        assert!(outcome.attempts[0].field.is_some());
        assert!(outcome.attempts[0].metrics.unwrap().ncc_similarity < 0.85);
        assert_eq!(outcome.attempts[1].verdict, Verdict::Accepted);
        assert_eq!(outcome.accepted_attempt().unwrap().backend_id, BackendId::Classical);
        assert_eq!(outcome.accepted.as_ref().unwrap().attempt_index, 1);
        assert_eq!(
            outcome.transitions,
            vec![
                ControllerState::Init,
                ControllerState::Attempting(BackendId::Learned),
                ControllerState::Gated(BackendId::Learned, Verdict::Rejected),
                ControllerState::Retry(BackendId::Classical),
                ControllerState::Attempting(BackendId::Classical),
                ControllerState::Gated(BackendId::Classical, Verdict::Accepted),
                ControllerState::Accepted(BackendId::Classical),
            ]
        );
    }

    #[test]
    fn test_exhaustion_keeps_every_attempt() {
        let controller = controller(&[rejecting(BackendId::Learned), rejecting(BackendId::Classical)]);
        let outcome = controller.run(&scans());
        assert!(outcome.accepted.is_none());
        assert_eq!(outcome.final_state(), ControllerState::Exhausted);
        assert_eq!(outcome.attempts.len(), 2);
        assert!(outcome.attempts.iter().all(|a| a.verdict == Verdict::Rejected));
        assert!(outcome.accepted_attempt().is_none());
    }

    #[test]
    fn test_each_backend_attempted_at_most_once() {
        let classical = rejecting(BackendId::Classical);
        let controller = controller(&[classical.clone(), classical.clone(), classical.clone()]);
        let outcome = controller.run(&scans());
        assert_eq!(classical.calls(), 1);
        assert_eq!(outcome.attempts.len(), 1);
    }

    #[test]
    fn test_unavailable_backend_skipped() {
        let learned = Arc::new(MockBackend::identity(BackendId::Learned).unavailable());
        let classical = accepting(BackendId::Classical);
        let controller = controller(&[learned.clone(), classical]);
        let outcome = controller.run(&scans());
        assert_eq!(learned.calls(), 0);
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.attempts[0].backend_id, BackendId::Classical);
        assert_eq!(outcome.attempts[0].attempt_index, 0);
    }

    #[test]
    fn test_backend_error_recovered_by_fallback() {
        let learned = Arc::new(MockBackend::failing(
            BackendId::Learned,
            BackendError::PredictionFailed("model offline".into()),
        ));
        let controller = controller(&[learned, accepting(BackendId::Classical)]);
        let outcome = controller.run(&scans());
        assert_eq!(outcome.attempts.len(), 2);
        assert!(outcome.attempts[0].backend_error.as_deref().unwrap().contains("model offline"));
        assert!(outcome.attempts[0].metrics.is_none());
        assert!(outcome.accepted.is_some());
    }

    #[test]
    fn test_timeout_treated_as_backend_error() {
        let slow = Arc::new(
            MockBackend::identity(BackendId::Learned).with_delay(Duration::from_millis(500)),
        );
        let controller = controller(&[slow, accepting(BackendId::Classical)])
            .with_timeout(Some(Duration::from_millis(20)));
        let outcome = controller.run(&scans());
        assert_eq!(outcome.attempts.len(), 2);
        assert!(outcome.attempts[0]
            .backend_error
            .as_deref()
            .unwrap()
            .contains("did not finish"));
        assert_eq!(outcome.accepted_attempt().unwrap().backend_id, BackendId::Classical);
    }

    #[test]
    fn test_panicking_backend_recovered() {
        let panicking = Arc::new(MockBackend::panicking(BackendId::Learned));
        let controller = controller(&[panicking, accepting(BackendId::Classical)]);
        let outcome = controller.run(&scans());
        assert_eq!(outcome.attempts.len(), 2);
        assert!(outcome.accepted.is_some());
    }

    #[test]
    fn test_deterministic_across_runs() {
        let pair = scans();
        let run = || {
            let outcome =
                controller(&[rejecting(BackendId::Learned), accepting(BackendId::Classical)]).run(&pair);
            let trail: Vec<_> = outcome
                .attempts
                .iter()
                .map(|a| (a.backend_id, a.verdict, a.metrics))
                .collect();
            (outcome.transitions, trail, outcome.accepted)
        };
        let first = run();
        for _ in 0..3 {
            assert_eq!(run(), first);
        }
    }

    #[test]
    fn test_accelerator_permit_released() {
        let pool = AcceleratorPool::new(1);
        let learned = Arc::new(MockBackend::identity(BackendId::Learned).on_accelerator());
        let controller = controller(&[learned]).with_accelerator(pool.clone());
        controller.run(&scans());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_busy_accelerator_counts_against_timeout() {
        let pool = AcceleratorPool::new(1);
        let slow = Arc::new(
            MockBackend::identity(BackendId::Learned)
                .on_accelerator()
                .with_delay(Duration::from_millis(1500)),
        );
        let controller = controller(&[slow, accepting(BackendId::Classical)])
            .with_timeout(Some(Duration::from_millis(50)))
            .with_accelerator(pool.clone());
        let pair = scans();

        // the first run's worker keeps the only slot after its attempt times out
        for _ in 0..2 {
            let started = Instant::now();
            let outcome = controller.run(&pair);
            assert!(started.elapsed() < Duration::from_millis(1000));
            assert_eq!(outcome.attempts.len(), 2);
            assert!(outcome.attempts[0]
                .backend_error
                .as_deref()
                .unwrap()
                .contains("did not finish"));
            assert_eq!(outcome.accepted_attempt().unwrap().backend_id, BackendId::Classical);
        }
    }
}
