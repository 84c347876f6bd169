pub mod accelerator;
pub mod backend;
pub mod classical;
pub mod fallback;
pub mod field;
pub mod learned;
pub mod quality_gate;

pub use accelerator::{AcceleratorPermit, AcceleratorPool};
pub use backend::{BackendId, DeformationBackend};
pub use classical::{ClassicalBackend, ClassicalParams};
pub use fallback::{ControllerState, FallbackController, RegistrationAttempt, RegistrationOutcome};
pub use field::DeformationField;
pub use learned::{FieldPredictor, LearnedBackend};
pub use quality_gate::{GateReport, GateThresholds, QualityGate, QualityMetrics, Verdict};
