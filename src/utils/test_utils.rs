use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::BackendError;
use crate::io::{Grid, LabelVolume, ScanPair, Volume};
use crate::registration::{BackendId, DeformationBackend, DeformationField};

/// Isotropic Gaussian blob, peak 100.
pub fn blob_volume(dims: [usize; 3], center: [f64; 3], sigma: f64) -> Volume {
    let grid = Grid::new(dims);
    let data = (0..grid.len())
        .map(|i| {
            let c = grid.coords(i);
            let r2: f64 = (0..3).map(|a| (c[a] as f64 - center[a]).powi(2)).sum();
            100.0 * (-r2 / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    Volume::new(dims, data).unwrap()
}

/// Seeded uniform noise as baseline; follow-up is the baseline shifted by
/// `shift` voxels along x (border clamped). `shift == 0` gives identical scans.
pub fn noise_scan_pair(dims: [usize; 3], seed: u64, shift: usize) -> ScanPair {
    let grid = Grid::new(dims);
    let mut rng = StdRng::seed_from_u64(seed);
    let baseline: Vec<f64> = (0..grid.len()).map(|_| rng.random_range(0.0..100.0)).collect();
    let followup: Vec<f64> = (0..grid.len())
        .map(|i| {
            let [x, y, z] = grid.coords(i);
            let sx = x.saturating_sub(shift);
            baseline[grid.index(sx, y, z)]
        })
        .collect();
    ScanPair::new(
        Volume::new(dims, baseline).unwrap(),
        Volume::new(dims, followup).unwrap(),
    )
    .unwrap()
}

/// `x + u(x) = c + factor * (x - c)` around the grid center.
pub fn scaling_field(grid: Grid, factor: f64, backend: BackendId) -> DeformationField {
    let center: Vec<f64> = grid.dims.iter().map(|d| (*d as f64 - 1.0) / 2.0).collect();
    let vectors = (0..grid.len())
        .map(|i| {
            let c = grid.coords(i);
            Vector3::new(
                (factor - 1.0) * (c[0] as f64 - center[0]),
                (factor - 1.0) * (c[1] as f64 - center[1]),
                (factor - 1.0) * (c[2] as f64 - center[2]),
            )
        })
        .collect();
    DeformationField::new(grid, vectors, backend).unwrap()
}

/// Constant displacement of `amount` voxels along x.
pub fn shift_field(grid: Grid, amount: f64, backend: BackendId) -> DeformationField {
    DeformationField::new(grid, vec![Vector3::new(amount, 0.0, 0.0); grid.len()], backend).unwrap()
}

/// Left half (x < nx/2) label 17, right half label 53.
pub fn two_region_labels(dims: [usize; 3]) -> LabelVolume {
    let grid = Grid::new(dims);
    let labels = (0..grid.len())
        .map(|i| if grid.coords(i)[0] < dims[0] / 2 { 17 } else { 53 })
        .collect();
    LabelVolume::new(dims, labels).unwrap()
}

enum MockBehavior {
    Field(fn(Grid, BackendId) -> DeformationField),
    Fail(BackendError),
    Panic,
}

/// Backend stand-in with a scripted result and a call counter.
pub struct MockBackend {
    id: BackendId,
    available: bool,
    accelerator: bool,
    delay: Option<Duration>,
    behavior: MockBehavior,
    calls: AtomicUsize,
}

impl MockBackend {
    fn build(id: BackendId, behavior: MockBehavior) -> Self {
        Self {
            id,
            available: true,
            accelerator: false,
            delay: None,
            behavior,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn identity(id: BackendId) -> Self {
        Self::build(id, MockBehavior::Field(DeformationField::identity))
    }

    pub fn with_field(id: BackendId, make: fn(Grid, BackendId) -> DeformationField) -> Self {
        Self::build(id, MockBehavior::Field(make))
    }

    pub fn failing(id: BackendId, err: BackendError) -> Self {
        Self::build(id, MockBehavior::Fail(err))
    }

    pub fn panicking(id: BackendId) -> Self {
        Self::build(id, MockBehavior::Panic)
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn on_accelerator(mut self) -> Self {
        self.accelerator = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DeformationBackend for MockBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn uses_accelerator(&self) -> bool {
        self.accelerator
    }

    fn register(&self, fixed: &Volume, _moving: &Volume) -> Result<DeformationField, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        match &self.behavior {
            MockBehavior::Field(make) => Ok(make(fixed.grid, self.id)),
            MockBehavior::Fail(err) => Err(err.clone()),
            MockBehavior::Panic => panic!("mock backend failure"),
        }
    }
}
