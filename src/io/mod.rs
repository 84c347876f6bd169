pub mod input;
pub mod integrity_check;
pub mod output;

use anyhow::{bail, Context};
use std::sync::Arc;

/// Index arithmetic for a dense 3-D voxel grid stored x-fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Grid {
    pub dims: [usize; 3],
}

impl Grid {
    pub fn new(dims: [usize; 3]) -> Self {
        Self { dims }
    }

    pub fn len(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        x + self.dims[0] * (y + self.dims[1] * z)
    }

    #[inline]
    pub fn coords(&self, idx: usize) -> [usize; 3] {
        let nx = self.dims[0];
        let ny = self.dims[1];
        [idx % nx, (idx / nx) % ny, idx / (nx * ny)]
    }

    /// Number of voxels in one z-slice.
    pub fn slice_len(&self) -> usize {
        self.dims[0] * self.dims[1]
    }

    /// Returns true if the continuous point lies inside `[0, dim - 1]` on every axis.
    pub fn contains_point(&self, p: [f64; 3]) -> bool {
        (0..3).all(|a| p[a] >= 0.0 && p[a] <= (self.dims[a] as f64 - 1.0))
    }
}

/// Scalar intensity volume (brain-extracted, bias corrected, affinely aligned upstream).
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub grid: Grid,
    pub data: Vec<f64>,
}

impl Volume {
    pub fn new(dims: [usize; 3], data: Vec<f64>) -> anyhow::Result<Self> {
        let grid = Grid::new(dims);
        if grid.is_empty() {
            bail!("Volume grid {:?} has no voxels", dims);
        }
        if data.len() != grid.len() {
            bail!(
                "Volume data length {} does not match grid {:?} ({} voxels)",
                data.len(),
                dims,
                grid.len()
            );
        }
        if data.iter().any(|v| !v.is_finite()) {
            bail!("Volume contains non-finite intensities");
        }
        Ok(Self { grid, data })
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize, z: usize) -> f64 {
        self.data[self.grid.index(x, y, z)]
    }

    /// Trilinear sample at a continuous position, clamped to the grid border.
    pub fn sample(&self, p: [f64; 3]) -> f64 {
        let d = self.grid.dims;
        let mut base = [0usize; 3];
        let mut frac = [0.0f64; 3];
        for a in 0..3 {
            let max = (d[a] - 1) as f64;
            let c = p[a].clamp(0.0, max);
            let f = c.floor();
            base[a] = f as usize;
            frac[a] = c - f;
        }
        let next = |a: usize| (base[a] + 1).min(d[a] - 1);
        let (x0, y0, z0) = (base[0], base[1], base[2]);
        let (x1, y1, z1) = (next(0), next(1), next(2));
        let (fx, fy, fz) = (frac[0], frac[1], frac[2]);

        let c00 = self.at(x0, y0, z0) * (1.0 - fx) + self.at(x1, y0, z0) * fx;
        let c10 = self.at(x0, y1, z0) * (1.0 - fx) + self.at(x1, y1, z0) * fx;
        let c01 = self.at(x0, y0, z1) * (1.0 - fx) + self.at(x1, y0, z1) * fx;
        let c11 = self.at(x0, y1, z1) * (1.0 - fx) + self.at(x1, y1, z1) * fx;
        let c0 = c00 * (1.0 - fy) + c10 * fy;
        let c1 = c01 * (1.0 - fy) + c11 * fy;
        c0 * (1.0 - fz) + c1 * fz
    }
}

/// Anatomical label volume on the subject grid (atlas warped upstream).
#[derive(Debug, Clone, PartialEq)]
pub struct LabelVolume {
    pub grid: Grid,
    pub labels: Vec<u32>,
}

impl LabelVolume {
    pub fn new(dims: [usize; 3], labels: Vec<u32>) -> anyhow::Result<Self> {
        let grid = Grid::new(dims);
        if labels.len() != grid.len() {
            bail!(
                "Label data length {} does not match grid {:?} ({} voxels)",
                labels.len(),
                dims,
                grid.len()
            );
        }
        Ok(Self { grid, labels })
    }
}

/// Baseline (fixed) and follow-up (moving) scans of one subject on a common grid.
#[derive(Debug, Clone)]
pub struct ScanPair {
    pub baseline: Volume,
    pub followup: Volume,
}

impl ScanPair {
    pub fn new(baseline: Volume, followup: Volume) -> anyhow::Result<Self> {
        if baseline.grid != followup.grid {
            bail!(
                "Baseline grid {:?} and follow-up grid {:?} differ",
                baseline.grid.dims,
                followup.grid.dims
            );
        }
        Ok(Self { baseline, followup })
    }

    pub fn grid(&self) -> Grid {
        self.baseline.grid
    }
}

/// One subject's unit of work.
#[derive(Debug, Clone)]
pub struct SubjectInput {
    pub subject_id: String,
    pub scans: Arc<ScanPair>,
    pub labels: LabelVolume,
    pub age: Option<u32>,
    pub sex: Option<String>,
    pub interval_days: Option<f64>,
}

impl SubjectInput {
    /// Builds an input from flat arrays, the way the Python side hands them over.
    pub fn from_arrays(
        subject_id: &str,
        dims: [usize; 3],
        baseline: Vec<f64>,
        followup: Vec<f64>,
        labels: Vec<u32>,
    ) -> anyhow::Result<Self> {
        let baseline = Volume::new(dims, baseline).context("invalid baseline volume")?;
        let followup = Volume::new(dims, followup).context("invalid follow-up volume")?;
        let labels = LabelVolume::new(dims, labels).context("invalid label volume")?;
        Ok(Self {
            subject_id: subject_id.to_string(),
            scans: Arc::new(ScanPair::new(baseline, followup)?),
            labels,
            age: None,
            sex: None,
            interval_days: None,
        })
    }

    pub fn with_demographics(mut self, age: Option<u32>, sex: Option<String>) -> Self {
        self.age = age;
        self.sex = sex;
        self
    }

    pub fn with_interval_days(mut self, interval_days: Option<f64>) -> Self {
        self.interval_days = interval_days;
        self
    }
}

#[cfg(test)]
mod volume_tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_grid_index_roundtrip() {
        let grid = Grid::new([4, 3, 2]);
        for idx in 0..grid.len() {
            let [x, y, z] = grid.coords(idx);
            assert_eq!(grid.index(x, y, z), idx);
        }
    }

    #[test]
    fn test_volume_rejects_wrong_length() {
        assert!(Volume::new([2, 2, 2], vec![0.0; 7]).is_err());
        assert!(Volume::new([0, 2, 2], vec![]).is_err());
        assert!(Volume::new([2, 2, 2], vec![f64::NAN; 8]).is_err());
    }

    #[test]
    fn test_trilinear_sample_linear_ramp() {
        let grid = Grid::new([4, 4, 4]);
        let data = (0..grid.len()).map(|i| grid.coords(i)[0] as f64).collect();
        let vol = Volume::new([4, 4, 4], data).unwrap();
        assert_relative_eq!(vol.sample([1.5, 2.0, 1.0]), 1.5, epsilon = 1e-12);
        // clamped beyond the border
        assert_relative_eq!(vol.sample([9.0, 0.0, 0.0]), 3.0, epsilon = 1e-12);
        assert_relative_eq!(vol.sample([-2.0, 0.0, 0.0]), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_scan_pair_grid_mismatch() {
        let a = Volume::new([2, 2, 2], vec![1.0; 8]).unwrap();
        let b = Volume::new([2, 2, 1], vec![1.0; 4]).unwrap();
        assert!(ScanPair::new(a, b).is_err());
    }
}
