use rayon::prelude::*;
use std::ops::{Add, Mul, Sub};

use crate::io::Grid;

/// First derivative along `axis` at voxel `(x, y, z)`.
///
/// Centered difference in the interior, one-sided at the borders and zero
/// along axes with a single voxel.
pub fn axis_derivative<T>(grid: &Grid, data: &[T], c: [usize; 3], axis: usize) -> T
where
    T: Copy + Sub<Output = T> + Mul<f64, Output = T>,
{
    let n = grid.dims[axis];
    let pos = c[axis];
    let (lo, hi) = if n == 1 {
        (pos, pos)
    } else if pos == 0 {
        (0, 1)
    } else if pos == n - 1 {
        (n - 2, n - 1)
    } else {
        (pos - 1, pos + 1)
    };

    let mut a = c;
    a[axis] = lo;
    let mut b = c;
    b[axis] = hi;
    let va = data[grid.index(a[0], a[1], a[2])];
    let vb = data[grid.index(b[0], b[1], b[2])];

    if hi == lo {
        // difference of identical samples is the additive zero of T
        return vb - va;
    }
    (vb - va) * (1.0 / (hi - lo) as f64)
}

/// Pure second derivative along `axis`, neighbours clamped to the grid.
pub fn axis_second_derivative<T>(grid: &Grid, data: &[T], c: [usize; 3], axis: usize) -> T
where
    T: Copy + Add<Output = T> + Sub<Output = T> + Mul<f64, Output = T>,
{
    let n = grid.dims[axis];
    let pos = c[axis];
    let mut lo = c;
    lo[axis] = pos.saturating_sub(1);
    let mut hi = c;
    hi[axis] = (pos + 1).min(n - 1);

    let f_lo = data[grid.index(lo[0], lo[1], lo[2])];
    let f_hi = data[grid.index(hi[0], hi[1], hi[2])];
    let f_c = data[grid.index(c[0], c[1], c[2])];
    f_hi + f_lo - f_c * 2.0
}

/// Normalized 1-D Gaussian kernel with radius `ceil(3 sigma)`.
pub fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    if sigma <= 0.0 {
        return vec![1.0];
    }
    let radius = (3.0 * sigma).ceil() as i64;
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|i| (-(i * i) as f64 / (2.0 * sigma * sigma)).exp())
        .collect();
    let total: f64 = kernel.iter().sum();
    for k in kernel.iter_mut() {
        *k /= total;
    }
    kernel
}

/// Separable convolution with `kernel` along all three axes, borders clamped.
pub fn smooth_separable<T>(grid: &Grid, data: &[T], kernel: &[f64]) -> Vec<T>
where
    T: Copy + Send + Sync + Add<Output = T> + Mul<f64, Output = T>,
{
    if kernel.len() <= 1 {
        return data.to_vec();
    }
    let mut current = data.to_vec();
    for axis in 0..3 {
        if grid.dims[axis] == 1 {
            continue;
        }
        current = convolve_axis(grid, &current, kernel, axis);
    }
    current
}

fn convolve_axis<T>(grid: &Grid, data: &[T], kernel: &[f64], axis: usize) -> Vec<T>
where
    T: Copy + Send + Sync + Add<Output = T> + Mul<f64, Output = T>,
{
    let radius = (kernel.len() / 2) as i64;
    let n = grid.dims[axis] as i64;
    (0..grid.len())
        .into_par_iter()
        .map(|idx| {
            let c = grid.coords(idx);
            let mut acc: Option<T> = None;
            for (k, w) in kernel.iter().enumerate() {
                let offset = k as i64 - radius;
                let pos = (c[axis] as i64 + offset).clamp(0, n - 1) as usize;
                let mut s = c;
                s[axis] = pos;
                let term = data[grid.index(s[0], s[1], s[2])] * *w;
                acc = Some(match acc {
                    Some(a) => a + term,
                    None => term,
                });
            }
            acc.unwrap_or(data[idx])
        })
        .collect()
}

/// Normalized cross-correlation of two equally sized images.
/// Returns 0.0 when either image is flat.
pub fn normalized_cross_correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let mean_a = a[..n].iter().sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    let mut energy_a = 0.0;
    let mut energy_b = 0.0;
    for (va, vb) in a[..n].iter().zip(&b[..n]) {
        let da = va - mean_a;
        let db = vb - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
        energy_a += va * va;
        energy_b += vb * vb;
    }
    // flat relative to the image's own magnitude, so the cutoff scales with it
    let flat = |var: f64, energy: f64| var <= f64::EPSILON * energy;
    if flat(var_a, energy_a) || flat(var_b, energy_b) {
        return 0.0;
    }
    (cov / (var_a * var_b).sqrt()).clamp(-1.0, 1.0)
}
