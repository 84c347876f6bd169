use image::{ImageBuffer, Luma, Rgb, RgbImage};

/// Diverging color for a Jacobian determinant: blue for shrinkage, white for
/// no change, red for expansion. Folded voxels (det <= 0) are black.
pub fn jacobian_color(det: f64, span: f64) -> Rgb<u8> {
    if !det.is_finite() || det <= 0.0 {
        return Rgb([0, 0, 0]);
    }
    let t = ((det - 1.0) / span).clamp(-1.0, 1.0);
    let fade = ((1.0 - t.abs()) * 255.0).round() as u8;
    if t < 0.0 {
        Rgb([fade, fade, 255])
    } else {
        Rgb([255, fade, fade])
    }
}

/// Largest deviation from 1 among unfolded values, never below `floor`.
pub fn deviation_span(values: &[f64], floor: f64) -> f64 {
    values
        .iter()
        .filter(|v| v.is_finite() && **v > 0.0)
        .map(|v| (v - 1.0).abs())
        .fold(floor, f64::max)
}

/// Renders a row-major (x-fastest) slice; rows are flipped so that y grows
/// upwards, and each voxel becomes a `scale` x `scale` block.
pub fn create_heatmap(values: &[f64], width: u32, height: u32, span: f64, scale: u32) -> RgbImage {
    let scale = scale.max(1);
    ImageBuffer::from_fn(width * scale, height * scale, |px, py| {
        let x = px / scale;
        let y = (height - 1) - py / scale;
        let idx = (y * width + x) as usize;
        jacobian_color(values[idx], span)
    })
}

/// Nearest-rank percentile of a non-empty sample.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Grayscale slice windowed to the 1st..99th percentile of the voxels above
/// the 20th percentile, which keeps background from dominating the contrast.
pub fn create_grayscale_slice(
    values: &[f64],
    width: u32,
    height: u32,
    scale: u32,
) -> ImageBuffer<Luma<u8>, Vec<u8>> {
    let floor = percentile(values, 20.0);
    let foreground: Vec<f64> = values.iter().copied().filter(|v| *v > floor).collect();
    let sample = if foreground.is_empty() { values } else { &foreground[..] };
    let lo = percentile(sample, 1.0);
    let hi = percentile(sample, 99.0);
    let range = (hi - lo).max(f64::EPSILON);

    let scale = scale.max(1);
    ImageBuffer::from_fn(width * scale, height * scale, |px, py| {
        let x = px / scale;
        let y = (height - 1) - py / scale;
        let v = values[(y * width + x) as usize];
        let norm = ((v.clamp(lo, hi) - lo) / range).clamp(0.0, 1.0);
        Luma([(norm * 255.0).round() as u8])
    })
}
