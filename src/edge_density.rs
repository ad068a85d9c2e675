use image::{ImageBuffer, Luma};
use imageproc::filter::filter3x3;
use serde::{Deserialize, Serialize};

const K_SOBEL_X: [f32; 9] = [-1.0, 0.0, 1.0, -2.0, 0.0, 2.0, -1.0, 0.0, 1.0];
const K_SOBEL_Y: [f32; 9] = [-1.0, -2.0, -1.0, 0.0, 0.0, 0.0, 1.0, 2.0, 1.0];

type GrayF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

/// How gradient magnitudes are estimated for the edge-density check.
///
/// Edge density is the fraction of pixels whose gradient magnitude is
/// strictly above the mean magnitude of the image. A flat image therefore
/// has density 0.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum EdgeDensityEstimator {
    /// Central finite differences (one-sided at the borders)
    #[default]
    Gradient,
    /// 3x3 Sobel operator with clamped borders
    Sobel,
}

impl EdgeDensityEstimator {
    /// Edge density of a row-major luma plane.
    pub fn density(&self, luma: &[f32], width: u32, height: u32) -> f32 {
        if luma.is_empty() || width == 0 || height == 0 {
            return 0.0;
        }
        let magnitudes = match self {
            EdgeDensityEstimator::Gradient => gradient_magnitudes(luma, width as usize, height as usize),
            EdgeDensityEstimator::Sobel => sobel_magnitudes(luma, width, height),
        };
        fraction_above_mean(&magnitudes)
    }
}

fn fraction_above_mean(magnitudes: &[f32]) -> f32 {
    let mean = magnitudes.iter().map(|&m| m as f64).sum::<f64>() / magnitudes.len() as f64;
    let above = magnitudes.iter().filter(|&&m| m as f64 > mean).count();
    above as f32 / magnitudes.len() as f32
}

fn gradient_magnitudes(luma: &[f32], w: usize, h: usize) -> Vec<f32> {
    let at = |x: usize, y: usize| luma[y * w + x];
    let diff = |lo: f32, hi: f32, span: usize| if span == 0 { 0.0 } else { (hi - lo) / span as f32 };

    let mut out = Vec::with_capacity(w * h);
    for y in 0..h {
        for x in 0..w {
            let (x0, x1) = (x.saturating_sub(1), (x + 1).min(w - 1));
            let (y0, y1) = (y.saturating_sub(1), (y + 1).min(h - 1));
            let gx = diff(at(x0, y), at(x1, y), x1 - x0);
            let gy = diff(at(x, y0), at(x, y1), y1 - y0);
            out.push((gx * gx + gy * gy).sqrt());
        }
    }
    out
}

fn sobel_magnitudes(luma: &[f32], width: u32, height: u32) -> Vec<f32> {
    let Some(gray) = GrayF32::from_raw(width, height, luma.to_vec()) else {
        return vec![0.0; luma.len()];
    };
    let gx: Vec<f32> = filter3x3(&gray, &K_SOBEL_X).into_raw();
    let gy: Vec<f32> = filter3x3(&gray, &K_SOBEL_Y).into_raw();
    gx.iter()
        .zip(gy.iter())
        .map(|(x, y)| (x * x + y * y).sqrt())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Vertical stripes two pixels wide: every interior pixel sits on an edge.
    fn stripes(size: u32) -> Vec<f32> {
        (0..size * size)
            .map(|i| if (i % size) % 4 < 2 { 0.0 } else { 255.0 })
            .collect()
    }

    #[test]
    fn test_flat_image_has_no_edges() {
        let flat = vec![120.0; 64 * 64];
        for est in [EdgeDensityEstimator::Gradient, EdgeDensityEstimator::Sobel] {
            assert_eq!(est.density(&flat, 64, 64), 0.0);
        }
    }

    #[test]
    fn test_single_step_is_sparse() {
        // left half dark, right half bright
        let luma: Vec<f32> = (0..100 * 100)
            .map(|i| if i % 100 < 50 { 10.0 } else { 200.0 })
            .collect();
        for est in [EdgeDensityEstimator::Gradient, EdgeDensityEstimator::Sobel] {
            let d = est.density(&luma, 100, 100);
            assert!(d > 0.0 && d < 0.1, "{est:?} density {d}");
        }
    }

    #[test]
    fn test_striped_image_is_dense() {
        let luma = stripes(40);
        for est in [EdgeDensityEstimator::Gradient, EdgeDensityEstimator::Sobel] {
            let d = est.density(&luma, 40, 40);
            // only the clamped first and last columns fall below the mean
            assert!(d > 0.9, "{est:?} density {d}");
        }
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(EdgeDensityEstimator::Gradient.density(&[], 0, 0), 0.0);
    }
}
