//! Renders attention heatmaps and overlays them on the preprocessed image.

use anyhow::{Context, Result};
use image::{Rgba, RgbaImage, RgbImage};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ColorMap {
    Viridis,
    Plasma,
    Inferno,
    #[default]
    Turbo,
    Grayscale,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeatmapStyle {
    pub colormap: ColorMap,
    /// Heatmap opacity over the base image
    pub alpha: f32,
}

impl Default for HeatmapStyle {
    fn default() -> Self {
        Self {
            colormap: ColorMap::Turbo,
            alpha: 0.45,
        }
    }
}

// Anchor colors at t = 0, 0.25, 0.5, 0.75, 1
const VIRIDIS: [[u8; 3]; 5] = [[68, 1, 84], [59, 82, 139], [33, 145, 140], [94, 201, 98], [253, 231, 37]];
const PLASMA: [[u8; 3]; 5] = [[13, 8, 135], [126, 3, 168], [204, 71, 120], [248, 149, 64], [240, 249, 33]];
const INFERNO: [[u8; 3]; 5] = [[0, 0, 4], [87, 16, 110], [188, 55, 84], [249, 142, 9], [252, 255, 164]];
const TURBO: [[u8; 3]; 5] = [[48, 18, 59], [40, 188, 235], [164, 252, 60], [251, 128, 34], [122, 4, 3]];

fn interpolate(anchors: &[[u8; 3]; 5], t: f32) -> Rgba<u8> {
    let pos = t * (anchors.len() - 1) as f32;
    let lo = (pos.floor() as usize).min(anchors.len() - 2);
    let f = pos - lo as f32;
    let channel = |c: usize| {
        let a = anchors[lo][c] as f32;
        let b = anchors[lo + 1][c] as f32;
        (a + (b - a) * f).round().clamp(0.0, 255.0) as u8
    };
    Rgba([channel(0), channel(1), channel(2), 255])
}

/// Color for a value in [0, 1]; out-of-range values are clamped.
pub fn apply_colormap(value: f32, colormap: ColorMap) -> Rgba<u8> {
    let v = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
    match colormap {
        ColorMap::Viridis => interpolate(&VIRIDIS, v),
        ColorMap::Plasma => interpolate(&PLASMA, v),
        ColorMap::Inferno => interpolate(&INFERNO, v),
        ColorMap::Turbo => interpolate(&TURBO, v),
        ColorMap::Grayscale => {
            let i = (v * 255.0).round() as u8;
            Rgba([i, i, i, 255])
        }
    }
}

/// Sample `data` at fractional column `u`, row `v`.
pub fn bilinear_sample(data: &Array2<f32>, u: f32, v: f32) -> f32 {
    let (rows, cols) = data.dim();
    let u = u.clamp(0.0, (cols - 1) as f32);
    let v = v.clamp(0.0, (rows - 1) as f32);
    let (u0, v0) = (u.floor() as usize, v.floor() as usize);
    let (u1, v1) = ((u0 + 1).min(cols - 1), (v0 + 1).min(rows - 1));
    let (fu, fv) = (u - u0 as f32, v - v0 as f32);

    let top = data[[v0, u0]] * (1.0 - fu) + data[[v0, u1]] * fu;
    let bottom = data[[v1, u0]] * (1.0 - fu) + data[[v1, u1]] * fu;
    top * (1.0 - fv) + bottom * fv
}

/// Colorize a heatmap at `size`, resampling when the grid differs.
pub fn render_heatmap(data: &Array2<f32>, size: (u32, u32), colormap: ColorMap) -> Result<RgbaImage> {
    let (rows, cols) = data.dim();
    if rows == 0 || cols == 0 {
        anyhow::bail!("Cannot render an empty heatmap");
    }
    let (width, height) = size;
    let sx = if width > 1 { (cols - 1) as f32 / (width - 1) as f32 } else { 0.0 };
    let sy = if height > 1 { (rows - 1) as f32 / (height - 1) as f32 } else { 0.0 };
    Ok(RgbaImage::from_fn(width, height, |x, y| {
        apply_colormap(bilinear_sample(data, x as f32 * sx, y as f32 * sy), colormap)
    }))
}

/// Alpha-blend `overlay` onto an opaque copy of `base`.
pub fn composite_with_alpha(base: &RgbImage, overlay: &RgbaImage, alpha: f32) -> Result<RgbImage> {
    if base.dimensions() != overlay.dimensions() {
        anyhow::bail!(
            "Overlay is {:?} but base image is {:?}",
            overlay.dimensions(),
            base.dimensions()
        );
    }
    let alpha = alpha.clamp(0.0, 1.0);
    let mut out = base.clone();
    for (dst, src) in out.pixels_mut().zip(overlay.pixels()) {
        for c in 0..3 {
            dst[c] = ((1.0 - alpha) * dst[c] as f32 + alpha * src[c] as f32).round() as u8;
        }
    }
    Ok(out)
}

/// Heatmap blended over `base` at the base image's resolution.
pub fn render_overlay(base: &RgbImage, heatmap: &Array2<f32>, style: &HeatmapStyle) -> Result<RgbImage> {
    let colored = render_heatmap(heatmap, base.dimensions(), style.colormap)?;
    composite_with_alpha(base, &colored, style.alpha)
}

pub fn save_overlay(base: &RgbImage, heatmap: &Array2<f32>, style: &HeatmapStyle, path: &Path) -> Result<()> {
    let overlay = render_overlay(base, heatmap, style)?;
    overlay
        .save(path)
        .with_context(|| format!("Failed to save heatmap overlay: {}", path.display()))?;
    log::debug!("Saved heatmap overlay to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_colormap_endpoints() {
        assert_eq!(apply_colormap(0.0, ColorMap::Viridis), Rgba([68, 1, 84, 255]));
        assert_eq!(apply_colormap(1.0, ColorMap::Viridis), Rgba([253, 231, 37, 255]));
        assert_eq!(apply_colormap(2.0, ColorMap::Grayscale), Rgba([255, 255, 255, 255]));
        assert_eq!(apply_colormap(f32::NAN, ColorMap::Grayscale), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_render_resamples_to_size() {
        let data = Array2::from_shape_fn((2, 2), |(_, x)| x as f32);
        let img = render_heatmap(&data, (5, 3), ColorMap::Grayscale).unwrap();
        assert_eq!(img.dimensions(), (5, 3));
        assert_eq!(img.get_pixel(0, 1)[0], 0);
        assert_eq!(img.get_pixel(4, 1)[0], 255);
        assert_eq!(img.get_pixel(2, 1)[0], 128);
    }

    #[test]
    fn test_overlay_blends() {
        let base = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        let heat = Array2::from_elem((4, 4), 1.0f32);
        let style = HeatmapStyle {
            colormap: ColorMap::Grayscale,
            alpha: 0.5,
        };
        let out = render_overlay(&base, &heat, &style).unwrap();
        assert!(out.pixels().all(|p| p[0] == 128));
    }

    #[test]
    fn test_composite_size_mismatch() {
        let base = RgbImage::new(4, 4);
        let overlay = RgbaImage::new(3, 4);
        assert!(composite_with_alpha(&base, &overlay, 0.5).is_err());
    }

    #[test]
    fn test_save_overlay_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heat.png");
        let base = RgbImage::from_pixel(8, 8, Rgb([120, 60, 40]));
        let heat = Array2::from_shape_fn((4, 4), |(y, x)| (x + y) as f32 / 6.0);
        save_overlay(&base, &heat, &HeatmapStyle::default(), &path).unwrap();
        let reloaded = image::open(&path).unwrap();
        assert_eq!((reloaded.width(), reloaded.height()), (8, 8));
    }
}
