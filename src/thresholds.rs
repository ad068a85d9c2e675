//! Tunable heuristic constants for quality scoring, fundus validation,
//! preprocessing and confidence calibration.
//!
//! Every magic number used by the screening pipeline lives here so that a
//! reviewer can audit them in one place and tests can vary them without
//! touching the logic. The confidence bonuses in [`ValidationThresholds`] are
//! hand-tuned heuristics; they have not been fitted against clinical ground
//! truth.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// All heuristic thresholds, grouped by the component that consumes them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub quality: QualityThresholds,
    pub validation: ValidationThresholds,
    pub preprocess: PreprocessThresholds,
    pub calibration: CalibrationThresholds,
}

/// Breakpoints for the quality sub-scores and the overall bucket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    /// Pixel-count breakpoints, highest first (default: 224², 150², 100²)
    pub resolution_breakpoints: [u64; 3],
    /// Scores for the resolution steps, the last entry is "below every breakpoint"
    pub resolution_scores: [f32; 4],

    /// Mean intensity band scoring 1.0 (default: [50, 150])
    pub brightness_ideal: (f32, f32),
    /// Mean intensity band scoring 0.7 (default: [30, 180])
    pub brightness_acceptable: (f32, f32),
    /// Scores for ideal / acceptable / other brightness
    pub brightness_scores: [f32; 3],

    /// Std-dev breakpoints, highest first (default: 40, 25, 15)
    pub contrast_breakpoints: [f32; 3],
    pub contrast_scores: [f32; 4],

    /// Red / (green + blue) band scoring 1.0 (default: [0.9, 1.3])
    pub color_ideal: (f32, f32),
    /// Red / (green + blue) band scoring 0.7 (default: [0.7, 1.5])
    pub color_acceptable: (f32, f32),
    pub color_scores: [f32; 3],
    /// Flat color score for single-channel images (default: 0.6)
    pub grayscale_color_score: f32,

    /// Weights for resolution, brightness, contrast, color (default: 0.3, 0.2, 0.3, 0.2)
    pub weights: [f32; 4],
    /// Composite cut-offs for high / medium / low (default: 0.8, 0.6, 0.4)
    pub overall_breakpoints: [f32; 3],
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            resolution_breakpoints: [224 * 224, 150 * 150, 100 * 100],
            resolution_scores: [1.0, 0.7, 0.5, 0.2],
            brightness_ideal: (50.0, 150.0),
            brightness_acceptable: (30.0, 180.0),
            brightness_scores: [1.0, 0.7, 0.4],
            contrast_breakpoints: [40.0, 25.0, 15.0],
            contrast_scores: [1.0, 0.7, 0.5, 0.3],
            color_ideal: (0.9, 1.3),
            color_acceptable: (0.7, 1.5),
            color_scores: [1.0, 0.7, 0.4],
            grayscale_color_score: 0.6,
            weights: [0.3, 0.2, 0.3, 0.2],
            overall_breakpoints: [0.8, 0.6, 0.4],
        }
    }
}

/// Fundus-specific acceptance checks and confidence synthesis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationThresholds {
    /// Smallest accepted width and height in pixels, in any mode (default: 50)
    pub min_dimension: u32,

    /// Aspect ratio (w/h) outside this range is a hard check (default: [0.3, 3.0])
    pub aspect_hard: (f32, f32),
    /// Aspect ratio outside this range only warns (default: [0.5, 2.0])
    pub aspect_soft: (f32, f32),

    /// Grayscale intensity below which a pixel counts as background (default: 50)
    pub dark_intensity: u8,
    pub dark_ratio_hard_min: f32,
    pub dark_ratio_soft_min: f32,

    /// Grayscale intensity above which a pixel counts as illuminated retina (default: 100)
    pub bright_intensity: u8,
    pub bright_ratio_hard: (f32, f32),
    pub bright_ratio_soft: (f32, f32),

    pub red_dominance_hard_min: f32,
    pub red_dominance_soft_min: f32,

    pub edge_density_hard_max: f32,
    pub edge_density_soft_max: f32,

    /// Starting point for the fundus-likeness confidence (default: 0.5)
    pub base_confidence: f32,
    /// Dark ratio band typical of a circular fundus on black (default: [0.3, 0.7])
    pub dark_ratio_bonus_band: (f32, f32),
    pub dark_ratio_bonus: f32,
    /// Center must be this many times brighter than the border (default: 1.5)
    pub center_border_ratio: f32,
    pub center_bonus: f32,
    pub red_dominance_bonus_band: (f32, f32),
    pub red_dominance_bonus: f32,
    /// Ceiling for both the base and the quality-adjusted confidence (default: 0.95)
    pub confidence_cap: f32,
    /// Share of the confidence that is independent of image quality (default: 0.7)
    pub quality_floor: f32,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            min_dimension: 50,
            aspect_hard: (0.3, 3.0),
            aspect_soft: (0.5, 2.0),
            dark_intensity: 50,
            dark_ratio_hard_min: 0.05,
            dark_ratio_soft_min: 0.15,
            bright_intensity: 100,
            bright_ratio_hard: (0.01, 0.99),
            bright_ratio_soft: (0.05, 0.95),
            red_dominance_hard_min: 0.3,
            red_dominance_soft_min: 0.5,
            edge_density_hard_max: 0.9,
            edge_density_soft_max: 0.7,
            base_confidence: 0.5,
            dark_ratio_bonus_band: (0.3, 0.7),
            dark_ratio_bonus: 0.2,
            center_border_ratio: 1.5,
            center_bonus: 0.2,
            red_dominance_bonus_band: (0.8, 1.5),
            red_dominance_bonus: 0.1,
            confidence_cap: 0.95,
            quality_floor: 0.7,
        }
    }
}

/// Parameters of the deterministic preprocessing transform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessThresholds {
    /// Tile grid for local histogram equalization (default: 8x8)
    pub clahe_tiles: (u32, u32),
    /// Histogram clip limit relative to a flat histogram (default: 2.0)
    pub clahe_clip_limit: f32,
    /// Unsharp blend strength, 1.0 leaves the image unchanged (default: 1.2)
    pub sharpen_factor: f32,
    /// Sigma of the smoothing used as the sharpening reference (default: 1.0)
    pub sharpen_sigma: f32,
    /// Saturation blend strength (default: 1.1)
    pub saturation_factor: f32,
    /// Mean luminance under which the image is brightened (default: 100)
    pub dark_luminance: f32,
    /// Mean luminance over which the image is darkened (default: 180)
    pub bright_luminance: f32,
    pub brighten_factor: f32,
    pub darken_factor: f32,
    /// Sigma of the blur used to find the optic-disc candidate (default: 8.0)
    pub roi_blur_sigma: f32,
    /// Offsets at or below this many pixels are left alone (default: 20)
    pub roi_min_offset: f32,
    /// Offsets at or above dim / divisor are treated as noise (default: 4)
    pub roi_max_offset_divisor: f32,
}

impl Default for PreprocessThresholds {
    fn default() -> Self {
        Self {
            clahe_tiles: (8, 8),
            clahe_clip_limit: 2.0,
            sharpen_factor: 1.2,
            sharpen_sigma: 1.0,
            saturation_factor: 1.1,
            dark_luminance: 100.0,
            bright_luminance: 180.0,
            brighten_factor: 1.2,
            darken_factor: 0.9,
            roi_blur_sigma: 8.0,
            roi_min_offset: 20.0,
            roi_max_offset_divisor: 4.0,
        }
    }
}

/// Decision policy constants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationThresholds {
    /// Adjusted confidence under which a verdict is `low_confidence` (default: 0.4)
    pub low_confidence: f32,
    /// Spherical equivalent at or below which refraction is labelled myopia (default: -0.5 D)
    pub myopia_diopters: f32,
    /// Distance from the myopia cut-off at which regression confidence saturates (default: 2.0 D)
    pub regression_saturation_diopters: f32,
}

impl Default for CalibrationThresholds {
    fn default() -> Self {
        Self {
            low_confidence: 0.4,
            myopia_diopters: -0.5,
            regression_saturation_diopters: 2.0,
        }
    }
}

impl Thresholds {
    /// Load thresholds from a TOML file; missing keys keep their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read thresholds file: {}", path.display()))?;
        let thresholds: Thresholds = toml::from_str(&content)
            .with_context(|| format!("Invalid thresholds file: {}", path.display()))?;
        thresholds
            .check()
            .with_context(|| format!("Invalid thresholds file: {}", path.display()))?;
        log::debug!("Loaded thresholds from {}", path.display());
        Ok(thresholds)
    }

    /// Reject values the pipeline cannot run with (blur sigmas must be
    /// positive, bands must be ordered, weights non-negative).
    pub fn check(&self) -> Result<()> {
        let q = &self.quality;
        ordered("quality.brightness_ideal", q.brightness_ideal)?;
        ordered("quality.brightness_acceptable", q.brightness_acceptable)?;
        ordered("quality.color_ideal", q.color_ideal)?;
        ordered("quality.color_acceptable", q.color_acceptable)?;
        if q.weights.iter().any(|w| !w.is_finite() || *w < 0.0) || q.weights.iter().sum::<f32>() <= 0.0 {
            bail!("quality.weights must be non-negative with a positive sum");
        }

        let v = &self.validation;
        if v.min_dimension == 0 {
            bail!("validation.min_dimension must be non-zero");
        }
        ordered("validation.aspect_hard", v.aspect_hard)?;
        ordered("validation.aspect_soft", v.aspect_soft)?;
        ordered("validation.bright_ratio_hard", v.bright_ratio_hard)?;
        ordered("validation.bright_ratio_soft", v.bright_ratio_soft)?;
        ordered("validation.dark_ratio_bonus_band", v.dark_ratio_bonus_band)?;
        ordered("validation.red_dominance_bonus_band", v.red_dominance_bonus_band)?;
        if !(0.0..=1.0).contains(&v.quality_floor) {
            bail!("validation.quality_floor must lie in [0, 1], got {}", v.quality_floor);
        }
        positive("validation.confidence_cap", v.confidence_cap)?;

        let p = &self.preprocess;
        if p.clahe_tiles.0 == 0 || p.clahe_tiles.1 == 0 {
            bail!("preprocess.clahe_tiles must be at least 1x1, got {:?}", p.clahe_tiles);
        }
        positive("preprocess.clahe_clip_limit", p.clahe_clip_limit)?;
        positive("preprocess.sharpen_sigma", p.sharpen_sigma)?;
        positive("preprocess.roi_blur_sigma", p.roi_blur_sigma)?;
        positive("preprocess.roi_max_offset_divisor", p.roi_max_offset_divisor)?;

        positive(
            "calibration.regression_saturation_diopters",
            self.calibration.regression_saturation_diopters,
        )?;
        Ok(())
    }
}

fn ordered(name: &str, (lo, hi): (f32, f32)) -> Result<()> {
    if !(lo.is_finite() && hi.is_finite() && lo <= hi) {
        bail!("{name} must be an ordered [low, high] pair, got [{lo}, {hi}]");
    }
    Ok(())
}

fn positive(name: &str, value: f32) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        bail!("{name} must be positive, got {value}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let parsed: Thresholds = toml::from_str(
            r#"
            [calibration]
            low_confidence = 0.55

            [validation]
            min_dimension = 64
            "#,
        )
        .unwrap();

        assert_eq!(parsed.calibration.low_confidence, 0.55);
        assert_eq!(parsed.validation.min_dimension, 64);
        assert_eq!(parsed.validation.confidence_cap, 0.95);
        assert_eq!(parsed.quality, QualityThresholds::default());
        assert_eq!(parsed.preprocess.clahe_tiles, (8, 8));
    }

    #[test]
    fn test_default_quality_weights_sum_to_one() {
        let weights = QualityThresholds::default().weights;
        let sum: f32 = weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_defaults_pass_check() {
        Thresholds::default().check().unwrap();
    }

    #[test]
    fn test_zero_blur_sigma_is_rejected_at_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("thresholds.toml");
        std::fs::write(&path, "[preprocess]\nroi_blur_sigma = 0.0\n").unwrap();

        let err = Thresholds::from_toml_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("roi_blur_sigma"), "got: {err:#}");
    }

    #[test]
    fn test_check_rejects_unusable_values() {
        let mut t = Thresholds::default();
        t.preprocess.sharpen_sigma = 0.0;
        assert!(t.check().is_err());

        let mut t = Thresholds::default();
        t.preprocess.roi_max_offset_divisor = 0.0;
        assert!(t.check().is_err());

        let mut t = Thresholds::default();
        t.preprocess.clahe_tiles = (0, 8);
        assert!(t.check().is_err());

        let mut t = Thresholds::default();
        t.quality.brightness_ideal = (150.0, 50.0);
        let err = t.check().unwrap_err();
        assert!(err.to_string().contains("brightness_ideal"));

        let mut t = Thresholds::default();
        t.validation.aspect_soft = (2.0, 0.5);
        assert!(t.check().is_err());

        let mut t = Thresholds::default();
        t.quality.weights = [0.5, -0.1, 0.3, 0.3];
        assert!(t.check().is_err());

        let mut t = Thresholds::default();
        t.preprocess.roi_blur_sigma = f32::NAN;
        assert!(t.check().is_err());
    }

    #[test]
    fn test_from_toml_file_missing() {
        let result = Thresholds::from_toml_file(Path::new("/definitely/not/here.toml"));
        assert!(result.is_err());
    }
}
