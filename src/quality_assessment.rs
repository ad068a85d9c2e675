//! Heuristic image-quality scoring.
//!
//! The assessor turns a decoded image into four sub-scores (resolution,
//! brightness, contrast, color) and buckets their weighted average into an
//! [`OverallQuality`]. It is a pure function of the pixel data.

use crate::thresholds::QualityThresholds;
use image::DynamicImage;
use serde::Serialize;

/// ITU-R 601 luma weights, matching the usual "convert to L" behaviour.
pub const LUMA_WEIGHTS: [f32; 3] = [0.299, 0.587, 0.114];

const RATIO_EPSILON: f32 = 1e-6;

/// Pixel statistics shared by the quality assessor and the fundus validator.
///
/// Computed once per decoded image so the validator does not convert the
/// image twice.
#[derive(Clone, Debug)]
pub struct ImageMeasurements {
    pub width: u32,
    pub height: u32,
    /// Whether the source image carried color channels
    pub is_color: bool,
    /// Row-major luma plane in [0, 255]
    pub luma: Vec<f32>,
    /// Mean of R, G, B (equal for grayscale sources)
    pub channel_means: [f32; 3],
}

impl ImageMeasurements {
    pub fn from_image(img: &DynamicImage) -> Self {
        let width = img.width();
        let height = img.height();
        let is_color = img.color().has_color();

        let (luma, channel_means) = if is_color {
            let rgb = img.to_rgb8();
            let mut sums = [0f64; 3];
            let luma: Vec<f32> = rgb
                .pixels()
                .map(|p| {
                    for c in 0..3 {
                        sums[c] += p[c] as f64;
                    }
                    LUMA_WEIGHTS[0] * p[0] as f32
                        + LUMA_WEIGHTS[1] * p[1] as f32
                        + LUMA_WEIGHTS[2] * p[2] as f32
                })
                .collect();
            let n = luma.len().max(1) as f64;
            let means = [
                (sums[0] / n) as f32,
                (sums[1] / n) as f32,
                (sums[2] / n) as f32,
            ];
            (luma, means)
        } else {
            let gray = img.to_luma8();
            let luma: Vec<f32> = gray.pixels().map(|p| p[0] as f32).collect();
            let mean = mean(&luma);
            (luma, [mean; 3])
        };

        Self {
            width,
            height,
            is_color,
            luma,
            channel_means,
        }
    }

    pub fn mean_intensity(&self) -> f32 {
        mean(&self.luma)
    }

    pub fn std_intensity(&self) -> f32 {
        std_dev(&self.luma)
    }

    /// `mean(R) / (mean(G) + mean(B))`, `None` for grayscale sources.
    pub fn red_dominance(&self) -> Option<f32> {
        if !self.is_color {
            return None;
        }
        let [r, g, b] = self.channel_means;
        Some(r / (g + b + RATIO_EPSILON))
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

pub(crate) fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64) as f32
}

pub(crate) fn std_dev(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values) as f64;
    let var = values
        .iter()
        .map(|&v| {
            let d = v as f64 - m;
            d * d
        })
        .sum::<f64>()
        / values.len() as f64;
    var.sqrt() as f32
}

/// Discrete quality bucket, ordered from worst to best.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallQuality {
    VeryLow,
    Low,
    Medium,
    High,
}

impl OverallQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallQuality::VeryLow => "very_low",
            OverallQuality::Low => "low",
            OverallQuality::Medium => "medium",
            OverallQuality::High => "high",
        }
    }
}

impl std::fmt::Display for OverallQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a quality assessment. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QualityReport {
    pub width: u32,
    pub height: u32,
    pub mean_intensity: f32,
    pub std_intensity: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub red_dominance: Option<f32>,

    pub resolution_score: f32,
    pub brightness_score: f32,
    pub contrast_score: f32,
    pub color_score: f32,
    /// Weighted average of the four sub-scores
    pub composite_score: f32,
    pub overall_quality: OverallQuality,
    pub warnings: Vec<String>,
}

pub fn resolution_score(pixels: u64, t: &QualityThresholds) -> f32 {
    t.resolution_breakpoints
        .iter()
        .position(|&bp| pixels >= bp)
        .map(|i| t.resolution_scores[i])
        .unwrap_or(t.resolution_scores[3])
}

pub fn brightness_score(mean_intensity: f32, t: &QualityThresholds) -> f32 {
    let within = |(lo, hi): (f32, f32)| (lo..=hi).contains(&mean_intensity);
    if within(t.brightness_ideal) {
        t.brightness_scores[0]
    } else if within(t.brightness_acceptable) {
        t.brightness_scores[1]
    } else {
        t.brightness_scores[2]
    }
}

pub fn contrast_score(std_intensity: f32, t: &QualityThresholds) -> f32 {
    t.contrast_breakpoints
        .iter()
        .position(|&bp| std_intensity >= bp)
        .map(|i| t.contrast_scores[i])
        .unwrap_or(t.contrast_scores[3])
}

pub fn color_score(red_dominance: Option<f32>, t: &QualityThresholds) -> f32 {
    let Some(ratio) = red_dominance else {
        return t.grayscale_color_score;
    };
    let within = |(lo, hi): (f32, f32)| (lo..=hi).contains(&ratio);
    if within(t.color_ideal) {
        t.color_scores[0]
    } else if within(t.color_acceptable) {
        t.color_scores[1]
    } else {
        t.color_scores[2]
    }
}

/// Weighted average of resolution, brightness, contrast and color scores.
pub fn composite_score(scores: [f32; 4], t: &QualityThresholds) -> f32 {
    scores
        .iter()
        .zip(t.weights.iter())
        .map(|(s, w)| s * w)
        .sum()
}

pub fn bucket_quality(composite: f32, t: &QualityThresholds) -> OverallQuality {
    let [high, medium, low] = t.overall_breakpoints;
    if composite >= high {
        OverallQuality::High
    } else if composite >= medium {
        OverallQuality::Medium
    } else if composite >= low {
        OverallQuality::Low
    } else {
        OverallQuality::VeryLow
    }
}

/// Computes [`QualityReport`]s from pixel data.
#[derive(Clone, Debug, Default)]
pub struct QualityAssessor {
    thresholds: QualityThresholds,
}

impl QualityAssessor {
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self { thresholds }
    }

    pub fn assess(&self, img: &DynamicImage) -> QualityReport {
        self.assess_measurements(&ImageMeasurements::from_image(img))
    }

    pub fn assess_measurements(&self, m: &ImageMeasurements) -> QualityReport {
        let t = &self.thresholds;
        let mean_intensity = m.mean_intensity();
        let std_intensity = m.std_intensity();
        let red_dominance = m.red_dominance();

        let resolution = resolution_score(m.pixel_count(), t);
        let brightness = brightness_score(mean_intensity, t);
        let contrast = contrast_score(std_intensity, t);
        let color = color_score(red_dominance, t);
        let composite = composite_score([resolution, brightness, contrast, color], t);
        let overall_quality = bucket_quality(composite, t);

        let mut warnings = Vec::new();
        if resolution < 1.0 {
            warnings.push(format!(
                "Low resolution image ({}x{}); fine retinal detail may be lost",
                m.width, m.height
            ));
        }
        if brightness < 1.0 {
            if mean_intensity < t.brightness_ideal.0 {
                warnings.push("Image appears too dark".to_string());
            } else {
                warnings.push("Image appears overexposed".to_string());
            }
        }
        if contrast < 1.0 {
            warnings.push("Low contrast image".to_string());
        }
        if red_dominance.is_none() {
            warnings.push("Grayscale image; color information is unavailable".to_string());
        } else if color < 1.0 {
            warnings.push("Unusual color balance for a fundus photograph".to_string());
        }

        log::debug!(
            "Quality {}x{}: res={resolution:.2} bright={brightness:.2} (mean {mean_intensity:.1}) \
             contrast={contrast:.2} (std {std_intensity:.1}) color={color:.2} -> {composite:.3} ({overall_quality})",
            m.width,
            m.height
        );

        QualityReport {
            width: m.width,
            height: m.height,
            mean_intensity,
            std_intensity,
            red_dominance,
            resolution_score: resolution,
            brightness_score: brightness,
            contrast_score: contrast,
            color_score: color,
            composite_score: composite,
            overall_quality,
            warnings,
        }
    }
}
