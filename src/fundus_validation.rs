//! Accept/reject decision for "is this plausibly a retinal fundus photograph".
//!
//! The validator runs the quality assessor, measures a handful of
//! fundus-specific statistics and evaluates a fixed, ordered list of checks.
//! In strict mode the first failing check rejects the image; in lenient mode
//! failures become warnings, except for the minimum-size check which always
//! rejects.

use crate::edge_density::EdgeDensityEstimator;
use crate::error::Rejection;
use crate::quality_assessment::{ImageMeasurements, OverallQuality, QualityAssessor, QualityReport};
use crate::thresholds::{QualityThresholds, ValidationThresholds};
use image::DynamicImage;
use serde::Serialize;

pub const FUNDUS_IMAGE: &str = "fundus_image";
pub const POSSIBLE_FUNDUS_IMAGE: &str = "possible_fundus_image";
pub const EXTREMELY_LOW_RESOLUTION: &str = "extremely_low_resolution";
pub const INVALID_ASPECT_RATIO: &str = "invalid_aspect_ratio";
pub const MISSING_DARK_BACKGROUND: &str = "missing_dark_background";
pub const ABNORMAL_BRIGHTNESS_DISTRIBUTION: &str = "abnormal_brightness_distribution";
pub const INSUFFICIENT_RED_CHANNEL: &str = "insufficient_red_channel";
pub const EXCESSIVE_EDGE_DENSITY: &str = "excessive_edge_density";

/// Fundus-specific statistics measured on the decoded image.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FundusMeasurements {
    pub aspect_ratio: f32,
    /// Fraction of pixels darker than the background threshold
    pub dark_ratio: f32,
    /// Fraction of pixels brighter than the illumination threshold
    pub bright_ratio: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub red_dominance: Option<f32>,
    pub edge_density: f32,
    pub center_brightness: f32,
    pub border_brightness: f32,
}

/// Outcome of one validation pass.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    /// Quality-adjusted fundus-likeness confidence in [0, 1]; 0 when rejected
    pub confidence: f32,
    pub detected_type: String,
    pub quality: OverallQuality,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Whether this result came from a lenient pass
    pub lenient: bool,
    pub measurements: FundusMeasurements,
    pub report: QualityReport,
}

impl ValidationResult {
    /// Turn a rejected result into the user-facing rejection payload.
    pub fn to_rejection(&self) -> Rejection {
        Rejection {
            status: Rejection::STATUS,
            detected_type: self.detected_type.clone(),
            error: self
                .error
                .clone()
                .unwrap_or_else(|| "Image is not suitable for screening".to_string()),
            suggestion: self
                .suggestion
                .clone()
                .unwrap_or_else(|| "Please upload a clear retinal fundus photograph".to_string()),
            warnings: self.warnings.clone(),
        }
    }
}

/// A check that did not pass its hard limit.
#[derive(Debug)]
struct Failure {
    detected_type: &'static str,
    error: String,
    suggestion: &'static str,
}

#[derive(Clone, Debug)]
pub struct FundusValidator {
    assessor: QualityAssessor,
    thresholds: ValidationThresholds,
    edge_estimator: EdgeDensityEstimator,
}

impl Default for FundusValidator {
    fn default() -> Self {
        Self::new(
            QualityThresholds::default(),
            ValidationThresholds::default(),
            EdgeDensityEstimator::default(),
        )
    }
}

impl FundusValidator {
    pub fn new(
        quality: QualityThresholds,
        thresholds: ValidationThresholds,
        edge_estimator: EdgeDensityEstimator,
    ) -> Self {
        Self {
            assessor: QualityAssessor::new(quality),
            thresholds,
            edge_estimator,
        }
    }

    pub fn edge_estimator(&self) -> EdgeDensityEstimator {
        self.edge_estimator
    }

    pub fn validate(&self, img: &DynamicImage, allow_low_quality: bool) -> ValidationResult {
        let m = ImageMeasurements::from_image(img);
        let report = self.assessor.assess_measurements(&m);
        self.validate_measured(&m, report, allow_low_quality)
    }

    /// Validate with a precomputed quality report.
    pub fn validate_measured(
        &self,
        m: &ImageMeasurements,
        report: QualityReport,
        allow_low_quality: bool,
    ) -> ValidationResult {
        let t = &self.thresholds;
        let measurements = self.measure(m);
        let mut warnings: Vec<String> = Vec::new();

        if m.width < t.min_dimension || m.height < t.min_dimension {
            let failure = Failure {
                detected_type: EXTREMELY_LOW_RESOLUTION,
                error: format!(
                    "Image resolution {}x{} is too low for analysis (minimum {}x{})",
                    m.width, m.height, t.min_dimension, t.min_dimension
                ),
                suggestion: "Capture or upload a higher-resolution fundus photograph",
            };
            return rejected(failure, warnings, allow_low_quality, measurements, report);
        }

        let mut softened = false;
        for check in self.checks(&measurements) {
            match check {
                Ok(Some(warning)) => warnings.push(warning),
                Ok(None) => {}
                Err(failure) if allow_low_quality => {
                    log::debug!("Lenient pass softened {}", failure.detected_type);
                    softened = true;
                    warnings.push(failure.error);
                }
                Err(failure) => {
                    return rejected(failure, warnings, allow_low_quality, measurements, report);
                }
            }
        }

        let base = self.base_confidence(&measurements);
        let confidence =
            (base * (t.quality_floor + (1.0 - t.quality_floor) * report.composite_score))
                .min(t.confidence_cap);
        warnings.extend(report.warnings.iter().cloned());

        let detected_type = if softened { POSSIBLE_FUNDUS_IMAGE } else { FUNDUS_IMAGE };
        log::debug!(
            "Validation passed ({detected_type}): base={base:.2} adjusted={confidence:.3} dark={:.2} bright={:.2} edges={:.2}",
            measurements.dark_ratio,
            measurements.bright_ratio,
            measurements.edge_density
        );

        ValidationResult {
            is_valid: true,
            confidence,
            detected_type: detected_type.to_string(),
            quality: report.overall_quality,
            warnings,
            error: None,
            suggestion: None,
            lenient: allow_low_quality,
            measurements,
            report,
        }
    }

    fn measure(&self, m: &ImageMeasurements) -> FundusMeasurements {
        let t = &self.thresholds;
        let total = m.luma.len().max(1) as f32;
        let dark = m.luma.iter().filter(|&&v| v < t.dark_intensity as f32).count();
        let bright = m.luma.iter().filter(|&&v| v > t.bright_intensity as f32).count();
        let (center_brightness, border_brightness) = center_and_border_means(m);

        FundusMeasurements {
            aspect_ratio: m.width as f32 / m.height.max(1) as f32,
            dark_ratio: dark as f32 / total,
            bright_ratio: bright as f32 / total,
            red_dominance: m.red_dominance(),
            edge_density: self.edge_estimator.density(&m.luma, m.width, m.height),
            center_brightness,
            border_brightness,
        }
    }

    /// Ordered checks after the size gate. `Ok(Some)` is a soft warning.
    fn checks(&self, fm: &FundusMeasurements) -> Vec<Result<Option<String>, Failure>> {
        let t = &self.thresholds;
        let outside = |v: f32, (lo, hi): (f32, f32)| v < lo || v > hi;
        let mut out = Vec::with_capacity(5);

        out.push(if outside(fm.aspect_ratio, t.aspect_hard) {
            Err(Failure {
                detected_type: INVALID_ASPECT_RATIO,
                error: format!(
                    "Aspect ratio {:.2} is implausible for a fundus photograph",
                    fm.aspect_ratio
                ),
                suggestion: "Upload the full, uncropped fundus photograph",
            })
        } else if outside(fm.aspect_ratio, t.aspect_soft) {
            Ok(Some(format!("Unusual aspect ratio ({:.2})", fm.aspect_ratio)))
        } else {
            Ok(None)
        });

        out.push(if fm.dark_ratio < t.dark_ratio_hard_min {
            Err(Failure {
                detected_type: MISSING_DARK_BACKGROUND,
                error: "Image lacks the dark surround typical of fundus photographs".to_string(),
                suggestion: "Make sure the image was taken with a fundus camera",
            })
        } else if fm.dark_ratio < t.dark_ratio_soft_min {
            Ok(Some("Little dark background around the retina".to_string()))
        } else {
            Ok(None)
        });

        out.push(if outside(fm.bright_ratio, t.bright_ratio_hard) {
            Err(Failure {
                detected_type: ABNORMAL_BRIGHTNESS_DISTRIBUTION,
                error: format!(
                    "Abnormal brightness distribution ({:.1}% bright pixels)",
                    fm.bright_ratio * 100.0
                ),
                suggestion: "Retake the photograph with even illumination",
            })
        } else if outside(fm.bright_ratio, t.bright_ratio_soft) {
            Ok(Some("Uneven brightness distribution".to_string()))
        } else {
            Ok(None)
        });

        if let Some(red) = fm.red_dominance {
            out.push(if red < t.red_dominance_hard_min {
                Err(Failure {
                    detected_type: INSUFFICIENT_RED_CHANNEL,
                    error: format!("Red channel too weak for a retinal image (ratio {red:.2})"),
                    suggestion: "Upload a color fundus photograph",
                })
            } else if red < t.red_dominance_soft_min {
                Ok(Some("Weak red tones for a retinal image".to_string()))
            } else {
                Ok(None)
            });
        }

        out.push(if fm.edge_density > t.edge_density_hard_max {
            Err(Failure {
                detected_type: EXCESSIVE_EDGE_DENSITY,
                error: "Image is dominated by fine texture or text".to_string(),
                suggestion: "Upload a photograph of the retina rather than a document or screenshot",
            })
        } else if fm.edge_density > t.edge_density_soft_max {
            Ok(Some("High amount of fine texture for a fundus image".to_string()))
        } else {
            Ok(None)
        });

        out
    }

    fn base_confidence(&self, fm: &FundusMeasurements) -> f32 {
        let t = &self.thresholds;
        let within = |v: f32, (lo, hi): (f32, f32)| v >= lo && v <= hi;

        let mut confidence = t.base_confidence;
        if within(fm.dark_ratio, t.dark_ratio_bonus_band) {
            confidence += t.dark_ratio_bonus;
        }
        // A dark frame satisfies the ratio trivially; the center has to be lit.
        if fm.center_brightness > 0.0
            && fm.center_brightness >= t.center_border_ratio * fm.border_brightness
        {
            confidence += t.center_bonus;
        }
        if fm.red_dominance.is_some_and(|r| within(r, t.red_dominance_bonus_band)) {
            confidence += t.red_dominance_bonus;
        }
        confidence.min(t.confidence_cap)
    }
}

fn rejected(
    failure: Failure,
    warnings: Vec<String>,
    lenient: bool,
    measurements: FundusMeasurements,
    report: QualityReport,
) -> ValidationResult {
    log::debug!(
        "Validation rejected ({}, lenient={lenient}): {}",
        failure.detected_type,
        failure.error
    );
    ValidationResult {
        is_valid: false,
        confidence: 0.0,
        detected_type: failure.detected_type.to_string(),
        quality: report.overall_quality,
        warnings,
        error: Some(failure.error),
        suggestion: Some(failure.suggestion.to_string()),
        lenient,
        measurements,
        report,
    }
}

/// Mean luma of the middle half (both axes) and of everything around it.
fn center_and_border_means(m: &ImageMeasurements) -> (f32, f32) {
    let (w, h) = (m.width as usize, m.height as usize);
    let (x0, x1) = (w / 4, w / 4 + w / 2);
    let (y0, y1) = (h / 4, h / 4 + h / 2);

    let (mut center_sum, mut center_n) = (0f64, 0usize);
    let (mut border_sum, mut border_n) = (0f64, 0usize);
    for (i, &v) in m.luma.iter().enumerate() {
        let (x, y) = (i % w.max(1), i / w.max(1));
        if (x0..x1).contains(&x) && (y0..y1).contains(&y) {
            center_sum += v as f64;
            center_n += 1;
        } else {
            border_sum += v as f64;
            border_n += 1;
        }
    }
    let avg = |sum: f64, n: usize| if n == 0 { 0.0 } else { (sum / n as f64) as f32 };
    (avg(center_sum, center_n), avg(border_sum, border_n))
}
