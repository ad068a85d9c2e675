//! Fuses model confidence with image quality into the user-facing verdict.
//!
//! Calibration is total: every prediction paired with a valid validation
//! result produces a [`Verdict`]. The predicted class is always reported,
//! even when the status advises caution.

use crate::classifier::{ClassProbabilities, Prediction, PredictionMode};
use crate::fundus_validation::ValidationResult;
use crate::quality_assessment::OverallQuality;
use crate::thresholds::CalibrationThresholds;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Success,
    LowConfidence,
    LowQuality,
    VeryLowQuality,
}

impl VerdictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictStatus::Success => "success",
            VerdictStatus::LowConfidence => "low_confidence",
            VerdictStatus::LowQuality => "low_quality",
            VerdictStatus::VeryLowQuality => "very_low_quality",
        }
    }
}

impl std::fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final screening result for one image.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Verdict {
    pub predicted_class: String,
    pub class_index: usize,
    pub raw_confidence: f32,
    /// Never above `raw_confidence`
    pub adjusted_confidence: f32,
    pub status: VerdictStatus,
    pub message: String,
    pub quality_warnings: Vec<String>,
    pub mode: PredictionMode,
    pub quality: OverallQuality,
    pub validation_confidence: f32,
    pub detected_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probabilities: Option<ClassProbabilities>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spherical_equivalent: Option<f32>,
}

#[derive(Clone, Debug, Default)]
pub struct ConfidenceCalibrator {
    thresholds: CalibrationThresholds,
}

impl ConfidenceCalibrator {
    pub fn new(thresholds: CalibrationThresholds) -> Self {
        Self { thresholds }
    }

    pub fn calibrate(&self, prediction: &Prediction, validation: &ValidationResult) -> Verdict {
        let raw = prediction.confidence.clamp(0.0, 1.0);
        let adjusted = (raw * validation.confidence).clamp(0.0, raw);
        let class = prediction.predicted_class.as_str();

        let (status, mut message) = match validation.quality {
            OverallQuality::VeryLow => (
                VerdictStatus::VeryLowQuality,
                format!(
                    "Image quality is very low. Interpret the '{class}' result with extreme caution and retake the photograph if possible."
                ),
            ),
            OverallQuality::Low => (
                VerdictStatus::LowQuality,
                format!(
                    "Image quality is low, so the '{class}' result may be unreliable. A clearer photograph is recommended."
                ),
            ),
            _ if adjusted < self.thresholds.low_confidence => (
                VerdictStatus::LowConfidence,
                format!(
                    "Low confidence in the '{class}' result. Please confirm with an eye-care professional."
                ),
            ),
            quality => {
                let mut message = format!("Screening suggests '{class}'.");
                if quality == OverallQuality::Medium {
                    message.push_str(" Image quality is moderate.");
                }
                if !validation.warnings.is_empty() {
                    message.push_str(" Some image issues were noted, see the warnings.");
                }
                (VerdictStatus::Success, message)
            }
        };
        if prediction.mode == PredictionMode::Fallback {
            message.push_str(" No trained model was available; this result is a placeholder.");
        }

        log::debug!(
            "Calibrated {class}: raw={raw:.3} x validation={:.3} -> {adjusted:.3} ({status})",
            validation.confidence
        );

        Verdict {
            predicted_class: prediction.predicted_class.clone(),
            class_index: prediction.class_index,
            raw_confidence: raw,
            adjusted_confidence: adjusted,
            status,
            message,
            quality_warnings: validation.warnings.clone(),
            mode: prediction.mode,
            quality: validation.quality,
            validation_confidence: validation.confidence,
            detected_type: validation.detected_type.clone(),
            probabilities: prediction.probabilities.clone(),
            spherical_equivalent: prediction.spherical_equivalent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fundus_validation::FundusValidator;
    use image::{DynamicImage, Rgb, RgbImage};

    fn validation(quality: OverallQuality, confidence: f32, warnings: Vec<String>) -> ValidationResult {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(120, 120, |x, y| {
            let (dx, dy) = (x as f32 - 60.0, y as f32 - 60.0);
            if dx * dx + dy * dy < 2500.0 {
                Rgb([160, 80, 80])
            } else {
                Rgb([10, 5, 5])
            }
        }));
        let mut result = FundusValidator::default().validate(&img, true);
        result.quality = quality;
        result.confidence = confidence;
        result.warnings = warnings;
        result
    }

    fn prediction(confidence: f32, mode: PredictionMode) -> Prediction {
        Prediction {
            predicted_class: "glaucoma".to_string(),
            class_index: 2,
            confidence,
            probabilities: None,
            spherical_equivalent: None,
            mode,
        }
    }

    #[test]
    fn test_very_low_quality_dominates() {
        let verdict = ConfidenceCalibrator::default().calibrate(
            &prediction(0.9, PredictionMode::Model),
            &validation(OverallQuality::VeryLow, 0.5, vec![]),
        );
        assert_eq!(verdict.status, VerdictStatus::VeryLowQuality);
        assert!(verdict.message.contains("extreme caution"));
        assert_eq!(verdict.predicted_class, "glaucoma");
        assert!((verdict.adjusted_confidence - 0.45).abs() < 1e-6);
    }

    #[test]
    fn test_status_ladder() {
        let c = ConfidenceCalibrator::default();
        let p = prediction(0.8, PredictionMode::Model);
        assert_eq!(c.calibrate(&p, &validation(OverallQuality::Low, 0.9, vec![])).status, VerdictStatus::LowQuality);
        assert_eq!(c.calibrate(&p, &validation(OverallQuality::High, 0.4, vec![])).status, VerdictStatus::LowConfidence);
        assert_eq!(c.calibrate(&p, &validation(OverallQuality::High, 0.9, vec![])).status, VerdictStatus::Success);
    }

    #[test]
    fn test_success_message_variants() {
        let c = ConfidenceCalibrator::default();
        let p = prediction(0.9, PredictionMode::Model);
        let medium = c.calibrate(&p, &validation(OverallQuality::Medium, 0.9, vec!["Low contrast image".into()]));
        assert_eq!(medium.status, VerdictStatus::Success);
        assert!(medium.message.contains("moderate"));
        assert!(medium.message.contains("warnings"));
        assert_eq!(medium.quality_warnings, vec!["Low contrast image".to_string()]);
    }

    #[test]
    fn test_adjusted_never_exceeds_raw() {
        let c = ConfidenceCalibrator::default();
        let qualities = [
            OverallQuality::VeryLow,
            OverallQuality::Low,
            OverallQuality::Medium,
            OverallQuality::High,
        ];
        for quality in qualities {
            for raw in [0.0, 0.1, 0.5, 0.99, 1.0] {
                for v in [0.0, 0.3, 0.95, 1.0] {
                    let verdict = c.calibrate(
                        &prediction(raw, PredictionMode::Model),
                        &validation(quality, v, vec![]),
                    );
                    assert!(
                        verdict.adjusted_confidence <= verdict.raw_confidence,
                        "{quality:?} raw={raw} validation={v}"
                    );
                    assert!(!verdict.predicted_class.is_empty(), "{:?}", verdict.status);
                }
            }
        }
    }

    #[test]
    fn test_fallback_is_flagged_in_message() {
        let verdict = ConfidenceCalibrator::default().calibrate(
            &prediction(0.7, PredictionMode::Fallback),
            &validation(OverallQuality::High, 0.9, vec![]),
        );
        assert_eq!(verdict.mode, PredictionMode::Fallback);
        assert!(verdict.message.contains("placeholder"));
    }
}
