//! Typed errors at the library boundary.
//!
//! Infrastructure code (model download, session creation, metadata files) keeps
//! using `anyhow`. The screening pipeline itself only ever returns a
//! [`PipelineError`]; classifier failures never reach the caller because they
//! are absorbed into fallback mode.

use serde::Serialize;
use thiserror::Error;

/// Terminal outcome of the pipeline when the image cannot be screened.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Unreadable or corrupt bytes. Fatal for the request, no fallback.
    #[error("Unable to decode image: {0}")]
    Decode(String),

    /// Pixel layout the preprocessor cannot normalize to RGB.
    #[error("Unsupported pixel format: {channels} channel(s)")]
    UnsupportedFormat { channels: u8 },

    /// The image failed fundus validation even in lenient mode.
    #[error("Image rejected ({}): {}", .0.detected_type, .0.error)]
    Rejected(Rejection),
}

/// User-facing rejection, serialized as the `unsuitable` response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub status: &'static str,
    pub detected_type: String,
    pub error: String,
    pub suggestion: String,
    pub warnings: Vec<String>,
}

impl Rejection {
    pub const STATUS: &'static str = "unsuitable";
}

/// Failures inside the image preprocessor.
#[derive(Debug, Error, PartialEq)]
pub enum PreprocessError {
    #[error("Unsupported pixel format: {channels} channel(s)")]
    UnsupportedFormat { channels: u8 },

    #[error("Pixel buffer has {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },

    #[error("Image has zero width or height")]
    EmptyImage,
}

impl From<PreprocessError> for PipelineError {
    fn from(err: PreprocessError) -> Self {
        match err {
            PreprocessError::UnsupportedFormat { channels } => {
                PipelineError::UnsupportedFormat { channels }
            }
            other => PipelineError::Decode(other.to_string()),
        }
    }
}

/// Failures of a [`crate::classifier::Predictor`].
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Model produced {actual} output value(s), expected {expected}")]
    OutputShape { expected: usize, actual: usize },
}

/// Failures of the attribution explainer.
#[derive(Debug, Error)]
pub enum AttributionError {
    #[error("Gradient source failed: {0}")]
    GradientSource(String),

    #[error("Class index {index} out of range for {classes} class(es)")]
    ClassIndex { index: usize, classes: usize },

    #[error("Feature maps {features:?} and gradients {gradients:?} differ in shape")]
    ShapeMismatch {
        features: (usize, usize, usize),
        gradients: (usize, usize, usize),
    },

    #[error("Feature map is empty")]
    EmptyFeatureMap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_format_maps_through() {
        let err: PipelineError = PreprocessError::UnsupportedFormat { channels: 5 }.into();
        assert!(matches!(err, PipelineError::UnsupportedFormat { channels: 5 }));
    }

    #[test]
    fn test_rejection_display() {
        let err = PipelineError::Rejected(Rejection {
            status: Rejection::STATUS,
            detected_type: "extremely_low_resolution".to_string(),
            error: "too small".to_string(),
            suggestion: "retake".to_string(),
            warnings: vec![],
        });
        assert_eq!(
            err.to_string(),
            "Image rejected (extremely_low_resolution): too small"
        );
    }
}
