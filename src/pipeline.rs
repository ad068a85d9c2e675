//! End-to-end screening: decode, validate, preprocess, classify, calibrate.
//!
//! Every exit of [`ScreeningPipeline::validate_and_classify`] is either a
//! [`Verdict`] or a typed [`PipelineError`]. Model problems never surface
//! here; the [`ModelHandle`] absorbs them into fallback mode.

use crate::attribution::{AttributionExplainer, AttributionMap};
use crate::cache_common::calculate_md5_bytes;
use crate::calibration::{ConfidenceCalibrator, Verdict};
use crate::classifier::ModelHandle;
use crate::edge_density::EdgeDensityEstimator;
use crate::error::{AttributionError, PipelineError};
use crate::fundus_validation::{FundusValidator, ValidationResult};
use crate::narrative::{NarrativeGenerator, TemplateNarrative};
use crate::preprocessing::{ImagePreprocessor, PreprocessOutput, Tensor};
use crate::thresholds::Thresholds;
use cached::{Cached, SizedCache};
use image::{DynamicImage, ImageFormat};
use std::sync::{Arc, Mutex};

/// Everything produced for one accepted image.
#[derive(Clone, Debug)]
pub struct Screening {
    pub verdict: Verdict,
    pub validation: ValidationResult,
    pub preprocessed: PreprocessOutput,
}

pub struct ScreeningPipeline {
    model: Arc<ModelHandle>,
    validator: FundusValidator,
    preprocessor: ImagePreprocessor,
    calibrator: ConfidenceCalibrator,
    explainer: Option<AttributionExplainer>,
    narrative: Box<dyn NarrativeGenerator>,
    memo: Option<Mutex<SizedCache<String, PreprocessOutput>>>,
}

impl ScreeningPipeline {
    pub fn new(model: Arc<ModelHandle>, thresholds: &Thresholds, edge_estimator: EdgeDensityEstimator) -> Self {
        let input_size = model.registry().input_size;
        Self {
            validator: FundusValidator::new(
                thresholds.quality.clone(),
                thresholds.validation.clone(),
                edge_estimator,
            ),
            preprocessor: ImagePreprocessor::new(input_size, thresholds.preprocess.clone()),
            calibrator: ConfidenceCalibrator::new(thresholds.calibration.clone()),
            explainer: None,
            narrative: Box::new(TemplateNarrative::default()),
            memo: None,
            model,
        }
    }

    pub fn with_explainer(mut self, explainer: AttributionExplainer) -> Self {
        self.explainer = Some(explainer);
        self
    }

    pub fn with_narrative(mut self, narrative: Box<dyn NarrativeGenerator>) -> Self {
        self.narrative = narrative;
        self
    }

    /// Reuse preprocessed tensors for byte-identical inputs, keyed by MD5.
    pub fn with_memoization(mut self, capacity: usize) -> Self {
        self.memo = Some(Mutex::new(SizedCache::with_size(capacity.max(1))));
        self
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn has_explainer(&self) -> bool {
        self.explainer.is_some()
    }

    pub fn validate_and_classify(&self, bytes: &[u8], mime_hint: Option<&str>) -> Result<Verdict, PipelineError> {
        self.screen(bytes, mime_hint).map(|s| s.verdict)
    }

    /// Full pipeline, keeping the intermediate products.
    pub fn screen(&self, bytes: &[u8], mime_hint: Option<&str>) -> Result<Screening, PipelineError> {
        let img = decode_image(bytes, mime_hint)?;
        let validation = self.validate_image(&img)?;
        let preprocessed = self.preprocess(bytes, &img)?;
        let prediction = self.model.predict(&preprocessed.tensor);
        let verdict = self.calibrator.calibrate(&prediction, &validation);
        log::info!(
            "Screened as '{}' ({:.1}% adjusted, {}, {})",
            verdict.predicted_class,
            verdict.adjusted_confidence * 100.0,
            verdict.status,
            verdict.mode.as_str()
        );
        Ok(Screening {
            verdict,
            validation,
            preprocessed,
        })
    }

    /// Decode and validate only.
    pub fn validate_bytes(&self, bytes: &[u8], mime_hint: Option<&str>) -> Result<ValidationResult, PipelineError> {
        let img = decode_image(bytes, mime_hint)?;
        self.validate_image(&img)
    }

    /// Strict pass, then one lenient retry. Only a lenient rejection is terminal.
    pub fn validate_image(&self, img: &DynamicImage) -> Result<ValidationResult, PipelineError> {
        let strict = self.validator.validate(img, false);
        if strict.is_valid {
            return Ok(strict);
        }
        log::debug!(
            "Strict validation rejected ({}), retrying leniently",
            strict.detected_type
        );
        let lenient = self.validator.validate(img, true);
        if lenient.is_valid {
            log::info!(
                "Accepted in lenient mode as {} with {} warning(s)",
                lenient.detected_type,
                lenient.warnings.len()
            );
            Ok(lenient)
        } else {
            log::info!("Rejected as {}", lenient.detected_type);
            Err(PipelineError::Rejected(lenient.to_rejection()))
        }
    }

    fn preprocess(&self, bytes: &[u8], img: &DynamicImage) -> Result<PreprocessOutput, PipelineError> {
        let Some(memo) = &self.memo else {
            return Ok(self.preprocessor.preprocess(img)?);
        };
        let key = calculate_md5_bytes(bytes);
        if let Some(hit) = memo.lock().ok().and_then(|mut m| m.cache_get(&key).cloned()) {
            log::debug!("Reusing preprocessed tensor for {key}");
            return Ok(hit);
        }
        let output = self.preprocessor.preprocess(img)?;
        if let Ok(mut m) = memo.lock() {
            m.cache_set(key, output.clone());
        }
        Ok(output)
    }

    /// Attention map for `class_index`, without narrative.
    pub fn explain(&self, tensor: &Tensor, class_index: usize) -> Result<AttributionMap, AttributionError> {
        let explainer = self
            .explainer
            .as_ref()
            .ok_or_else(|| AttributionError::GradientSource("no explainer model configured".to_string()))?;
        explainer.explain(tensor, class_index)
    }

    /// Attention map for the verdict's class, with narrative sentences.
    pub fn explain_verdict(&self, tensor: &Tensor, verdict: &Verdict) -> Result<AttributionMap, AttributionError> {
        let mut map = self.explain(tensor, verdict.class_index)?;
        map.narrative = self
            .narrative
            .narrate(&map, &verdict.predicted_class, verdict.adjusted_confidence);
        Ok(map)
    }
}

/// Decode with the MIME hint when it names a known format, else sniff.
pub fn decode_image(bytes: &[u8], mime_hint: Option<&str>) -> Result<DynamicImage, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::Decode("empty input".to_string()));
    }
    if let Some(format) = mime_hint.and_then(ImageFormat::from_mime_type) {
        match image::load_from_memory_with_format(bytes, format) {
            Ok(img) => return Ok(img),
            Err(e) => log::debug!("Declared type {format:?} did not decode ({e}), sniffing instead"),
        }
    }
    image::load_from_memory(bytes).map_err(|e| PipelineError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class_registry::{ClassRegistry, TaskKind};
    use crate::thresholds::CalibrationThresholds;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn png(img: RgbImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img).write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn fundus(size: u32) -> RgbImage {
        let c = size as f32 / 2.0;
        RgbImage::from_fn(size, size, |x, y| {
            let (dx, dy) = (x as f32 - c, y as f32 - c);
            let r = (dx * dx + dy * dy).sqrt();
            if r < c * 0.8 {
                let shade = 1.0 - r / c;
                let vessel = if (x / 7 + y / 11) % 5 == 0 { 25.0 } else { 0.0 };
                Rgb([
                    (120.0 + 100.0 * shade - vessel) as u8,
                    (50.0 + 60.0 * shade - vessel) as u8,
                    (30.0 + 30.0 * shade) as u8,
                ])
            } else {
                Rgb([4, 2, 2])
            }
        })
    }

    fn pipeline() -> ScreeningPipeline {
        let handle = ModelHandle::fallback_only(
            ClassRegistry::defaults(TaskKind::Disease),
            CalibrationThresholds::default(),
            Some(1),
        );
        ScreeningPipeline::new(Arc::new(handle), &Thresholds::default(), EdgeDensityEstimator::default())
    }

    #[test]
    fn test_garbage_bytes_are_decode_errors() {
        let err = pipeline().validate_and_classify(b"not an image", Some("image/png")).unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
        let err = pipeline().validate_and_classify(&[], None).unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[test]
    fn test_wrong_mime_hint_still_decodes() {
        let bytes = png(fundus(120));
        assert!(decode_image(&bytes, Some("image/jpeg")).is_ok());
        assert!(decode_image(&bytes, Some("application/octet-stream")).is_ok());
    }

    #[test]
    fn test_memoization_returns_identical_tensor() {
        let p = pipeline().with_memoization(4);
        let bytes = png(fundus(200));
        let a = p.screen(&bytes, None).unwrap();
        let b = p.screen(&bytes, None).unwrap();
        assert_eq!(a.preprocessed.tensor, b.preprocessed.tensor);
    }

    #[test]
    fn test_explain_without_explainer() {
        let p = pipeline();
        let screening = p.screen(&png(fundus(200)), None).unwrap();
        let err = p.explain(&screening.preprocessed.tensor, 0).unwrap_err();
        assert!(matches!(err, AttributionError::GradientSource(_)));
    }
}
