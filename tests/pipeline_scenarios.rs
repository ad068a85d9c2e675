mod common;

use common::{gray_card, png_bytes, synthetic_fundus};
use fundus_screen::attribution::{AttributionExplainer, FeatureGradients, GradientSource};
use fundus_screen::class_registry::{ClassRegistry, TaskKind};
use fundus_screen::classifier::{
    ClassProbabilities, ModelHandle, Prediction, PredictionMode, Predictor,
};
use fundus_screen::edge_density::EdgeDensityEstimator;
use fundus_screen::error::{AttributionError, ClassifierError};
use fundus_screen::fallback::FallbackPredictor;
use fundus_screen::preprocessing::Tensor;
use fundus_screen::quality_assessment::OverallQuality;
use fundus_screen::thresholds::{CalibrationThresholds, Thresholds};
use fundus_screen::{PipelineError, ScreeningPipeline, VerdictStatus};
use image::{DynamicImage, RgbImage};
use ndarray::Array3;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Always answers with fixed probabilities and counts its calls.
struct FixedPredictor {
    registry: ClassRegistry,
    probabilities: Vec<f32>,
    calls: Arc<AtomicUsize>,
}

impl Predictor for FixedPredictor {
    fn predict(&self, _tensor: &Tensor) -> Result<Prediction, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let probs = ClassProbabilities::new(&self.registry.class_names, self.probabilities.clone())?;
        Ok(Prediction::from_probabilities(probs, PredictionMode::Model))
    }

    fn describe(&self) -> String {
        "fixed".to_string()
    }
}

fn fallback_pipeline(seed: u64) -> ScreeningPipeline {
    let handle = ModelHandle::fallback_only(
        ClassRegistry::defaults(TaskKind::Disease),
        CalibrationThresholds::default(),
        Some(seed),
    );
    ScreeningPipeline::new(Arc::new(handle), &Thresholds::default(), EdgeDensityEstimator::Gradient)
}

fn model_pipeline(probabilities: Vec<f32>) -> (ScreeningPipeline, Arc<AtomicUsize>) {
    let registry = ClassRegistry::defaults(TaskKind::Disease);
    let calls = Arc::new(AtomicUsize::new(0));
    let predictor = FixedPredictor {
        registry: registry.clone(),
        probabilities,
        calls: calls.clone(),
    };
    let fallback = FallbackPredictor::new(registry.clone(), CalibrationThresholds::default(), Some(0));
    let handle = ModelHandle::new(Some(Box::new(predictor)), fallback, registry);
    let pipeline = ScreeningPipeline::new(Arc::new(handle), &Thresholds::default(), EdgeDensityEstimator::Gradient);
    (pipeline, calls)
}

#[test]
fn tiny_image_is_rejected_before_classification() {
    let (pipeline, calls) = model_pipeline(vec![0.1, 0.1, 0.1, 0.7]);
    let bytes = png_bytes(&synthetic_fundus(40));

    match pipeline.validate_and_classify(&bytes, Some("image/png")) {
        Err(PipelineError::Rejected(rejection)) => {
            assert_eq!(rejection.status, "unsuitable");
            assert_eq!(rejection.detected_type, "extremely_low_resolution");
            assert!(!rejection.error.is_empty());
            assert!(!rejection.suggestion.is_empty());
        }
        other => panic!("expected a rejection, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0, "classifier must not run on rejected images");
}

#[test]
fn well_exposed_fundus_is_valid() {
    let pipeline = fallback_pipeline(3);
    let validation = pipeline
        .validate_bytes(&png_bytes(&synthetic_fundus(300)), Some("image/png"))
        .unwrap();

    assert!(validation.is_valid);
    assert_eq!(validation.detected_type, "fundus_image");
    assert!(!validation.lenient);
    assert!(matches!(validation.quality, OverallQuality::Medium | OverallQuality::High));
    assert!(validation.confidence > 0.0 && validation.confidence <= 0.95);
}

#[test]
fn missing_model_yields_fallback_verdict_from_registry() {
    let pipeline = fallback_pipeline(11);
    let verdict = pipeline
        .validate_and_classify(&png_bytes(&synthetic_fundus(300)), None)
        .unwrap();

    let registry = ClassRegistry::defaults(TaskKind::Disease);
    assert_eq!(verdict.mode, PredictionMode::Fallback);
    assert!(registry.index_of(&verdict.predicted_class).is_some());
    assert_eq!(registry.class_names[verdict.class_index], verdict.predicted_class);
    assert!((0.55..=0.85).contains(&verdict.raw_confidence));
    assert!(verdict.message.contains("placeholder"));
}

#[test]
fn same_seed_gives_same_fallback_verdict() {
    let bytes = png_bytes(&synthetic_fundus(256));
    let a = fallback_pipeline(42).validate_and_classify(&bytes, None).unwrap();
    let b = fallback_pipeline(42).validate_and_classify(&bytes, None).unwrap();
    assert_eq!(a.predicted_class, b.predicted_class);
    assert_eq!(a.raw_confidence, b.raw_confidence);
}

#[test]
fn model_prediction_is_dampened_by_validation_confidence() {
    let (pipeline, calls) = model_pipeline(vec![0.05, 0.05, 0.05, 0.85]);
    let verdict = pipeline
        .validate_and_classify(&png_bytes(&synthetic_fundus(300)), Some("image/png"))
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(verdict.mode, PredictionMode::Model);
    assert_eq!(verdict.predicted_class, "normal");
    assert!((verdict.raw_confidence - 0.85).abs() < 1e-6);
    assert!(verdict.adjusted_confidence <= verdict.raw_confidence);
    let expected = verdict.raw_confidence * verdict.validation_confidence;
    assert!((verdict.adjusted_confidence - expected).abs() < 1e-5);
    assert_eq!(verdict.status, VerdictStatus::Success);
}

#[test]
fn top_class_is_reported_even_at_low_confidence() {
    let (pipeline, _) = model_pipeline(vec![0.26, 0.25, 0.25, 0.24]);
    let verdict = pipeline
        .validate_and_classify(&png_bytes(&synthetic_fundus(300)), None)
        .unwrap();
    assert_eq!(verdict.predicted_class, "cataract");
    assert_eq!(verdict.status, VerdictStatus::LowConfidence);
}

#[test]
fn very_low_quality_overrides_a_confident_prediction() {
    let pipeline = fallback_pipeline(0);
    let img = DynamicImage::ImageRgb8(synthetic_fundus(300));
    let mut validation = pipeline.validate_image(&img).unwrap();
    validation.quality = OverallQuality::VeryLow;

    let registry = ClassRegistry::defaults(TaskKind::Disease);
    let probs = ClassProbabilities::new(&registry.class_names, vec![0.9, 0.03, 0.03, 0.04]).unwrap();
    let prediction = Prediction::from_probabilities(probs, PredictionMode::Model);
    let verdict = fundus_screen::calibration::ConfidenceCalibrator::new(CalibrationThresholds::default())
        .calibrate(&prediction, &validation);

    assert_eq!(verdict.status, VerdictStatus::VeryLowQuality);
    assert_eq!(verdict.predicted_class, "cataract");
    assert!(verdict.message.to_lowercase().contains("very low"));
}

#[test]
fn gray_card_is_only_accepted_leniently() {
    let pipeline = fallback_pipeline(0);
    let validation = pipeline
        .validate_bytes(&png_bytes(&gray_card(256)), None)
        .unwrap();
    assert!(validation.lenient);
    assert_eq!(validation.detected_type, "possible_fundus_image");
    assert!(!validation.warnings.is_empty());
}

#[test]
fn undecodable_input_is_an_error_not_a_rejection() {
    let pipeline = fallback_pipeline(0);
    let err = pipeline.validate_and_classify(b"\x89PNG truncated", Some("image/png")).unwrap_err();
    assert!(matches!(err, PipelineError::Decode(_)));
}

#[test]
fn validation_is_idempotent() {
    let pipeline = fallback_pipeline(0);
    let bytes = png_bytes(&synthetic_fundus(280));
    let a = pipeline.validate_bytes(&bytes, None).unwrap();
    let b = pipeline.validate_bytes(&bytes, None).unwrap();
    assert_eq!(a.confidence, b.confidence);
    assert_eq!(a.quality, b.quality);
    assert_eq!(a.warnings, b.warnings);
}

#[test]
fn preprocessing_is_deterministic_and_sized_for_the_model() {
    let pipeline = fallback_pipeline(0);
    let bytes = png_bytes(&synthetic_fundus(333));
    let a = pipeline.screen(&bytes, None).unwrap();
    let b = pipeline.screen(&bytes, None).unwrap();

    assert_eq!(a.preprocessed.tensor.height(), 224);
    assert_eq!(a.preprocessed.tensor.width(), 224);
    assert_eq!(a.preprocessed.tensor, b.preprocessed.tensor);
    assert!(a
        .preprocessed
        .tensor
        .view()
        .iter()
        .all(|v| (0.0..=1.0).contains(v)));
}

#[test]
fn non_square_input_keeps_the_model_input_size() {
    let pipeline = fallback_pipeline(0);
    let wide = RgbImage::from_fn(400, 300, |x, y| {
        let (dx, dy) = (x as f32 - 200.0, y as f32 - 150.0);
        if (dx * dx + dy * dy).sqrt() < 135.0 {
            image::Rgb([190, 90, 60])
        } else {
            image::Rgb([5, 3, 3])
        }
    });
    let screening = pipeline.screen(&png_bytes(&wide), None).unwrap();
    assert_eq!(screening.preprocessed.tensor.height(), 224);
    assert_eq!(screening.preprocessed.tensor.width(), 224);
}

/// Gradient source whose features light up the upper-left corner.
struct CornerSource;

impl GradientSource for CornerSource {
    fn feature_gradients(&self, _tensor: &Tensor, class_index: usize) -> Result<FeatureGradients, AttributionError> {
        if class_index >= 4 {
            return Err(AttributionError::ClassIndex { index: class_index, classes: 4 });
        }
        let features = Array3::from_shape_fn((7, 7, 2), |(y, x, _)| if y < 3 && x < 3 { 1.0 } else { 0.0 });
        let gradients = Array3::from_elem((7, 7, 2), 0.5);
        Ok(FeatureGradients { features, gradients })
    }
}

#[test]
fn explanation_points_at_the_attended_quadrant() {
    let pipeline = fallback_pipeline(5).with_explainer(AttributionExplainer::new(Box::new(CornerSource), 4));
    assert!(pipeline.has_explainer());

    let screening = pipeline.screen(&png_bytes(&synthetic_fundus(300)), None).unwrap();
    let map = pipeline
        .explain_verdict(&screening.preprocessed.tensor, &screening.verdict)
        .unwrap();

    assert_eq!(map.class_index, screening.verdict.class_index);
    assert_eq!(map.dominant_quadrant.as_str(), "upper_left");
    assert!(map.center_of_attention.0 < 0.5 && map.center_of_attention.1 < 0.5);
    assert!(map.coverage_percentage > 0.0 && map.coverage_percentage <= 100.0);
    assert!(map.heatmap.iter().all(|v| (0.0..=1.0).contains(v)));
    assert!(!map.narrative.is_empty());
}
