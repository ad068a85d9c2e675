//! Classifier boundary: the [`Predictor`] trait, the ONNX-backed
//! implementation and the [`ModelHandle`] that hides model availability from
//! the pipeline.
//!
//! The served graph is a frozen convolutional backbone with the head
//! `GAP -> Dense(512, relu) -> Dropout -> Dense(256, relu) -> Dropout -> Dense(N)`.
//! It takes an NHWC `(1, H, W, 3)` float tensor in [0, 1] and returns either N
//! class scores or a single spherical-equivalent value.

use crate::class_registry::{ClassRegistry, TaskKind};
use crate::color_utils::symbols;
use crate::error::ClassifierError;
use crate::fallback::FallbackPredictor;
use crate::model_access::{CliModelInfo, ModelAccess, ModelCacheStats, TaskModelAccess};
use crate::onnx_session::{create_onnx_session, Device, OnnxModelInfo};
use crate::preprocessing::Tensor;
use crate::thresholds::CalibrationThresholds;
use ort::{session::Session, value::Value};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;

/// Refraction outputs are clipped to this many diopters either side of zero
pub const REFRACTION_LIMIT_DIOPTERS: f32 = 10.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionMode {
    Model,
    Fallback,
}

impl PredictionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionMode::Model => "model",
            PredictionMode::Fallback => "fallback",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClassProbability {
    pub class_name: String,
    pub probability: f32,
}

/// Probabilities in registry order.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ClassProbabilities(Vec<ClassProbability>);

impl ClassProbabilities {
    pub fn new(class_names: &[String], probabilities: Vec<f32>) -> Result<Self, ClassifierError> {
        if class_names.len() != probabilities.len() {
            return Err(ClassifierError::OutputShape {
                expected: class_names.len(),
                actual: probabilities.len(),
            });
        }
        Ok(Self(
            class_names
                .iter()
                .zip(probabilities)
                .map(|(name, probability)| ClassProbability {
                    class_name: name.clone(),
                    probability,
                })
                .collect(),
        ))
    }

    /// Index of the largest probability, first on ties.
    pub fn argmax(&self) -> usize {
        let mut best = 0;
        for (i, entry) in self.0.iter().enumerate() {
            if entry.probability > self.0[best].probability {
                best = i;
            }
        }
        best
    }

    pub fn get(&self, index: usize) -> Option<&ClassProbability> {
        self.0.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassProbability> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Raw classifier output before calibration.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Prediction {
    pub predicted_class: String,
    pub class_index: usize,
    /// Raw model confidence for the predicted class
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probabilities: Option<ClassProbabilities>,
    /// Regression output in diopters, refraction task only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spherical_equivalent: Option<f32>,
    pub mode: PredictionMode,
}

impl Prediction {
    pub fn from_probabilities(probabilities: ClassProbabilities, mode: PredictionMode) -> Self {
        let class_index = probabilities.argmax();
        let (predicted_class, confidence) = probabilities
            .get(class_index)
            .map(|p| (p.class_name.clone(), p.probability))
            .unwrap_or_default();
        Self {
            predicted_class,
            class_index,
            confidence,
            probabilities: Some(probabilities),
            spherical_equivalent: None,
            mode,
        }
    }

    /// Label a spherical equivalent as myopia / normal.
    ///
    /// Confidence grows linearly with the distance from the myopia cut-off
    /// and saturates at `regression_saturation_diopters`.
    pub fn from_refraction(
        spherical_equivalent: f32,
        registry: &ClassRegistry,
        calibration: &CalibrationThresholds,
        mode: PredictionMode,
    ) -> Self {
        let se = spherical_equivalent.clamp(-REFRACTION_LIMIT_DIOPTERS, REFRACTION_LIMIT_DIOPTERS);
        let class_index = if se <= calibration.myopia_diopters { 0 } else { 1 };
        let distance = (se - calibration.myopia_diopters).abs();
        let saturation = calibration.regression_saturation_diopters.max(f32::EPSILON);
        let confidence = 0.5 + 0.5 * (distance / saturation).min(1.0);
        Self {
            predicted_class: registry
                .class_names
                .get(class_index)
                .cloned()
                .unwrap_or_default(),
            class_index,
            confidence,
            probabilities: None,
            spherical_equivalent: Some(se),
            mode,
        }
    }
}

/// Anything that can turn a preprocessed tensor into a prediction.
pub trait Predictor: Send + Sync {
    fn predict(&self, tensor: &Tensor) -> Result<Prediction, ClassifierError>;

    /// Short description for logs and metadata
    fn describe(&self) -> String;
}

pub fn softmax(values: &[f32]) -> Vec<f32> {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = values.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

/// Whether the head already applied softmax.
fn is_distribution(values: &[f32]) -> bool {
    values.iter().all(|v| (0.0..=1.0).contains(v)) && (values.iter().sum::<f32>() - 1.0).abs() < 1e-3
}

/// Map raw graph output onto a prediction for `registry.task`.
pub fn interpret_output(
    registry: &ClassRegistry,
    calibration: &CalibrationThresholds,
    values: &[f32],
) -> Result<Prediction, ClassifierError> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(ClassifierError::Inference(
            "model produced non-finite output".to_string(),
        ));
    }
    if registry.task == TaskKind::Refraction {
        if values.len() != 1 {
            return Err(ClassifierError::OutputShape {
                expected: 1,
                actual: values.len(),
            });
        }
        return Ok(Prediction::from_refraction(
            values[0],
            registry,
            calibration,
            PredictionMode::Model,
        ));
    }

    let probabilities = if is_distribution(values) {
        values.to_vec()
    } else {
        softmax(values)
    };
    let probabilities = ClassProbabilities::new(&registry.class_names, probabilities)?;
    Ok(Prediction::from_probabilities(probabilities, PredictionMode::Model))
}

/// Classifier backed by an ONNX Runtime session.
pub struct OnnxClassifier {
    session: Mutex<Session>,
    registry: ClassRegistry,
    calibration: CalibrationThresholds,
    model_info: OnnxModelInfo,
}

impl OnnxClassifier {
    pub fn new(
        session: Session,
        registry: ClassRegistry,
        calibration: CalibrationThresholds,
        model_info: OnnxModelInfo,
    ) -> Self {
        Self {
            session: Mutex::new(session),
            registry,
            calibration,
            model_info,
        }
    }

    fn run(&self, tensor: &Tensor) -> Result<Vec<f32>, ClassifierError> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| ClassifierError::Inference("session lock poisoned".to_string()))?;

        let input_name = session.inputs[0].name.clone();
        let output_name = session.outputs[0].name.clone();
        let input_value = Value::from_array(tensor.to_batched())
            .map_err(|e| ClassifierError::Inference(format!("Failed to create input value: {e}")))?;
        let outputs = session
            .run(ort::inputs![input_name.as_str() => &input_value])
            .map_err(|e| ClassifierError::Inference(format!("Failed to run inference: {e}")))?;
        let output = outputs[output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| ClassifierError::Inference(format!("Failed to extract output: {e}")))?;
        Ok(output.iter().copied().collect())
    }
}

impl Predictor for OnnxClassifier {
    fn predict(&self, tensor: &Tensor) -> Result<Prediction, ClassifierError> {
        let values = self.run(tensor)?;
        log::debug!("Raw {} output: {values:?}", self.registry.task);
        interpret_output(&self.registry, &self.calibration, &values)
    }

    fn describe(&self) -> String {
        format!(
            "onnx {} ({} on {})",
            self.registry.task,
            &self.model_info.model_checksum[..8.min(self.model_info.model_checksum.len())],
            self.model_info.device
        )
    }
}

/// How to obtain the classifier at startup
#[derive(Debug, Clone, Default)]
pub struct ModelLoadOptions {
    pub cli: CliModelInfo,
    pub device: Device,
    pub download_timeout: Option<Duration>,
    pub fallback_seed: Option<u64>,
}

/// Immutable, shareable bundle of the primary predictor (if any) and the
/// fallback predictor.
pub struct ModelHandle {
    primary: Option<Box<dyn Predictor>>,
    fallback: FallbackPredictor,
    registry: ClassRegistry,
    model_info: Option<OnnxModelInfo>,
    cache_stats: Option<ModelCacheStats>,
}

impl ModelHandle {
    pub fn new(
        primary: Option<Box<dyn Predictor>>,
        fallback: FallbackPredictor,
        registry: ClassRegistry,
    ) -> Self {
        Self {
            primary,
            fallback,
            registry,
            model_info: None,
            cache_stats: None,
        }
    }

    pub fn fallback_only(registry: ClassRegistry, calibration: CalibrationThresholds, seed: Option<u64>) -> Self {
        let fallback = FallbackPredictor::new(registry.clone(), calibration, seed);
        Self::new(None, fallback, registry)
    }

    /// Resolve, fetch and load the classifier. Never fails: any problem
    /// yields a fallback-only handle.
    pub fn load(
        registry: ClassRegistry,
        calibration: CalibrationThresholds,
        options: &ModelLoadOptions,
    ) -> Self {
        let fallback = FallbackPredictor::new(registry.clone(), calibration.clone(), options.fallback_seed);
        let access = TaskModelAccess {
            task: registry.task,
        };
        let timeout = options
            .download_timeout
            .unwrap_or(crate::model_access::DEFAULT_DOWNLOAD_TIMEOUT);

        let loaded = access
            .model_source_with_cli(&options.cli, timeout)
            .and_then(|(source, stats)| {
                let (session, info) = create_onnx_session(source, options.device)?;
                Ok((session, info, stats))
            });

        match loaded {
            Ok((session, info, stats)) => {
                log::info!(
                    "{} Loaded {} classifier ({:.1} MB, {})",
                    symbols::model_loaded(),
                    registry.task,
                    info.model_size_bytes as f64 / (1024.0 * 1024.0),
                    info.execution_providers.join(" -> ")
                );
                let classifier =
                    OnnxClassifier::new(session, registry.clone(), calibration, info.clone());
                Self {
                    primary: Some(Box::new(classifier)),
                    fallback,
                    registry,
                    model_info: Some(info),
                    cache_stats: stats,
                }
            }
            Err(e) => {
                log::warn!(
                    "{} {} classifier unavailable, running in fallback mode: {e:#}",
                    symbols::fallback_mode(),
                    registry.task
                );
                Self::new(None, fallback, registry)
            }
        }
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    pub fn is_fallback_only(&self) -> bool {
        self.primary.is_none()
    }

    pub fn model_info(&self) -> Option<&OnnxModelInfo> {
        self.model_info.as_ref()
    }

    pub fn cache_stats(&self) -> Option<&ModelCacheStats> {
        self.cache_stats.as_ref()
    }

    pub fn describe(&self) -> String {
        match &self.primary {
            Some(p) => p.describe(),
            None => self.fallback.describe(),
        }
    }

    /// Always produces a prediction; primary failures degrade to fallback.
    pub fn predict(&self, tensor: &Tensor) -> Prediction {
        if let Some(primary) = &self.primary {
            match primary.predict(tensor) {
                Ok(prediction) => return prediction,
                Err(e) => log::warn!(
                    "{} Inference failed, using fallback prediction: {e}",
                    symbols::fallback_mode()
                ),
            }
        }
        self.fallback.draw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingPredictor {
        calls: AtomicUsize,
    }

    impl Predictor for FailingPredictor {
        fn predict(&self, _tensor: &Tensor) -> Result<Prediction, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ClassifierError::Inference("boom".to_string()))
        }

        fn describe(&self) -> String {
            "failing".to_string()
        }
    }

    fn tensor() -> Tensor {
        Tensor::new(Array3::zeros((8, 8, 3))).unwrap()
    }

    #[test]
    fn test_softmax_applied_to_logits() {
        let registry = ClassRegistry::defaults(TaskKind::Disease);
        let p = interpret_output(&registry, &CalibrationThresholds::default(), &[1.0, 3.0, 0.5, 2.0]).unwrap();
        assert_eq!(p.predicted_class, "diabetic_retinopathy");
        let probs = p.probabilities.unwrap();
        let sum: f32 = probs.iter().map(|c| c.probability).sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert_eq!(probs.len(), 4);
    }

    #[test]
    fn test_distribution_passed_through() {
        let registry = ClassRegistry::defaults(TaskKind::Myopia);
        let p = interpret_output(&registry, &CalibrationThresholds::default(), &[0.3, 0.7]).unwrap();
        assert_eq!(p.predicted_class, "normal");
        assert!((p.confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_wrong_cardinality_is_output_shape_error() {
        let registry = ClassRegistry::defaults(TaskKind::Disease);
        let err = interpret_output(&registry, &CalibrationThresholds::default(), &[0.5, 0.5]).unwrap_err();
        assert!(matches!(err, ClassifierError::OutputShape { expected: 4, actual: 2 }));
    }

    #[test]
    fn test_argmax_first_on_ties() {
        let names: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let probs = ClassProbabilities::new(&names, vec![0.4, 0.4, 0.2]).unwrap();
        assert_eq!(probs.argmax(), 0);
    }

    #[test]
    fn test_refraction_is_clipped_and_labelled() {
        let registry = ClassRegistry::defaults(TaskKind::Refraction);
        let calibration = CalibrationThresholds::default();

        let p = interpret_output(&registry, &calibration, &[-14.0]).unwrap();
        assert_eq!(p.spherical_equivalent, Some(-10.0));
        assert_eq!(p.predicted_class, "myopia");
        assert_eq!(p.confidence, 1.0);

        let p = interpret_output(&registry, &calibration, &[-0.5]).unwrap();
        assert_eq!(p.predicted_class, "myopia");
        assert_eq!(p.confidence, 0.5);

        let p = interpret_output(&registry, &calibration, &[0.5]).unwrap();
        assert_eq!(p.predicted_class, "normal");
        assert!((p.confidence - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_handle_absorbs_inference_errors() {
        let registry = ClassRegistry::defaults(TaskKind::Disease);
        let fallback = FallbackPredictor::new(registry.clone(), CalibrationThresholds::default(), Some(7));
        let failing = FailingPredictor {
            calls: AtomicUsize::new(0),
        };
        let handle = ModelHandle::new(Some(Box::new(failing)), fallback, registry.clone());

        let prediction = handle.predict(&tensor());
        assert_eq!(prediction.mode, PredictionMode::Fallback);
        assert!(registry.index_of(&prediction.predicted_class).is_some());
        assert!(!handle.is_fallback_only());
    }

    #[test]
    fn test_fallback_only_handle() {
        let handle = ModelHandle::fallback_only(
            ClassRegistry::defaults(TaskKind::Myopia),
            CalibrationThresholds::default(),
            Some(1),
        );
        assert!(handle.is_fallback_only());
        assert_eq!(handle.predict(&tensor()).mode, PredictionMode::Fallback);
    }
}
