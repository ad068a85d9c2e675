//! `fundus validate`: quality and fundus checks only, no classifier.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::class_registry::{ClassRegistry, TaskKind};
use crate::classifier::ModelHandle;
use crate::config::ValidateConfig;
use crate::error::{PipelineError, Rejection};
use crate::fundus_validation::ValidationResult;
use crate::image_input::ImageSource;
use crate::model_processing::{
    load_thresholds, mime_hint, read_image_bytes, run_model_processing, system_info,
    ModelProcessor, ModelResult, ProcessingContext,
};
use crate::pipeline::ScreeningPipeline;
use crate::screen_processing::print_json;

#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum ValidateOutcome {
    Accepted(Box<ValidationResult>),
    Rejected(Rejection),
}

pub struct ValidateResult {
    pub outcome: ValidateOutcome,
    pub processing_time_ms: f64,
}

impl ModelResult for ValidateResult {
    fn processing_time_ms(&self) -> f64 {
        self.processing_time_ms
    }

    fn core_results(&self) -> Result<toml::Value> {
        Ok(match &self.outcome {
            ValidateOutcome::Accepted(v) => toml::Value::try_from(v.as_ref())?,
            ValidateOutcome::Rejected(r) => toml::Value::try_from(r)?,
        })
    }

    fn output_summary(&self) -> String {
        match &self.outcome {
            ValidateOutcome::Accepted(v) => format!(
                "{} (confidence {:.2}, quality {}, {} warning(s))",
                v.detected_type,
                v.confidence,
                v.quality,
                v.warnings.len()
            ),
            ValidateOutcome::Rejected(r) => format!("{} ({}): {}", r.status, r.detected_type, r.error),
        }
    }

    fn is_rejected(&self) -> bool {
        matches!(self.outcome, ValidateOutcome::Rejected(_))
    }
}

pub struct ValidateProcessor;

impl ModelProcessor for ValidateProcessor {
    type Config = ValidateConfig;
    type Result = ValidateResult;

    fn build_context(config: &ValidateConfig) -> Result<ProcessingContext> {
        let thresholds = load_thresholds(&config.base)?;
        // Validation never reaches the classifier
        let handle = ModelHandle::fallback_only(
            ClassRegistry::defaults(TaskKind::default()),
            thresholds.calibration.clone(),
            None,
        );
        let mut system = system_info(&config.base, &handle, None);
        system.model_source = None;
        let pipeline = ScreeningPipeline::new(Arc::new(handle), &thresholds, config.base.edge_estimator);
        Ok(ProcessingContext {
            pipeline,
            system,
            sink: None,
        })
    }

    fn process_single_image(
        ctx: &ProcessingContext,
        image: &ImageSource,
        config: &ValidateConfig,
    ) -> Result<ValidateResult> {
        let start = Instant::now();
        let bytes = read_image_bytes(&image.path)?;
        let outcome = match ctx.pipeline.validate_bytes(&bytes, mime_hint(&image.path)) {
            Ok(result) => ValidateOutcome::Accepted(Box::new(result)),
            Err(PipelineError::Rejected(rejection)) => ValidateOutcome::Rejected(rejection),
            Err(e) => return Err(e.into()),
        };
        if config.print_json {
            print_json(image, &outcome)?;
        }
        Ok(ValidateResult {
            outcome,
            processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }
}

pub fn run_validation(config: ValidateConfig) -> Result<usize> {
    run_model_processing::<ValidateProcessor>(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BaseModelConfig;
    use crate::edge_density::EdgeDensityEstimator;
    use crate::image_input::SourceType;
    use crate::onnx_session::Device;
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    fn config(sources: Vec<String>) -> ValidateConfig {
        ValidateConfig {
            base: BaseModelConfig {
                sources,
                device: Device::Cpu,
                output_dir: None,
                skip_metadata: true,
                strict: true,
                thresholds_path: None,
                edge_estimator: EdgeDensityEstimator::Gradient,
            },
            print_json: false,
        }
    }

    fn source(path: std::path::PathBuf) -> ImageSource {
        ImageSource {
            source: path.to_string_lossy().to_string(),
            path,
            source_type: SourceType::File,
        }
    }

    #[test]
    fn test_context_never_loads_a_model() {
        let ctx = ValidateProcessor::build_context(&config(vec![])).unwrap();
        assert!(ctx.pipeline.model().is_fallback_only());
        assert!(ctx.system.model_source.is_none());
        assert!(ctx.sink.is_none());
    }

    #[test]
    fn test_small_image_is_a_rejected_outcome() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("thumb.png");
        RgbImage::from_pixel(30, 30, Rgb([150, 60, 40])).save(&path).unwrap();

        let config = config(vec![]);
        let ctx = ValidateProcessor::build_context(&config).unwrap();
        let result = ValidateProcessor::process_single_image(&ctx, &source(path), &config).unwrap();
        assert!(result.is_rejected());
        assert!(result.output_summary().starts_with("unsuitable (extremely_low_resolution)"));
        let core = result.core_results().unwrap();
        assert_eq!(core["detected_type"].as_str(), Some("extremely_low_resolution"));
    }

    #[test]
    fn test_unreadable_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not a png").unwrap();

        let config = config(vec![]);
        let ctx = ValidateProcessor::build_context(&config).unwrap();
        assert!(ValidateProcessor::process_single_image(&ctx, &source(path), &config).is_err());
    }
}
