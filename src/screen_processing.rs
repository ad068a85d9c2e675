//! `fundus screen`: validate, classify and calibrate each image.

use anyhow::Result;
use serde::Serialize;
use std::time::Instant;

use crate::calibration::Verdict;
use crate::color_utils::symbols;
use crate::config::ScreenConfig;
use crate::error::{PipelineError, Rejection};
use crate::image_input::ImageSource;
use crate::model_processing::{
    build_screening_pipeline, mime_hint, read_image_bytes, run_model_processing, ModelProcessor,
    ModelResult, ProcessingContext,
};
use crate::sink::{JsonLinesSink, VerdictSink};

/// A verdict, or the reason the image could not be screened
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum ScreenOutcome {
    Verdict(Verdict),
    Rejected(Rejection),
}

impl ScreenOutcome {
    /// Rejections are outcomes; decode and format errors stay errors
    pub fn from_pipeline(result: Result<Verdict, PipelineError>) -> Result<Self> {
        match result {
            Ok(verdict) => Ok(ScreenOutcome::Verdict(verdict)),
            Err(PipelineError::Rejected(rejection)) => Ok(ScreenOutcome::Rejected(rejection)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn summary(&self) -> String {
        match self {
            ScreenOutcome::Verdict(v) => format!(
                "{} {:.1}% ({}, {})",
                v.predicted_class,
                v.adjusted_confidence * 100.0,
                v.status,
                v.mode.as_str()
            ),
            ScreenOutcome::Rejected(r) => format!("{} ({})", r.status, r.detected_type),
        }
    }

    pub fn core_results(&self) -> Result<toml::Value> {
        Ok(match self {
            ScreenOutcome::Verdict(v) => toml::Value::try_from(v)?,
            ScreenOutcome::Rejected(r) => toml::Value::try_from(r)?,
        })
    }
}

#[derive(Serialize)]
struct JsonLine<'a, T: Serialize> {
    image: String,
    #[serde(flatten)]
    result: &'a T,
}

/// Print one result as a JSON line on stdout
pub fn print_json<T: Serialize>(image: &ImageSource, result: &T) -> Result<()> {
    let line = JsonLine {
        image: image.path.to_string_lossy().to_string(),
        result,
    };
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

pub struct ScreenResult {
    pub outcome: ScreenOutcome,
    pub processing_time_ms: f64,
}

impl ModelResult for ScreenResult {
    fn processing_time_ms(&self) -> f64 {
        self.processing_time_ms
    }

    fn core_results(&self) -> Result<toml::Value> {
        self.outcome.core_results()
    }

    fn output_summary(&self) -> String {
        self.outcome.summary()
    }

    fn is_rejected(&self) -> bool {
        matches!(self.outcome, ScreenOutcome::Rejected(_))
    }
}

pub struct ScreenProcessor;

impl ModelProcessor for ScreenProcessor {
    type Config = ScreenConfig;
    type Result = ScreenResult;

    fn build_context(config: &ScreenConfig) -> Result<ProcessingContext> {
        let (mut pipeline, system) = build_screening_pipeline(&config.base, &config.model)?;
        if config.memoize {
            pipeline = pipeline.with_memoization(64);
        }
        let sink = match &config.sink_path {
            Some(path) => {
                let sink = JsonLinesSink::open(path)?;
                log::info!("{} Recording verdicts to {}", symbols::save_file(), sink.path().display());
                Some(Box::new(sink) as Box<dyn VerdictSink>)
            }
            None => None,
        };
        Ok(ProcessingContext { pipeline, system, sink })
    }

    fn process_single_image(
        ctx: &ProcessingContext,
        image: &ImageSource,
        config: &ScreenConfig,
    ) -> Result<ScreenResult> {
        let start = Instant::now();
        let bytes = read_image_bytes(&image.path)?;
        let outcome = ScreenOutcome::from_pipeline(
            ctx.pipeline.validate_and_classify(&bytes, mime_hint(&image.path)),
        )?;

        if let (Some(sink), ScreenOutcome::Verdict(verdict)) = (&ctx.sink, &outcome) {
            sink.record(&config.session_id, verdict)?;
        }
        if config.print_json {
            print_json(image, &outcome)?;
        }

        Ok(ScreenResult {
            outcome,
            processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }
}

pub fn run_screening(config: ScreenConfig) -> Result<usize> {
    run_model_processing::<ScreenProcessor>(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_errors_stay_errors() {
        let err = ScreenOutcome::from_pipeline(Err(PipelineError::Decode("truncated".into())));
        assert!(err.is_err());
    }

    #[test]
    fn test_rejection_is_an_outcome() {
        let outcome = ScreenOutcome::from_pipeline(Err(PipelineError::Rejected(Rejection {
            status: Rejection::STATUS,
            detected_type: "extremely_low_resolution".to_string(),
            error: "too small".to_string(),
            suggestion: "retake".to_string(),
            warnings: vec![],
        })))
        .unwrap();
        assert_eq!(outcome.summary(), "unsuitable (extremely_low_resolution)");
        let core = outcome.core_results().unwrap();
        assert_eq!(core["status"].as_str(), Some("unsuitable"));
    }
}
