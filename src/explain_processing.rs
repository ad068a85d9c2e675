//! `fundus explain`: screening plus a Grad-CAM attention map, narrative and
//! heatmap overlay for each accepted image.

use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Instant;

use crate::attribution::{AttributionExplainer, AttributionMap, OnnxGradientSource};
use crate::calibration::Verdict;
use crate::color_utils::symbols;
use crate::config::ExplainConfig;
use crate::error::{PipelineError, Rejection};
use crate::heatmap_render::save_overlay;
use crate::image_input::ImageSource;
use crate::model_access::{CliModelInfo, ExplainerModelAccess, ModelAccess};
use crate::model_processing::{
    build_screening_pipeline, mime_hint, read_image_bytes, run_model_processing, ModelProcessor,
    ModelResult, ProcessingContext,
};
use crate::narrative::TemplateNarrative;
use crate::onnx_session::create_onnx_session;
use crate::output_manager::OutputManager;
use crate::screen_processing::print_json;

#[derive(Clone, Debug, Serialize)]
pub struct Explanation {
    pub verdict: Verdict,
    pub attribution: AttributionMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heatmap_path: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum ExplainOutcome {
    Explained(Box<Explanation>),
    Rejected(Rejection),
}

pub struct ExplainResult {
    pub outcome: ExplainOutcome,
    pub processing_time_ms: f64,
}

impl ModelResult for ExplainResult {
    fn processing_time_ms(&self) -> f64 {
        self.processing_time_ms
    }

    fn core_results(&self) -> Result<toml::Value> {
        Ok(match &self.outcome {
            ExplainOutcome::Explained(e) => toml::Value::try_from(e.as_ref())?,
            ExplainOutcome::Rejected(r) => toml::Value::try_from(r)?,
        })
    }

    fn output_summary(&self) -> String {
        match &self.outcome {
            ExplainOutcome::Explained(e) => format!(
                "{} {:.1}%, attention {} ({:.1}% coverage)",
                e.verdict.predicted_class,
                e.verdict.adjusted_confidence * 100.0,
                e.attribution.dominant_quadrant,
                e.attribution.coverage_percentage
            ),
            ExplainOutcome::Rejected(r) => format!("{} ({})", r.status, r.detected_type),
        }
    }

    fn is_rejected(&self) -> bool {
        matches!(self.outcome, ExplainOutcome::Rejected(_))
    }
}

pub struct ExplainProcessor;

impl ModelProcessor for ExplainProcessor {
    type Config = ExplainConfig;
    type Result = ExplainResult;

    fn build_context(config: &ExplainConfig) -> Result<ProcessingContext> {
        let (pipeline, system) = build_screening_pipeline(&config.base, &config.model)?;
        let classes = pipeline.model().registry().len();

        let cli = CliModelInfo {
            model_path: config.explainer_path.clone(),
            ..Default::default()
        };
        let (source, _) = ExplainerModelAccess
            .model_source_with_cli(&cli, config.model.download_timeout())
            .context("Explainer model unavailable; pass --explainer-path or set FUNDUS_EXPLAINER_MODEL_PATH")?;
        let (session, info) = create_onnx_session(source, config.base.device)?;
        log::info!(
            "{} Loaded explainer ({:.1} MB)",
            symbols::model_loaded(),
            info.model_size_bytes as f64 / (1024.0 * 1024.0)
        );

        let explainer = AttributionExplainer::new(Box::new(OnnxGradientSource::new(session, classes)), classes);
        let narrative = TemplateNarrative::load_or_default(config.narrative_path.as_deref());
        Ok(ProcessingContext {
            pipeline: pipeline.with_explainer(explainer).with_narrative(Box::new(narrative)),
            system,
            sink: None,
        })
    }

    fn process_single_image(
        ctx: &ProcessingContext,
        image: &ImageSource,
        config: &ExplainConfig,
    ) -> Result<ExplainResult> {
        let start = Instant::now();
        let bytes = read_image_bytes(&image.path)?;

        let outcome = match ctx.pipeline.screen(&bytes, mime_hint(&image.path)) {
            Ok(screening) => {
                let tensor = &screening.preprocessed.tensor;
                let attribution = ctx.pipeline.explain_verdict(tensor, &screening.verdict)?;

                let heatmap_path = if config.save_heatmap {
                    let output = OutputManager::new(config, &image.path);
                    let path = output.generate_main_output_path("heatmap", "png")?;
                    save_overlay(&tensor.to_rgb_image(), &attribution.heatmap, &config.style, &path)?;
                    log::debug!("{} Saved heatmap to {}", symbols::save_file(), path.display());
                    Some(output.make_relative_to_metadata(&path)?)
                } else {
                    None
                };

                ExplainOutcome::Explained(Box::new(Explanation {
                    verdict: screening.verdict,
                    attribution,
                    heatmap_path,
                }))
            }
            Err(PipelineError::Rejected(rejection)) => ExplainOutcome::Rejected(rejection),
            Err(e) => return Err(e.into()),
        };

        if config.print_json {
            print_json(image, &outcome)?;
        }
        Ok(ExplainResult {
            outcome,
            processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }
}

pub fn run_explain(config: ExplainConfig) -> Result<usize> {
    run_model_processing::<ExplainProcessor>(config)
}
