//! Batch processing framework shared by the `screen`, `validate` and
//! `explain` tools.
//!
//! A [`ModelProcessor`] builds its [`ProcessingContext`] once per run (loading
//! thresholds, registry and models) and then handles one image at a time.
//! [`run_model_processing`] takes care of input collection, progress, strict
//! vs permissive failure handling and per-image metadata.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::class_registry::ClassRegistry;
use crate::classifier::{ModelHandle, ModelLoadOptions};
use crate::color_utils::{progress::create_batch_progress_bar, symbols};
use crate::config::{BaseModelConfig, ModelSettings};
use crate::image_input::{collect_images_from_sources, ImageInputConfig, ImageSource};
use crate::onnx_session::determine_optimal_device;
use crate::output_manager::OutputManager;
use crate::pipeline::ScreeningPipeline;
use crate::progress::{println_above, remove_progress_bar};
use crate::shared_metadata::{
    collect_fundus_env_vars, ExecutionContext, InputProcessing, SystemInfo, ToolSections,
};
use crate::sink::VerdictSink;
use crate::thresholds::Thresholds;

/// Configuration trait for tools that can be processed generically
pub trait ModelConfig {
    fn base(&self) -> &BaseModelConfig;

    /// Metadata section name
    fn tool_name(&self) -> &'static str;
}

/// Per-image output of a tool
pub trait ModelResult {
    fn processing_time_ms(&self) -> f64;

    /// Serializable core results for the tool's metadata section
    fn core_results(&self) -> Result<toml::Value>;

    /// One-line summary for logs
    fn output_summary(&self) -> String;

    /// The image was judged unsuitable rather than processed
    fn is_rejected(&self) -> bool {
        false
    }
}

/// State shared by every image of a run
pub struct ProcessingContext {
    pub pipeline: ScreeningPipeline,
    pub system: SystemInfo,
    pub sink: Option<Box<dyn VerdictSink>>,
}

pub trait ModelProcessor {
    type Config: ModelConfig + Serialize;
    type Result: ModelResult;

    fn build_context(config: &Self::Config) -> Result<ProcessingContext>;

    fn process_single_image(
        ctx: &ProcessingContext,
        image: &ImageSource,
        config: &Self::Config,
    ) -> Result<Self::Result>;
}

/// Thresholds from `--thresholds`, or the defaults
pub fn load_thresholds(base: &BaseModelConfig) -> Result<Thresholds> {
    match &base.thresholds_path {
        Some(path) => Thresholds::from_toml_file(path),
        None => Ok(Thresholds::default()),
    }
}

/// Load the classifier and build the pipeline around it. Missing models
/// degrade to fallback mode; only an unreadable thresholds file is fatal.
pub fn build_screening_pipeline(
    base: &BaseModelConfig,
    model: &ModelSettings,
) -> Result<(ScreeningPipeline, SystemInfo)> {
    let thresholds = load_thresholds(base)?;
    let registry = ClassRegistry::load_or_default(model.registry_path.as_deref(), model.task);
    let options = ModelLoadOptions {
        cli: model.cli_model_info(),
        device: base.device,
        download_timeout: Some(model.download_timeout()),
        fallback_seed: model.fallback_seed,
    };

    let load_start = Instant::now();
    let handle = ModelHandle::load(registry, thresholds.calibration.clone(), &options);
    let load_time_ms = load_start.elapsed().as_secs_f64() * 1000.0;

    let system = system_info(base, &handle, Some(load_time_ms));
    let pipeline = ScreeningPipeline::new(Arc::new(handle), &thresholds, base.edge_estimator);
    Ok((pipeline, system))
}

pub fn system_info(base: &BaseModelConfig, handle: &ModelHandle, load_time_ms: Option<f64>) -> SystemInfo {
    let selection = determine_optimal_device(base.device);
    let mut system = SystemInfo {
        device_requested: Some(base.device.to_string()),
        device_selected: Some(selection.device.to_string()),
        device_selection_reason: Some(selection.reason),
        model_load_time_ms: load_time_ms,
        model_cache: handle.cache_stats().cloned(),
        ..Default::default()
    };
    match handle.model_info() {
        Some(info) => {
            system.execution_providers = info.execution_providers.clone();
            system.model_source = Some(info.model_source.clone());
            system.model_path = info.model_path.clone();
            system.model_size_bytes = Some(info.model_size_bytes as u64);
            system.model_checksum = Some(info.model_checksum.clone());
        }
        None => system.model_source = Some("fallback".to_string()),
    }
    system
}

/// Process every image named by the sources. Returns the number of images
/// that produced a result (rejections included).
pub fn run_model_processing<P: ModelProcessor>(config: P::Config) -> Result<usize> {
    let framework_start = Instant::now();
    let start_timestamp = Utc::now();
    let command_line: Vec<String> = std::env::args().collect();

    let image_config = ImageInputConfig::from_strict_flag(config.base().strict);
    let images = collect_images_from_sources(&config.base().sources, &image_config)?;
    if images.is_empty() {
        log::warn!("{}No valid images found to process", symbols::warning());
        return Ok(0);
    }
    log::info!("{} Found {} image(s) to process", symbols::resources_found(), images.len());

    let ctx = P::build_context(&config)?;
    let config_value = toml::Value::try_from(&config).context("Failed to serialize config")?;

    let progress_bar = create_batch_progress_bar(images.len());
    let (mut processed, mut rejected, mut failed) = (0usize, 0usize, 0usize);

    for (index, image) in images.iter().enumerate() {
        if let Some(pb) = &progress_bar {
            pb.set_message(image.path.display().to_string());
        }
        match P::process_single_image(&ctx, image, &config) {
            Ok(result) => {
                processed += 1;
                if result.is_rejected() {
                    rejected += 1;
                }
                log::info!(
                    "{} {} ({}/{}) in {:.1}ms: {}",
                    if result.is_rejected() { symbols::rejected() } else { symbols::completed_successfully() },
                    image.path.display(),
                    index + 1,
                    images.len(),
                    result.processing_time_ms(),
                    result.output_summary()
                );

                if !config.base().skip_metadata {
                    save_metadata_for_file(
                        &result,
                        &config,
                        image,
                        &ctx.system,
                        config_value.clone(),
                        &command_line,
                        start_timestamp,
                    )?;
                }
            }
            Err(e) => {
                failed += 1;
                if config.base().strict {
                    if let Some(pb) = &progress_bar {
                        remove_progress_bar(pb);
                    }
                    return Err(e.context(format!("Failed to process {}", image.path.display())));
                }
                let line = format!(
                    "{} Failed to process {} ({}/{}): {e:#}",
                    symbols::operation_failed(),
                    image.path.display(),
                    index + 1,
                    images.len()
                );
                if progress_bar.is_some() {
                    println_above(&line);
                } else {
                    log::warn!("{line}");
                }
            }
        }
        if let Some(pb) = &progress_bar {
            pb.inc(1);
        }
    }

    if let Some(pb) = &progress_bar {
        pb.finish_and_clear();
        remove_progress_bar(pb);
    }

    let total_time = framework_start.elapsed().as_secs_f64();
    if failed == 0 {
        log::info!(
            "{} Processed {processed} image(s) in {total_time:.1}s ({rejected} unsuitable)",
            symbols::completed_successfully()
        );
    } else {
        log::warn!(
            "{} {failed} of {} image(s) failed to process",
            symbols::completed_partially_successfully(),
            images.len()
        );
    }

    Ok(processed)
}

fn save_metadata_for_file<C: ModelConfig, R: ModelResult>(
    result: &R,
    config: &C,
    image: &ImageSource,
    system: &SystemInfo,
    config_value: toml::Value,
    command_line: &[String],
    start_timestamp: chrono::DateTime<Utc>,
) -> Result<()> {
    let sections = ToolSections {
        core: Some(result.core_results()?),
        config: Some(config_value),
        execution: Some(ExecutionContext {
            timestamp: Some(start_timestamp),
            fundus_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            command_line: Some(command_line.to_vec()),
            exit_code: Some(0),
            processing_time_ms: Some(result.processing_time_ms()),
            fundus_env_vars: collect_fundus_env_vars(),
        }),
        system: Some(system.clone()),
        input: Some(InputProcessing {
            image_path: image.path.to_string_lossy().to_string(),
            source: image.source.clone(),
            source_type: image.source_type.as_str().to_string(),
            strict_mode: config.base().strict,
        }),
    };
    OutputManager::new(config, &image.path).save_tool_metadata(sections)
}

/// Read an input file fully; decoding happens in the pipeline
pub fn read_image_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// MIME hint from the file extension
pub fn mime_hint(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_string_lossy().to_lowercase();
    Some(match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        _ => return None,
    })
}
