//! Configuration layer separating CLI arguments from the internal configs the
//! processing tools consume.
//!
//! - [`GlobalArgs`]: flags shared by every subcommand
//! - `*Command`: clap structs holding only command-specific arguments
//! - `*Config`: internal configs built with `from_args`, serialized into metadata

use crate::class_registry::TaskKind;
use crate::edge_density::EdgeDensityEstimator;
use crate::heatmap_render::{ColorMap, HeatmapStyle};
use crate::model_access::CliModelInfo;
use crate::model_processing::ModelConfig;
use crate::onnx_session::Device;
use clap::{Args, Parser};
use clap_verbosity_flag::Verbosity;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Parse an opacity value (must be between 0.0 and 1.0)
pub fn parse_unit_interval(s: &str) -> Result<f32, String> {
    let val = s
        .parse::<f32>()
        .map_err(|_| format!("Invalid number: '{s}'"))?;
    if !(0.0..=1.0).contains(&val) {
        return Err(format!("Must be between 0.0 and 1.0, got {val}"));
    }
    Ok(val)
}

/// Global CLI arguments that apply to all fundus commands
#[derive(Parser, Debug, Clone)]
pub struct GlobalArgs {
    /// Global output directory (overrides default placement next to input)
    #[arg(long, global = true)]
    pub output_dir: Option<String>,

    /// Create metadata output file(s)
    #[arg(long, global = true)]
    pub metadata: bool,

    /// Verbosity level (-q/--quiet, -v/-vv/-vvv for info/debug/trace)
    #[command(flatten)]
    pub verbosity: Verbosity,

    /// Use permissive mode for input collection (warn instead of error for unsupported files)
    #[arg(long, global = true)]
    pub permissive: bool,

    /// Device to use for inference
    #[arg(long, value_enum, default_value_t = Device::Auto, global = true)]
    pub device: Device,

    /// Disable colored output (also respects NO_COLOR and FUNDUS_NO_COLOR env vars)
    #[arg(long, global = true)]
    pub no_color: bool,

    /// TOML file overriding heuristic thresholds
    #[arg(long, global = true, value_name = "FILE")]
    pub thresholds: Option<PathBuf>,

    /// Edge density estimator used by fundus validation
    #[arg(long, value_enum, default_value_t = EdgeDensityEstimator::Gradient, global = true)]
    pub edge_estimator: EdgeDensityEstimator,
}

/// Base configuration common to all commands
#[derive(Debug, Clone, Serialize)]
pub struct BaseModelConfig {
    /// Input sources (images, directories or glob patterns)
    pub sources: Vec<String>,
    pub device: Device,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    pub skip_metadata: bool,
    /// Fail on missing or unsupported inputs. Opposite of `--permissive`.
    pub strict: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thresholds_path: Option<PathBuf>,
    pub edge_estimator: EdgeDensityEstimator,
}

impl From<GlobalArgs> for BaseModelConfig {
    fn from(global: GlobalArgs) -> Self {
        Self {
            sources: Vec::new(), // Sources come from the command
            device: global.device,
            output_dir: global.output_dir,
            skip_metadata: !global.metadata,
            strict: !global.permissive,
            thresholds_path: global.thresholds,
            edge_estimator: global.edge_estimator,
        }
    }
}

/// Classifier selection shared by `screen` and `explain`
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Screening task served by the classifier
    #[arg(long, value_enum, default_value_t = TaskKind::Disease)]
    pub task: TaskKind,

    /// TOML class registry (class names, input size, fallback weights)
    #[arg(long, value_name = "FILE")]
    pub registry: Option<PathBuf>,

    /// Path to the classifier ONNX model
    #[arg(long)]
    pub model_path: Option<String>,

    /// URL to download the classifier ONNX model from
    #[arg(long)]
    pub model_url: Option<String>,

    /// MD5 checksum for model verification (used with --model-url)
    #[arg(long)]
    pub model_checksum: Option<String>,

    /// Model download timeout in seconds
    #[arg(long, default_value = "120")]
    pub download_timeout: u64,

    /// Seed for fallback predictions, for reproducible runs without a model
    #[arg(long)]
    pub seed: Option<u64>,
}

/// CLI command for screening (only command-specific arguments)
#[derive(Parser, Debug, Clone)]
pub struct ScreenCommand {
    /// Path(s) to input images or directories. Supports glob patterns like *.jpg
    #[arg(value_name = "IMAGES_OR_DIRS", required = true)]
    pub sources: Vec<String>,

    #[command(flatten)]
    pub model: ModelArgs,

    /// Append every verdict to this JSON-lines file
    #[arg(long, value_name = "FILE")]
    pub sink: Option<PathBuf>,

    /// Session id recorded with each verdict (defaults to a timestamp)
    #[arg(long)]
    pub session_id: Option<String>,

    /// Reuse preprocessed tensors for byte-identical inputs
    #[arg(long)]
    pub memoize: bool,

    /// Print each verdict as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

/// CLI command for fundus validation only
#[derive(Parser, Debug, Clone)]
pub struct ValidateCommand {
    /// Path(s) to input images or directories. Supports glob patterns like *.jpg
    #[arg(value_name = "IMAGES_OR_DIRS", required = true)]
    pub sources: Vec<String>,

    /// Print each validation result as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

/// CLI command for screening with attention maps
#[derive(Parser, Debug, Clone)]
pub struct ExplainCommand {
    /// Path(s) to input images or directories. Supports glob patterns like *.jpg
    #[arg(value_name = "IMAGES_OR_DIRS", required = true)]
    pub sources: Vec<String>,

    #[command(flatten)]
    pub model: ModelArgs,

    /// Path to the explainer ONNX graph (feature maps + gradients)
    #[arg(long)]
    pub explainer_path: Option<String>,

    /// TOML file replacing the narrative templates
    #[arg(long, value_name = "FILE")]
    pub narrative: Option<PathBuf>,

    /// Colormap for the heatmap overlay
    #[arg(long, value_enum, default_value_t = ColorMap::Turbo)]
    pub colormap: ColorMap,

    /// Heatmap opacity over the preprocessed image (0.0-1.0)
    #[arg(long, default_value = "0.45", value_parser = parse_unit_interval)]
    pub alpha: f32,

    /// Skip writing the heatmap overlay image
    #[arg(long)]
    pub no_heatmap: bool,

    /// Print each explanation as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

/// Internal classifier settings
#[derive(Debug, Clone, Serialize)]
pub struct ModelSettings {
    pub task: TaskKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_checksum: Option<String>,
    pub download_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_seed: Option<u64>,
}

impl From<ModelArgs> for ModelSettings {
    fn from(args: ModelArgs) -> Self {
        Self {
            task: args.task,
            registry_path: args.registry,
            model_path: args.model_path,
            model_url: args.model_url,
            model_checksum: args.model_checksum,
            download_timeout_secs: args.download_timeout,
            fallback_seed: args.seed,
        }
    }
}

impl ModelSettings {
    pub fn cli_model_info(&self) -> CliModelInfo {
        CliModelInfo {
            model_path: self.model_path.clone(),
            model_url: self.model_url.clone(),
            model_checksum: self.model_checksum.clone(),
        }
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Internal configuration for screening
#[derive(Debug, Clone, Serialize)]
pub struct ScreenConfig {
    #[serde(skip)]
    pub base: BaseModelConfig,
    pub model: ModelSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sink_path: Option<PathBuf>,
    pub session_id: String,
    pub memoize: bool,
    #[serde(skip)]
    pub print_json: bool,
}

/// Internal configuration for validation
#[derive(Debug, Clone, Serialize)]
pub struct ValidateConfig {
    #[serde(skip)]
    pub base: BaseModelConfig,
    #[serde(skip)]
    pub print_json: bool,
}

/// Internal configuration for explanation
#[derive(Debug, Clone, Serialize)]
pub struct ExplainConfig {
    #[serde(skip)]
    pub base: BaseModelConfig,
    pub model: ModelSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explainer_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narrative_path: Option<PathBuf>,
    pub style: HeatmapStyle,
    pub save_heatmap: bool,
    #[serde(skip)]
    pub print_json: bool,
}

fn default_session_id() -> String {
    chrono::Utc::now().format("session-%Y%m%dT%H%M%S").to_string()
}

impl ScreenConfig {
    /// Create configuration from global args and command-specific args
    pub fn from_args(global: GlobalArgs, cmd: ScreenCommand) -> Result<Self, String> {
        let mut base: BaseModelConfig = global.into();
        base.sources = cmd.sources;
        let model: ModelSettings = cmd.model.into();
        model.cli_model_info().validate().map_err(|e| e.to_string())?;

        Ok(Self {
            base,
            model,
            sink_path: cmd.sink,
            session_id: cmd
                .session_id
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(default_session_id),
            memoize: cmd.memoize,
            print_json: cmd.json,
        })
    }
}

impl ValidateConfig {
    pub fn from_args(global: GlobalArgs, cmd: ValidateCommand) -> Result<Self, String> {
        let mut base: BaseModelConfig = global.into();
        base.sources = cmd.sources;
        Ok(Self {
            base,
            print_json: cmd.json,
        })
    }
}

impl ExplainConfig {
    pub fn from_args(global: GlobalArgs, cmd: ExplainCommand) -> Result<Self, String> {
        let mut base: BaseModelConfig = global.into();
        base.sources = cmd.sources;
        let model: ModelSettings = cmd.model.into();
        model.cli_model_info().validate().map_err(|e| e.to_string())?;

        Ok(Self {
            base,
            model,
            explainer_path: cmd.explainer_path,
            narrative_path: cmd.narrative,
            style: HeatmapStyle {
                colormap: cmd.colormap,
                alpha: cmd.alpha,
            },
            save_heatmap: !cmd.no_heatmap,
            print_json: cmd.json,
        })
    }
}

impl ModelConfig for ScreenConfig {
    fn base(&self) -> &BaseModelConfig {
        &self.base
    }

    fn tool_name(&self) -> &'static str {
        "screen"
    }
}

impl ModelConfig for ValidateConfig {
    fn base(&self) -> &BaseModelConfig {
        &self.base
    }

    fn tool_name(&self) -> &'static str {
        "validate"
    }
}

impl ModelConfig for ExplainConfig {
    fn base(&self) -> &BaseModelConfig {
        &self.base
    }

    fn tool_name(&self) -> &'static str {
        "explain"
    }
}
