use crate::model_access::ModelCacheStats;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Per-image metadata file, one optional section per tool
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct FundusMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validate: Option<ToolSections>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen: Option<ToolSections>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<ToolSections>,
}

/// All sections written by one tool
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ToolSections {
    // Core results sit directly under the tool table
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub core: Option<toml::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<toml::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<InputProcessing>,
}

/// Execution context for a tool invocation
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ExecutionContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fundus_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_line: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fundus_env_vars: Option<BTreeMap<String, String>>,
}

/// Model and device information for a tool invocation
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SystemInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_requested: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_selected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_selection_reason: Option<String>,
    #[serde(default)]
    pub execution_providers: Vec<String>,
    /// `fallback` when no classifier was loaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_load_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_cache: Option<ModelCacheStats>,
}

/// Where the image came from
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct InputProcessing {
    pub image_path: String,
    pub source: String,
    pub source_type: String,
    pub strict_mode: bool,
}

/// Load existing metadata, or start fresh when missing or unreadable
pub fn load_or_create_metadata(path: &Path) -> Result<FundusMetadata> {
    if !path.exists() {
        return Ok(FundusMetadata::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read metadata {}", path.display()))?;
    match toml::from_str::<FundusMetadata>(&content) {
        Ok(metadata) => Ok(metadata),
        Err(e) => {
            warn!(
                "{} Dropping existing metadata from {}:\n{}",
                crate::color_utils::symbols::warning(),
                path.display(),
                crate::color_utils::colors::warning_level(&e.to_string())
            );
            Ok(FundusMetadata::default())
        }
    }
}

pub fn save_metadata(metadata: &FundusMetadata, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let toml_content = toml::to_string_pretty(metadata).map_err(|e| {
        log::debug!("Metadata that failed to serialize: {metadata:#?}");
        anyhow::anyhow!(
            "Failed to serialize metadata to TOML: {e}. A field holds a value TOML cannot represent."
        )
    })?;
    fs::write(path, toml_content)
        .with_context(|| format!("Failed to write metadata {}", path.display()))?;
    Ok(())
}

/// `<stem>.fundus.toml`, next to the input or in `output_dir`
pub fn get_metadata_path(input_path: &Path, output_dir: Option<&str>) -> Result<PathBuf> {
    let input_stem = input_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid input filename"))?;
    let metadata_filename = format!("{input_stem}.fundus.toml");

    Ok(match output_dir {
        Some(output_dir) => Path::new(output_dir).join(metadata_filename),
        None => input_path
            .parent()
            .unwrap_or(Path::new("."))
            .join(metadata_filename),
    })
}

/// Non-empty `FUNDUS_*` environment variables
pub fn collect_fundus_env_vars() -> Option<BTreeMap<String, String>> {
    let vars: BTreeMap<String, String> = std::env::vars()
        .filter(|(key, value)| key.starts_with("FUNDUS_") && !value.is_empty())
        .collect();
    if vars.is_empty() {
        None
    } else {
        Some(vars)
    }
}
