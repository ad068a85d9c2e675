//! Output path management shared by all tools.
//!
//! Main outputs are named after the input stem: clean inside `--output-dir`,
//! suffixed when written next to the input. Auxiliary outputs always carry
//! their suffix.

use anyhow::Result;
use log::debug;
use std::path::{Path, PathBuf};

use crate::model_processing::ModelConfig;
use crate::shared_metadata::{get_metadata_path, load_or_create_metadata, save_metadata, ToolSections};

pub struct OutputManager<'a> {
    config: &'a dyn ModelConfig,
    input_path: &'a Path,
}

impl<'a> OutputManager<'a> {
    pub fn new(config: &'a dyn ModelConfig, input_path: &'a Path) -> Self {
        Self { config, input_path }
    }

    fn input_stem(&self) -> &str {
        self.input_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output")
    }

    fn place(&self, filename: String) -> Result<PathBuf> {
        match &self.config.base().output_dir {
            Some(output_dir) => {
                let output_dir = Path::new(output_dir);
                std::fs::create_dir_all(output_dir)?;
                Ok(output_dir.join(filename))
            }
            None => Ok(self
                .input_path
                .parent()
                .unwrap_or(Path::new("."))
                .join(filename)),
        }
    }

    /// Primary output; the suffix is dropped inside a dedicated output directory
    pub fn generate_main_output_path(&self, default_suffix: &str, extension: &str) -> Result<PathBuf> {
        let stem = self.input_stem();
        let filename = if self.config.base().output_dir.is_some() {
            format!("{stem}.{extension}")
        } else {
            format!("{stem}_{default_suffix}.{extension}")
        };
        self.place(filename)
    }

    pub fn generate_auxiliary_output(&self, suffix: &str, extension: &str) -> Result<PathBuf> {
        let filename = format!("{}_{suffix}.{extension}", self.input_stem());
        self.place(filename)
    }

    /// Path as written into the metadata file
    pub fn make_relative_to_metadata(&self, path: &Path) -> Result<String> {
        if self.config.base().skip_metadata {
            return Ok(path.to_string_lossy().to_string());
        }
        let metadata_path = get_metadata_path(self.input_path, self.config.base().output_dir.as_deref())?;
        make_path_relative_to_toml(path, &metadata_path)
    }

    /// Replace this tool's section of the metadata file, keeping the others
    pub fn save_tool_metadata(&self, sections: ToolSections) -> Result<()> {
        if self.config.base().skip_metadata {
            return Ok(());
        }
        let metadata_path = get_metadata_path(self.input_path, self.config.base().output_dir.as_deref())?;
        let mut metadata = load_or_create_metadata(&metadata_path)?;

        match self.config.tool_name() {
            "screen" => metadata.screen = Some(sections),
            "validate" => metadata.validate = Some(sections),
            "explain" => metadata.explain = Some(sections),
            other => return Err(anyhow::anyhow!("Unknown tool name: {other}")),
        }

        save_metadata(&metadata, &metadata_path)?;
        debug!("📋 Saved metadata to: {}", metadata_path.display());
        Ok(())
    }
}

/// Make a file path relative to a TOML file's directory when possible
pub fn make_path_relative_to_toml(file_path: &Path, toml_path: &Path) -> Result<String> {
    if let Some(toml_dir) = toml_path.parent() {
        if let Ok(rel_path) = file_path.strip_prefix(toml_dir) {
            return Ok(rel_path.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(file_path.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BaseModelConfig, ValidateConfig};
    use crate::edge_density::EdgeDensityEstimator;
    use crate::onnx_session::Device;
    use tempfile::TempDir;

    fn config(output_dir: Option<String>, skip_metadata: bool) -> ValidateConfig {
        ValidateConfig {
            base: BaseModelConfig {
                sources: vec!["eye.jpg".to_string()],
                device: Device::Cpu,
                output_dir,
                skip_metadata,
                strict: true,
                thresholds_path: None,
                edge_estimator: EdgeDensityEstimator::Gradient,
            },
            print_json: false,
        }
    }

    #[test]
    fn test_main_output_next_to_input() {
        let temp_dir = TempDir::new().unwrap();
        let input_path = temp_dir.path().join("eye.jpg");
        let config = config(None, true);
        let manager = OutputManager::new(&config, &input_path);
        assert_eq!(
            manager.generate_main_output_path("heatmap", "png").unwrap(),
            temp_dir.path().join("eye_heatmap.png")
        );
    }

    #[test]
    fn test_main_output_in_output_dir() {
        let temp_dir = TempDir::new().unwrap();
        let output_dir = temp_dir.path().join("out");
        let input_path = temp_dir.path().join("eye.jpg");
        let config = config(Some(output_dir.to_string_lossy().to_string()), true);
        let manager = OutputManager::new(&config, &input_path);
        assert_eq!(
            manager.generate_main_output_path("heatmap", "png").unwrap(),
            output_dir.join("eye.png")
        );
        assert!(output_dir.is_dir());
        assert_eq!(
            manager.generate_auxiliary_output("preprocessed", "png").unwrap(),
            output_dir.join("eye_preprocessed.png")
        );
    }

    #[test]
    fn test_save_tool_metadata_respects_skip() {
        let temp_dir = TempDir::new().unwrap();
        let input_path = temp_dir.path().join("eye.jpg");

        let skipped = config(None, true);
        OutputManager::new(&skipped, &input_path)
            .save_tool_metadata(ToolSections::default())
            .unwrap();
        assert!(!temp_dir.path().join("eye.fundus.toml").exists());

        let written = config(None, false);
        OutputManager::new(&written, &input_path)
            .save_tool_metadata(ToolSections {
                core: Some(toml::toml! { is_valid = true }.into()),
                ..Default::default()
            })
            .unwrap();
        let content = std::fs::read_to_string(temp_dir.path().join("eye.fundus.toml")).unwrap();
        assert!(content.contains("[validate]"));
    }

    #[test]
    fn test_make_path_relative_to_toml() {
        let temp_dir = TempDir::new().unwrap();
        let toml_path = temp_dir.path().join("eye.fundus.toml");
        let nested = temp_dir.path().join("sub").join("eye_heatmap.png");
        assert_eq!(make_path_relative_to_toml(&nested, &toml_path).unwrap(), "sub/eye_heatmap.png");
        let elsewhere = Path::new("/elsewhere/eye.png");
        assert_eq!(make_path_relative_to_toml(elsewhere, &toml_path).unwrap(), "/elsewhere/eye.png");
    }
}
