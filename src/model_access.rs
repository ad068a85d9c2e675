//! Model artifact resolution: CLI arguments, environment overrides and the
//! download cache.
//!
//! Resolution order for every model:
//! 1. `--model-path`
//! 2. `--model-url` (+ optional `--model-checksum`)
//! 3. `FUNDUS_<TASK>_MODEL_PATH`
//! 4. `FUNDUS_<TASK>_MODEL_URL` (+ optional `FUNDUS_<TASK>_MODEL_CHECKSUM`)
//!
//! Downloads stream into a temporary file inside the cache directory, are
//! verified against the MD5 checksum when one is known, and only then
//! persisted under their final name. The temporary file is removed on every
//! failure path, so the cache never holds a partial model.

use crate::cache_common;
use crate::class_registry::TaskKind;
use crate::color_utils::symbols;
use crate::onnx_session::ModelSource;
use crate::progress::{add_progress_bar, remove_progress_bar};
use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Default limit for a whole model download
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Remote model description
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    pub url: String,
    pub md5_checksum: Option<String>,
    pub filename: String,
}

impl ModelInfo {
    /// Derive name and filename from the last URL segment.
    pub fn from_url(name: &str, url: &str, md5_checksum: Option<String>) -> Self {
        let filename = url
            .split('?')
            .next()
            .and_then(|u| u.rsplit('/').next())
            .filter(|s| !s.is_empty())
            .unwrap_or("model.onnx")
            .to_string();
        Self {
            name: name.to_string(),
            url: url.to_string(),
            md5_checksum,
            filename,
        }
    }

    /// Cache file name; includes the checksum so different versions coexist.
    pub fn cache_file_name(&self) -> String {
        match &self.md5_checksum {
            Some(checksum) => match self.filename.rsplit_once('.') {
                Some((stem, ext)) => format!("{stem}-{checksum}.{ext}"),
                None => format!("{}-{checksum}", self.filename),
            },
            None => self.filename.clone(),
        }
    }
}

/// Model cache statistics, recorded in per-image metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCacheStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_cache_hit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_models_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_models_size_mb: Option<f64>,
}

/// Model location given on the command line
#[derive(Debug, Clone, Default)]
pub struct CliModelInfo {
    pub model_path: Option<String>,
    pub model_url: Option<String>,
    pub model_checksum: Option<String>,
}

impl CliModelInfo {
    pub fn validate(&self) -> Result<()> {
        if self.model_path.is_some() && self.model_url.is_some() {
            return Err(anyhow!(
                "Cannot specify both --model-path and --model-url. Choose one."
            ));
        }
        if self.model_checksum.is_some() && self.model_url.is_none() {
            return Err(anyhow!("--model-checksum can only be used with --model-url"));
        }
        Ok(())
    }
}

/// Per-model environment variable names and download defaults.
pub trait ModelAccess {
    /// Short name used in logs and cache names
    fn model_name(&self) -> String;

    /// Variable holding a local model path
    fn env_var_name(&self) -> String;

    fn url_env_var_name(&self) -> Option<String> {
        None
    }

    fn checksum_env_var_name(&self) -> Option<String> {
        None
    }

    /// Resolve a model source; CLI arguments win over environment variables.
    fn model_source_with_cli(
        &self,
        cli: &CliModelInfo,
        timeout: Duration,
    ) -> Result<(ModelSource, Option<ModelCacheStats>)>
    where
        Self: Sized,
    {
        resolve_model_source(self, cli, timeout)
    }
}

/// Classifier graph for one screening task.
#[derive(Debug, Clone, Copy)]
pub struct TaskModelAccess {
    pub task: TaskKind,
}

impl ModelAccess for TaskModelAccess {
    fn model_name(&self) -> String {
        format!("{}-classifier", self.task)
    }

    fn env_var_name(&self) -> String {
        format!("FUNDUS_{}_MODEL_PATH", self.task.env_prefix())
    }

    fn url_env_var_name(&self) -> Option<String> {
        Some(format!("FUNDUS_{}_MODEL_URL", self.task.env_prefix()))
    }

    fn checksum_env_var_name(&self) -> Option<String> {
        Some(format!("FUNDUS_{}_MODEL_CHECKSUM", self.task.env_prefix()))
    }
}

/// Companion graph exposing feature maps and their gradients.
#[derive(Debug, Clone, Copy)]
pub struct ExplainerModelAccess;

impl ModelAccess for ExplainerModelAccess {
    fn model_name(&self) -> String {
        "attribution-explainer".to_string()
    }

    fn env_var_name(&self) -> String {
        "FUNDUS_EXPLAINER_MODEL_PATH".to_string()
    }
}

/// Remote model named by the URL variable, with the checksum variable if set.
pub fn model_info_from_env<T: ModelAccess>(access: &T) -> Option<ModelInfo> {
    let non_empty = |var: String| std::env::var(var).ok().filter(|v| !v.is_empty());
    let url = access.url_env_var_name().and_then(non_empty)?;
    let checksum = access.checksum_env_var_name().and_then(non_empty);
    Some(ModelInfo::from_url(&access.model_name(), &url, checksum))
}

pub fn resolve_model_source<T: ModelAccess>(
    access: &T,
    cli: &CliModelInfo,
    timeout: Duration,
) -> Result<(ModelSource, Option<ModelCacheStats>)> {
    cli.validate()?;

    if let Some(model_path) = &cli.model_path {
        log::info!("🔧 Using CLI-provided model path: {model_path}");
        let path = PathBuf::from(model_path);
        check_model_file(&path)
            .with_context(|| format!("Model path given with --model-path is unusable: {model_path}"))?;
        return Ok((ModelSource::FilePath(path), None));
    }

    if let Some(model_url) = &cli.model_url {
        log::info!("🔧 Using CLI-provided model URL: {model_url}");
        let info = ModelInfo::from_url(&access.model_name(), model_url, cli.model_checksum.clone());
        let (path, stats) = get_or_download_model(&info, &cache_common::model_cache_dir()?, timeout)?;
        return Ok((ModelSource::FilePath(path), Some(stats)));
    }

    let env_var = access.env_var_name();
    if let Ok(model_path) = std::env::var(&env_var) {
        log::debug!("🔄 Using model path from {env_var}: {model_path}");
        let path = PathBuf::from(&model_path);
        check_model_file(&path)
            .with_context(|| format!("Model path in {env_var} is unusable: {model_path}"))?;
        return Ok((ModelSource::FilePath(path), None));
    }

    if let Some(info) = model_info_from_env(access) {
        log::debug!("🔄 Using remote model info for {}: {info:?}", access.model_name());
        let (path, stats) = get_or_download_model(&info, &cache_common::model_cache_dir()?, timeout)?;
        return Ok((ModelSource::FilePath(path), Some(stats)));
    }

    Err(anyhow!(
        "No model configured for {}: pass --model-path / --model-url or set {}",
        access.model_name(),
        env_var
    ))
}

fn check_model_file(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Model file does not exist: {}", path.display()))?;
    if metadata.len() == 0 {
        return Err(anyhow!("Model file is empty (0 bytes): {}", path.display()));
    }
    log::debug!(
        "✓ Model file size: {:.2} MB",
        metadata.len() as f64 / (1024.0 * 1024.0)
    );
    Ok(())
}

/// Return the cached model path, downloading into `cache_dir` when needed.
pub fn get_or_download_model(
    info: &ModelInfo,
    cache_dir: &Path,
    timeout: Duration,
) -> Result<(PathBuf, ModelCacheStats)> {
    std::fs::create_dir_all(cache_dir)
        .with_context(|| format!("Failed to create cache directory {}", cache_dir.display()))?;
    let model_path = cache_dir.join(info.cache_file_name());
    log::debug!("🗂️  Model cache path: {}", model_path.display());

    let mut stats = ModelCacheStats::default();
    if let Ok((count, size_mb)) = cache_common::cache_info(cache_dir) {
        stats.cached_models_count = Some(count);
        stats.cached_models_size_mb = Some(size_mb);
    }

    if model_path.exists() {
        match &info.md5_checksum {
            Some(checksum) if cache_common::verify_checksum(&model_path, checksum)? => {
                log::info!(
                    "{} Using cached model: {}",
                    symbols::completed_successfully(),
                    info.filename
                );
                stats.model_cache_hit = Some(true);
                return Ok((model_path, stats));
            }
            Some(_) => log::warn!(
                "{}Cached model has an invalid checksum, re-downloading",
                symbols::warning()
            ),
            None => log::warn!(
                "{}No checksum known for cached model, re-downloading",
                symbols::warning()
            ),
        }
        std::fs::remove_file(&model_path)?;
    }

    let start = Instant::now();
    download_verified(info, cache_dir, &model_path, timeout)?;
    stats.model_cache_hit = Some(false);
    stats.download_time_ms = Some(start.elapsed().as_secs_f64() * 1000.0);
    Ok((model_path, stats))
}

fn download_verified(info: &ModelInfo, cache_dir: &Path, dest: &Path, timeout: Duration) -> Result<()> {
    log::info!("📥 Downloading model from: {}", info.url);

    // Dropping the temp file on any early return deletes it
    let mut temp = tempfile::NamedTempFile::new_in(cache_dir)
        .context("Failed to create temporary download file")?;

    let client = reqwest::blocking::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(10))
        .timeout(timeout)
        .build()?;
    let mut response = client
        .get(&info.url)
        .send()
        .map_err(|e| anyhow!("Failed to send HTTP request: {}", e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("HTTP request failed with status: {}", status));
    }

    let content_length = response.content_length();
    let pb = download_progress_bar(content_length);

    let mut downloaded = 0u64;
    let mut buffer = [0u8; 8192];
    let copy_result: Result<()> = loop {
        let n = match response.read(&mut buffer) {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(anyhow!("Failed to read response data: {}", e)),
        };
        if let Err(e) = temp.write_all(&buffer[..n]) {
            break Err(anyhow!("Failed to write temporary file: {}", e));
        }
        downloaded += n as u64;
        pb.set_position(downloaded);
    };
    pb.finish_and_clear();
    remove_progress_bar(&pb);
    copy_result?;

    temp.flush()?;
    if downloaded == 0 {
        return Err(anyhow!("Downloaded model is empty (0 bytes)"));
    }
    if let Some(expected) = content_length {
        if downloaded != expected {
            return Err(anyhow!(
                "Truncated download: expected {expected} bytes, got {downloaded}"
            ));
        }
    }

    match &info.md5_checksum {
        Some(expected) => {
            let actual = cache_common::calculate_md5(temp.path())?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(anyhow!(
                    "Downloaded model failed checksum verification.\n\
                     Expected checksum: {expected}\n\
                     Actual checksum:   {actual}\n\
                     Model URL: {}",
                    info.url
                ));
            }
        }
        None => log::warn!(
            "{}Model downloaded but no checksum provided to verify it",
            symbols::warning()
        ),
    }

    temp.persist(dest)
        .map_err(|e| anyhow!("Failed to move model into cache: {}", e.error))?;
    log::info!(
        "{} Model downloaded to: {}",
        symbols::completed_successfully(),
        dest.display()
    );
    Ok(())
}

fn download_progress_bar(content_length: Option<u64>) -> ProgressBar {
    let pb = match content_length {
        Some(length) => {
            log::info!("📏 Download size: {:.1} MB", length as f64 / (1024.0 * 1024.0));
            let pb = ProgressBar::new(length);
            if let Ok(style) = ProgressStyle::default_bar().template(
                "[{elapsed_precise}] [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta})",
            ) {
                pb.set_style(style.progress_chars("#> "));
            }
            pb
        }
        None => {
            let pb = ProgressBar::new_spinner();
            pb.set_message("Downloading model (unknown size)...");
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        }
    };
    add_progress_bar(pb.clone());
    pb
}
