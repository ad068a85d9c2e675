use crate::cache_common;
use crate::color_utils::symbols;
use anyhow::{anyhow, Context, Result};
use log::Level;
use ort::{
    execution_providers::{
        CPUExecutionProvider, CoreMLExecutionProvider, ExecutionProvider,
        ExecutionProviderDispatch,
    },
    logging::LogLevel,
    session::Session,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Execution device requested on the command line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// CoreML when available, else CPU
    #[default]
    Auto,
    Cpu,
    Coreml,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Auto => "auto",
            Device::Cpu => "cpu",
            Device::Coreml => "coreml",
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the ONNX graph comes from
#[derive(Debug, Clone)]
pub enum ModelSource {
    Bytes(Vec<u8>),
    FilePath(PathBuf),
}

/// Description of a loaded model, recorded in per-image metadata.
#[derive(Debug, Clone, Serialize)]
pub struct OnnxModelInfo {
    pub model_source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,
    pub model_size_bytes: usize,
    pub model_checksum: String,
    pub device: String,
    pub execution_providers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DeviceSelection {
    pub device: Device,
    pub reason: String,
}

/// Resolve `auto` into a concrete device.
pub fn determine_optimal_device(requested: Device) -> DeviceSelection {
    match requested {
        Device::Auto => match CoreMLExecutionProvider::default().is_available() {
            Ok(true) => DeviceSelection {
                device: Device::Coreml,
                reason: "Auto-selected CoreML (available)".to_string(),
            },
            _ => DeviceSelection {
                device: Device::Cpu,
                reason: "Auto-selected CPU (CoreML not available)".to_string(),
            },
        },
        other => DeviceSelection {
            device: other,
            reason: format!("User explicitly chose {other}"),
        },
    }
}

fn log_level_from_ort(level: LogLevel) -> Level {
    match level {
        LogLevel::Verbose | LogLevel::Info => Level::Trace,
        LogLevel::Warning => Level::Debug,
        LogLevel::Error => Level::Info,
        LogLevel::Fatal => Level::Error,
    }
}

fn ort_level_from_log(level: Level) -> LogLevel {
    match level {
        // ONNX Runtime's info level is closer to our trace
        Level::Trace => LogLevel::Verbose,
        Level::Debug => LogLevel::Warning,
        Level::Info | Level::Warn => LogLevel::Error,
        Level::Error => LogLevel::Fatal,
    }
}

fn execution_providers(device: Device, model_hash: &str) -> Vec<ExecutionProviderDispatch> {
    let cpu = CPUExecutionProvider::default().build();
    if device != Device::Coreml {
        return vec![cpu];
    }
    match CoreMLExecutionProvider::default().is_available() {
        Ok(true) => {
            let mut coreml = CoreMLExecutionProvider::default();
            // Compiled CoreML models are keyed by graph content and crate version
            let cache_dir = cache_common::coreml_cache_dir().map(|dir| {
                dir.join(format!(
                    "{}_{}",
                    &model_hash[..8.min(model_hash.len())],
                    env!("CARGO_PKG_VERSION").replace('.', "_")
                ))
            });
            match cache_dir {
                Ok(dir) if std::fs::create_dir_all(&dir).is_ok() => {
                    if let Some(dir_str) = dir.to_str() {
                        log::debug!("CoreML model cache: {dir_str}");
                        coreml = coreml.with_model_cache_dir(dir_str);
                    }
                }
                _ => log::warn!(
                    "{}Could not prepare CoreML cache directory, compiling without cache",
                    symbols::warning()
                ),
            }
            vec![coreml.build(), cpu]
        }
        _ => {
            log::warn!(
                "{}CoreML not available, falling back to CPU",
                symbols::warning()
            );
            vec![cpu]
        }
    }
}

/// Build an ONNX Runtime session on the requested device.
pub fn create_onnx_session(source: ModelSource, device: Device) -> Result<(Session, OnnxModelInfo)> {
    let (bytes, model_source, model_path) = match source {
        ModelSource::Bytes(bytes) => (bytes, "Bytes", None),
        ModelSource::FilePath(path) => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read model file: {}", path.display()))?;
            (bytes, "File", Some(path.display().to_string()))
        }
    };
    if bytes.is_empty() {
        return Err(anyhow!("Model is empty (0 bytes)"));
    }

    let selection = determine_optimal_device(device);
    log::debug!("Device: {} ({})", selection.device, selection.reason);

    let model_checksum = cache_common::calculate_md5_bytes(&bytes);
    let providers = execution_providers(selection.device, &model_checksum);
    let ep_names: Vec<String> = providers.iter().map(|ep| format!("{ep:?}")).collect();

    let ort_log_level = [Level::Trace, Level::Debug, Level::Info, Level::Warn, Level::Error]
        .into_iter()
        .find(|&lvl| log::log_enabled!(lvl))
        .map(ort_level_from_log)
        .unwrap_or(LogLevel::Fatal);

    let session = Session::builder()
        .map_err(|e| anyhow!("Failed to create session builder: {}", e))?
        .with_logger(Box::new(|level, _, _, _, msg| {
            log::log!(log_level_from_ort(level), "[onnx] {msg}")
        }))
        .map_err(|e| anyhow!("Failed to set logger: {}", e))?
        .with_log_level(ort_log_level)
        .map_err(|e| anyhow!("Failed to set log level: {}", e))?
        .with_execution_providers(providers)
        .map_err(|e| anyhow!("Failed to set execution providers: {}", e))?
        .commit_from_memory(&bytes)
        .map_err(|e| anyhow!("Failed to load ONNX model: {}", e))?;

    log::debug!(
        "{} Execution providers registered: {}",
        symbols::system_setup(),
        ep_names.join(" -> ")
    );

    let info = OnnxModelInfo {
        model_source: model_source.to_string(),
        model_path,
        model_size_bytes: bytes.len(),
        model_checksum,
        device: selection.device.to_string(),
        execution_providers: ep_names,
    };
    Ok((session, info))
}
