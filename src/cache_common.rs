use anyhow::{anyhow, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding where downloaded models are cached
pub const MODEL_CACHE_ENV: &str = "FUNDUS_MODEL_CACHE_DIR";

/// Platform cache root (e.g. `~/.cache` on Linux)
pub fn cache_base_dir() -> Result<PathBuf> {
    dirs::cache_dir().ok_or_else(|| anyhow!("Unable to determine cache directory"))
}

/// Directory holding downloaded model artifacts.
pub fn model_cache_dir() -> Result<PathBuf> {
    cache_dir_with_env_override(MODEL_CACHE_ENV, "fundus-screen/models")
}

/// Directory holding compiled CoreML artifacts.
pub fn coreml_cache_dir() -> Result<PathBuf> {
    cache_base_dir().map(|dir| dir.join("fundus-screen").join("coreml"))
}

/// Resolve a cache directory from `env_var` (with `~/` expansion), else
/// `<platform cache>/<default_subdir>`.
pub fn cache_dir_with_env_override(env_var: &str, default_subdir: &str) -> Result<PathBuf> {
    if let Ok(cache_dir) = std::env::var(env_var) {
        let path = match cache_dir.strip_prefix("~/") {
            Some(stripped) => dirs::home_dir()
                .map(|home| home.join(stripped))
                .unwrap_or_else(|| PathBuf::from(&cache_dir)),
            None => PathBuf::from(&cache_dir),
        };
        if !path.exists() {
            fs::create_dir_all(&path)?;
        }
        return Ok(path);
    }
    cache_base_dir().map(|dir| dir.join(default_subdir))
}

pub fn calculate_md5(path: &Path) -> Result<String> {
    let contents = fs::read(path)?;
    Ok(calculate_md5_bytes(&contents))
}

pub fn calculate_md5_bytes(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

pub fn verify_checksum(path: &Path, expected_md5: &str) -> Result<bool> {
    Ok(calculate_md5(path)?.eq_ignore_ascii_case(expected_md5))
}

/// Number of files and total size in MB directly under `dir`.
pub fn cache_info(dir: &Path) -> Result<(usize, f64)> {
    let mut count = 0;
    let mut bytes = 0u64;
    for entry in fs::read_dir(dir)? {
        let metadata = entry?.metadata()?;
        if metadata.is_file() {
            count += 1;
            bytes += metadata.len();
        }
    }
    Ok((count, bytes as f64 / (1024.0 * 1024.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn test_md5_of_file_and_bytes_agree() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("weights.onnx");
        fs::write(&file_path, "hello world").unwrap();

        assert_eq!(calculate_md5(&file_path).unwrap(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(calculate_md5_bytes(b"hello world"), "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert!(verify_checksum(&file_path, "5EB63BBBE01EEED093CB22BB8F5ACDC3").unwrap());
    }

    #[test]
    fn test_cache_info_counts_files() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("a.onnx"), vec![0u8; 1024]).unwrap();
        fs::write(temp_dir.path().join("b.onnx"), vec![0u8; 1024]).unwrap();
        fs::create_dir(temp_dir.path().join("nested")).unwrap();

        let (count, size_mb) = cache_info(temp_dir.path()).unwrap();
        assert_eq!(count, 2);
        assert!((size_mb - 2.0 / 1024.0).abs() < 1e-9);
    }

    #[test]
    #[serial]
    fn test_model_cache_dir_env_override() {
        let original = std::env::var(MODEL_CACHE_ENV);
        let temp_dir = tempdir().unwrap();
        let custom = temp_dir.path().join("models");

        std::env::set_var(MODEL_CACHE_ENV, &custom);
        let resolved = model_cache_dir().unwrap();
        assert_eq!(resolved, custom);
        assert!(custom.exists());

        std::env::remove_var(MODEL_CACHE_ENV);
        let default = model_cache_dir().unwrap();
        assert!(default.to_string_lossy().contains("fundus-screen"));

        match original {
            Ok(val) => std::env::set_var(MODEL_CACHE_ENV, val),
            Err(_) => std::env::remove_var(MODEL_CACHE_ENV),
        }
    }
}
