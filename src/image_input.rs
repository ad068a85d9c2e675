//! Expands CLI sources (files, directories, glob patterns) into image paths.

use anyhow::{anyhow, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::color_utils::symbols;

/// How strictly sources are checked
#[derive(Debug, Clone)]
pub struct ImageInputConfig {
    pub require_glob_matches: bool,
    pub strict_mode: bool,
}

impl Default for ImageInputConfig {
    fn default() -> Self {
        Self::strict()
    }
}

impl ImageInputConfig {
    pub fn strict() -> Self {
        Self {
            strict_mode: true,
            require_glob_matches: true,
        }
    }

    /// Warn and skip instead of failing
    pub fn permissive() -> Self {
        Self {
            strict_mode: false,
            require_glob_matches: false,
        }
    }

    pub fn from_strict_flag(strict: bool) -> Self {
        if strict {
            Self::strict()
        } else {
            Self::permissive()
        }
    }
}

/// One image to process and the CLI source that produced it
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ImageSource {
    pub path: PathBuf,
    pub source: String,
    pub source_type: SourceType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SourceType {
    File,
    Directory,
    Glob,
}

impl SourceType {
    pub fn classify(source: &str) -> Self {
        if Path::new(source).is_dir() {
            SourceType::Directory
        } else if source.contains(['*', '?', '[']) {
            SourceType::Glob
        } else {
            SourceType::File
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::File => "file",
            SourceType::Directory => "directory",
            SourceType::Glob => "glob",
        }
    }
}

/// Decodable photograph extensions (case-insensitive)
pub fn is_supported_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| {
            matches!(
                ext.as_str(),
                "jpg" | "jpeg" | "png" | "webp" | "bmp" | "tiff" | "tif"
            )
        })
}

/// Image files directly inside `dir_path`, sorted
pub fn find_images_in_directory(dir_path: &Path) -> Result<Vec<PathBuf>> {
    let mut image_files = Vec::new();
    for entry in fs::read_dir(dir_path)? {
        let path = entry?.path();
        if path.is_file() && is_supported_image_file(&path) {
            image_files.push(path);
        }
    }
    image_files.sort();
    Ok(image_files)
}

fn missing(source: &str, message: &str, config: &ImageInputConfig) -> Result<()> {
    if config.strict_mode {
        Err(anyhow!("{message}: {source}"))
    } else {
        log::warn!("{}{message}: {source}", symbols::warning());
        Ok(())
    }
}

/// Collect images from every source, sorted and deduplicated by path
pub fn collect_images_from_sources(sources: &[String], config: &ImageInputConfig) -> Result<Vec<ImageSource>> {
    let mut found: Vec<ImageSource> = Vec::new();
    let mut push = |path: PathBuf, source: &str, source_type: SourceType| {
        found.push(ImageSource {
            path,
            source: source.to_string(),
            source_type,
        })
    };

    for source in sources {
        let source_path = Path::new(source);
        match SourceType::classify(source) {
            SourceType::Directory => {
                for path in find_images_in_directory(source_path)? {
                    push(path, source, SourceType::Directory);
                }
            }
            SourceType::File if source_path.is_file() => {
                if is_supported_image_file(source_path) {
                    push(source_path.to_path_buf(), source, SourceType::File);
                } else if config.strict_mode {
                    return Err(anyhow!(
                        "File is not a supported image format: {}",
                        source_path.display()
                    ));
                }
            }
            SourceType::File => missing(source, "File does not exist", config)?,
            SourceType::Glob => match glob::glob(source) {
                Ok(paths) => {
                    let mut found_any = false;
                    for entry in paths {
                        match entry {
                            Ok(path) if path.is_file() && is_supported_image_file(&path) => {
                                push(path, source, SourceType::Glob);
                                found_any = true;
                            }
                            Ok(_) => {}
                            Err(e) => log::warn!(
                                "{}Error reading path in glob {source}: {e}",
                                symbols::warning()
                            ),
                        }
                    }
                    if !found_any && config.require_glob_matches {
                        return Err(anyhow!("No image files found matching pattern: {source}"));
                    }
                }
                Err(_) => missing(source, "Source path does not exist and is not a valid glob pattern", config)?,
            },
        }
    }

    found.sort_by(|a, b| a.path.cmp(&b.path));
    found.dedup_by(|a, b| a.path == b.path);

    if found.is_empty() && config.strict_mode {
        return Err(anyhow!("No image files found in the specified sources"));
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_is_supported_image_file() {
        assert!(is_supported_image_file(Path::new("eye.jpg")));
        assert!(is_supported_image_file(Path::new("EYE.TIF")));
        assert!(is_supported_image_file(Path::new("eye.webp")));
        assert!(!is_supported_image_file(Path::new("eye.dcm")));
        assert!(!is_supported_image_file(Path::new("eye")));
    }

    #[test]
    fn test_directory_and_file_sources_are_deduplicated() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.jpg");
        fs::write(&a, b"not decoded here").unwrap();
        fs::write(dir.path().join("b.png"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let sources = vec![
            dir.path().to_string_lossy().to_string(),
            a.to_string_lossy().to_string(),
        ];
        let images = collect_images_from_sources(&sources, &ImageInputConfig::strict()).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].path, a);
    }

    #[test]
    fn test_glob_source() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("left.jpg"), b"x").unwrap();
        fs::write(dir.path().join("right.jpg"), b"x").unwrap();
        fs::write(dir.path().join("scan.png"), b"x").unwrap();

        let pattern = dir.path().join("*.jpg").to_string_lossy().to_string();
        let images = collect_images_from_sources(&[pattern], &ImageInputConfig::strict()).unwrap();
        assert_eq!(images.len(), 2);
        assert!(images.iter().all(|i| i.source_type == SourceType::Glob));
    }

    #[test]
    fn test_strict_vs_permissive_missing_file() {
        let sources = vec!["/definitely/not/here.jpg".to_string()];
        assert!(collect_images_from_sources(&sources, &ImageInputConfig::strict()).is_err());
        let images = collect_images_from_sources(&sources, &ImageInputConfig::permissive()).unwrap();
        assert!(images.is_empty());
    }

    #[test]
    fn test_unsupported_file_only_fails_strict() {
        let dir = tempdir().unwrap();
        let text = dir.path().join("report.txt");
        fs::write(&text, b"x").unwrap();
        let sources = vec![text.to_string_lossy().to_string()];
        assert!(collect_images_from_sources(&sources, &ImageInputConfig::strict()).is_err());
        assert!(collect_images_from_sources(&sources, &ImageInputConfig::permissive())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_empty_glob_only_fails_strict() {
        let dir = tempdir().unwrap();
        let pattern = dir.path().join("*.png").to_string_lossy().to_string();
        assert!(collect_images_from_sources(&[pattern.clone()], &ImageInputConfig::strict()).is_err());
        assert!(collect_images_from_sources(&[pattern], &ImageInputConfig::permissive()).is_ok());
    }
}
