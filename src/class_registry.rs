//! Class lists and model input geometry per screening task.
//!
//! The registry is loaded from a TOML file when one is given. A missing or
//! invalid file never fails the caller: it is logged and the built-in
//! defaults are used instead.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which screening model is being served.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Softmax over disease classes
    #[default]
    Disease,
    /// Two-way myopia / normal softmax
    Myopia,
    /// Spherical-equivalent regression in diopters
    Refraction,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Disease => "disease",
            TaskKind::Myopia => "myopia",
            TaskKind::Refraction => "refraction",
        }
    }

    /// Upper-case name used in environment variable overrides.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            TaskKind::Disease => "DISEASE",
            TaskKind::Myopia => "MYOPIA",
            TaskKind::Refraction => "REFRACTION",
        }
    }

    pub fn is_regression(&self) -> bool {
        matches!(self, TaskKind::Refraction)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassRegistry {
    pub task: TaskKind,
    /// Output order of the model head
    pub class_names: Vec<String>,
    /// Model input `(width, height)`
    #[serde(default = "default_input_size")]
    pub input_size: (u32, u32),
    /// Prior used by the fallback predictor, same order as `class_names`
    pub fallback_weights: Vec<f32>,
}

fn default_input_size() -> (u32, u32) {
    (224, 224)
}

impl ClassRegistry {
    pub fn defaults(task: TaskKind) -> Self {
        let (names, weights): (&[&str], Vec<f32>) = match task {
            TaskKind::Disease => (
                &["cataract", "diabetic_retinopathy", "glaucoma", "normal"],
                vec![0.15, 0.20, 0.15, 0.50],
            ),
            // Refraction maps the regressed value onto the same two labels
            TaskKind::Myopia | TaskKind::Refraction => (&["myopia", "normal"], vec![0.4, 0.6]),
        };
        Self {
            task,
            class_names: names.iter().map(|s| s.to_string()).collect(),
            input_size: default_input_size(),
            fallback_weights: weights,
        }
    }

    /// Load the registry for `task`, falling back to defaults on any problem.
    pub fn load_or_default(path: Option<&Path>, task: TaskKind) -> Self {
        let Some(path) = path else {
            return Self::defaults(task);
        };
        match Self::from_toml_file(path) {
            Ok(registry) if registry.task == task => {
                log::debug!(
                    "Loaded {} class registry from {}: {:?}",
                    task,
                    path.display(),
                    registry.class_names
                );
                registry
            }
            Ok(registry) => {
                log::warn!(
                    "Class registry {} is for task '{}', expected '{}'; using defaults",
                    path.display(),
                    registry.task,
                    task
                );
                Self::defaults(task)
            }
            Err(e) => {
                log::warn!("Ignoring class registry {}: {e:#}", path.display());
                Self::defaults(task)
            }
        }
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read class registry: {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let registry: ClassRegistry =
            toml::from_str(content).context("Failed to parse class registry")?;
        registry.check()?;
        Ok(registry)
    }

    fn check(&self) -> Result<()> {
        if self.class_names.is_empty() {
            bail!("Class registry has no classes");
        }
        if self.fallback_weights.len() != self.class_names.len() {
            bail!(
                "Class registry has {} classes but {} fallback weights",
                self.class_names.len(),
                self.fallback_weights.len()
            );
        }
        if self.fallback_weights.iter().any(|w| !w.is_finite() || *w < 0.0)
            || self.fallback_weights.iter().sum::<f32>() <= 0.0
        {
            bail!("Fallback weights must be non-negative with a positive sum");
        }
        if self.input_size.0 == 0 || self.input_size.1 == 0 {
            bail!("Input size must be non-zero");
        }
        if self.task.is_regression() && self.class_names.len() != 2 {
            return Err(anyhow!(
                "Refraction registry needs exactly two labels (below and above the cut-off), got {}",
                self.class_names.len()
            ));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.class_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.class_names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.class_names.iter().position(|n| n == name)
    }

    /// Class with the largest fallback weight (first on ties).
    pub fn dominant_class(&self) -> &str {
        let mut best = 0;
        for (i, w) in self.fallback_weights.iter().enumerate() {
            if *w > self.fallback_weights[best] {
                best = i;
            }
        }
        &self.class_names[best]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let disease = ClassRegistry::defaults(TaskKind::Disease);
        assert_eq!(disease.len(), 4);
        assert_eq!(disease.dominant_class(), "normal");
        assert_eq!(disease.input_size, (224, 224));

        let refraction = ClassRegistry::defaults(TaskKind::Refraction);
        assert_eq!(refraction.class_names, vec!["myopia", "normal"]);
    }

    #[test]
    fn test_parse_custom_registry() {
        let registry = ClassRegistry::from_toml_str(
            r#"
            task = "disease"
            class_names = ["amd", "normal"]
            input_size = [256, 256]
            fallback_weights = [0.3, 0.7]
            "#,
        )
        .unwrap();
        assert_eq!(registry.index_of("amd"), Some(0));
        assert_eq!(registry.input_size, (256, 256));
    }

    #[test]
    fn test_mismatched_weights_rejected() {
        let err = ClassRegistry::from_toml_str(
            r#"
            task = "myopia"
            class_names = ["myopia", "normal"]
            fallback_weights = [1.0]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("fallback weights"));
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is = = not toml").unwrap();
        let registry = ClassRegistry::load_or_default(Some(file.path()), TaskKind::Myopia);
        assert_eq!(registry, ClassRegistry::defaults(TaskKind::Myopia));
    }

    #[test]
    fn test_task_mismatch_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "task = \"myopia\"\nclass_names = [\"a\", \"b\"]\nfallback_weights = [0.5, 0.5]"
        )
        .unwrap();
        let registry = ClassRegistry::load_or_default(Some(file.path()), TaskKind::Disease);
        assert_eq!(registry, ClassRegistry::defaults(TaskKind::Disease));
    }
}
