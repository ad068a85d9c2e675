//! Write-only persistence of verdicts.

use crate::calibration::Verdict;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait VerdictSink: Send + Sync {
    fn record(&self, session_id: &str, verdict: &Verdict) -> Result<()>;
}

#[derive(Serialize)]
struct Record<'a> {
    session_id: &'a str,
    recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    verdict: &'a Verdict,
}

/// Appends one JSON object per verdict to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open verdict log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VerdictSink for JsonLinesSink {
    fn record(&self, session_id: &str, verdict: &Verdict) -> Result<()> {
        let record = Record {
            session_id,
            recorded_at: Utc::now(),
            verdict,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("verdict log lock poisoned"))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to write to {}", self.path.display()))?;
        file.flush()?;
        Ok(())
    }
}
