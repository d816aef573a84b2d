//! Raw per-attempt agent output and metadata under `sessions/<id>/logs/`.
//!
//! These are product artifacts: always written, independent of `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

/// Metadata written next to an attempt's raw log.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta {
    pub iteration: u32,
    pub attempt: u32,
    pub model: String,
    pub sandbox: String,
    /// Classification label (`clean`, `stalled`, `rate_limited`, ...).
    pub outcome: String,
    pub exit_code: Option<i32>,
    pub output_bytes: u64,
    pub duration_ms: u64,
    pub started_at: String,
    pub prompt_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub log_path: PathBuf,
    pub meta_path: PathBuf,
}

impl AttemptPaths {
    /// `iteration-<n>.log` for the first attempt, `iteration-<n>.retry-<a>.log`
    /// for same-iteration retries.
    pub fn iteration(logs_dir: &Path, iteration: u32, attempt: u32) -> Self {
        let stem = if attempt == 0 {
            format!("iteration-{iteration}")
        } else {
            format!("iteration-{iteration}.retry-{attempt}")
        };
        Self::with_stem(logs_dir, &stem)
    }

    pub fn validator(logs_dir: &Path, iteration: u32) -> Self {
        Self::with_stem(logs_dir, &format!("validator-{iteration}"))
    }

    fn with_stem(logs_dir: &Path, stem: &str) -> Self {
        Self {
            log_path: logs_dir.join(format!("{stem}.log")),
            meta_path: logs_dir.join(format!("{stem}.json")),
        }
    }

    pub fn write_meta(&self, meta: &AttemptMeta) -> Result<()> {
        if let Some(parent) = self.meta_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let mut buf = serde_json::to_string_pretty(meta).context("serialize attempt meta")?;
        buf.push('\n');
        fs::write(&self.meta_path, buf)
            .with_context(|| format!("write {}", self.meta_path.display()))
    }
}
