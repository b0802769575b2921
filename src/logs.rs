//! Log rotation and cleanup for the agent's log directory.
//!
//! A log over the size limit is renamed to `<name>.old`, replacing any
//! previous `.old`. Rotated files older than the age limit are deleted.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

use crate::config::LogsConfig;

/// Logs the agent writes into its log directory.
pub const MANAGED_LOGS: [&str; 5] = [
    "agent.log",
    "alerts.log",
    "incidents.jsonl",
    "queries.jsonl",
    "daemon.log",
];

const ROTATED_PATTERNS: [&str; 2] = ["*.log.old", "*.jsonl.old"];

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RotationReport {
    pub rotated: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

pub struct LogRotation {
    max_size_bytes: u64,
    max_age: Duration,
    rotated_set: GlobSet,
}

impl LogRotation {
    pub fn new(max_size_bytes: u64, max_age: Duration) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in ROTATED_PATTERNS {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            max_size_bytes,
            max_age,
            rotated_set: builder.build()?,
        })
    }

    pub fn from_config(config: &LogsConfig) -> Result<Self> {
        Self::new(
            config.max_size_mb * 1024 * 1024,
            Duration::from_secs(config.max_age_days * 24 * 60 * 60),
        )
    }

    /// Rotate `path` if it is larger than the size limit.
    pub fn rotate_if_needed(&self, path: &Path) -> Result<bool> {
        let size = match std::fs::metadata(path) {
            Ok(m) => m.len(),
            Err(_) => return Ok(false),
        };
        if size <= self.max_size_bytes {
            return Ok(false);
        }

        let mut old = path.as_os_str().to_owned();
        old.push(".old");
        let old = PathBuf::from(old);
        if old.exists() {
            std::fs::remove_file(&old)
                .with_context(|| format!("Failed to remove {}", old.display()))?;
        }
        std::fs::rename(path, &old)
            .with_context(|| format!("Failed to rotate {}", path.display()))?;
        tracing::info!(
            "rotated {} ({:.1}MB)",
            path.display(),
            size as f64 / 1024.0 / 1024.0
        );
        Ok(true)
    }

    /// Delete rotated logs in `dir` last modified before the age limit.
    pub fn cleanup_old_logs(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let cutoff = SystemTime::now()
            .checked_sub(self.max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = Vec::new();
        for entry in WalkDir::new(dir).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() || !self.rotated_set.is_match(entry.file_name()) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            if modified < cutoff {
                std::fs::remove_file(entry.path())
                    .with_context(|| format!("Failed to remove {}", entry.path().display()))?;
                removed.push(entry.path().to_path_buf());
            }
        }
        removed.sort();
        Ok(removed)
    }

    /// Rotate every managed log in `dir`, then clean up old rotations.
    pub fn rotate_all(&self, dir: &Path) -> Result<RotationReport> {
        let mut report = RotationReport::default();
        for name in MANAGED_LOGS {
            let path = dir.join(name);
            if self.rotate_if_needed(&path)? {
                report.rotated.push(path);
            }
        }
        report.removed = self.cleanup_old_logs(dir)?;
        Ok(report)
    }
}
