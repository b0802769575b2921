//! Core data models shared across the agent.
//!
//! These types describe what the agent observes about the host and how
//! side effects are carried out (live or simulated).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether side-effecting operations are performed or only simulated.
///
/// A single value is threaded through the remediation escalator and the
/// runbook engine so every side effect is gated in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Live,
    DryRun,
}

impl ExecutionMode {
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run {
            ExecutionMode::DryRun
        } else {
            ExecutionMode::Live
        }
    }

    pub fn is_dry_run(self) -> bool {
        self == ExecutionMode::DryRun
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Live => write!(f, "live"),
            ExecutionMode::DryRun => write!(f, "dry-run"),
        }
    }
}

/// Alert severity, serialized upper-case (`INFO`, `WARNING`, `CRITICAL`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Usage of a single mounted filesystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub filesystem: String,
    pub usage_percent: f64,
}

/// Live observation that runbook triggers are evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationContext {
    #[serde(default)]
    pub disk_usage: Vec<DiskUsage>,
    /// System memory usage in percent.
    #[serde(default)]
    pub memory_usage: Option<f64>,
}

impl ObservationContext {
    pub fn disk(&self, filesystem: &str) -> Option<&DiskUsage> {
        self.disk_usage.iter().find(|d| d.filesystem == filesystem)
    }
}

/// A process consuming more CPU or memory than the configured thresholds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceHog {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    /// Human-readable reasons, e.g. `"CPU: 97.0%"`.
    pub reasons: Vec<String>,
}

impl ResourceHog {
    pub fn reason(&self) -> String {
        self.reasons.join(", ")
    }
}
