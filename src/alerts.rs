//! Alert delivery.
//!
//! [`AlertSink`] is the seam the runbook engine and the daemon raise alerts
//! through. Delivery is fire-and-forget: a sink never reports failure to its
//! caller.
//!
//! [`AlertSystem`] is the default sink. It appends one line per alert to the
//! alert log:
//!
//! ```text
//! [WARNING] 2026-03-02 14:05:11 - Resource Hog Detected: Process stress (PID 4242): CPU: 97.0%
//! ```
//!
//! and, when `[alerts].desktop` is set, raises a desktop notification via
//! `notify-send`.

use async_trait::async_trait;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::AlertsConfig;
use crate::models::Severity;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Metric families with a critical threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Disk,
    Memory,
    Cpu,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver one alert. Failures are swallowed.
    async fn send(&self, kind: &str, message: &str, severity: Severity);

    async fn resource_hog(&self, pid: u32, name: &str, reason: &str) {
        self.send(
            "Resource Hog Detected",
            &format!("Process {} (PID {}): {}", name, pid, reason),
            Severity::Warning,
        )
        .await
    }

    async fn high_disk(&self, filesystem: &str, usage_percent: f64) {
        let severity = if usage_percent >= 95.0 {
            Severity::Critical
        } else {
            Severity::Warning
        };
        self.send(
            "High Disk Usage",
            &format!("{} is {:.1}% full", filesystem, usage_percent),
            severity,
        )
        .await
    }

    async fn high_memory(&self, usage_percent: f64) {
        let severity = if usage_percent >= 90.0 {
            Severity::Critical
        } else {
            Severity::Warning
        };
        self.send(
            "High Memory Usage",
            &format!("System memory at {:.1}%", usage_percent),
            severity,
        )
        .await
    }
}

impl AlertsConfig {
    /// Whether `value` reaches the critical threshold for `metric`.
    pub fn should_alert(&self, metric: Metric, value: f64) -> bool {
        let threshold = match metric {
            Metric::Disk => self.critical_disk_threshold,
            Metric::Memory => self.critical_memory_threshold,
            Metric::Cpu => self.critical_cpu_threshold,
        };
        value >= threshold
    }
}

/// File log plus optional desktop notifications.
pub struct AlertSystem {
    config: AlertsConfig,
    log_path: PathBuf,
}

impl AlertSystem {
    pub fn new(config: AlertsConfig, log_path: PathBuf) -> Self {
        Self { config, log_path }
    }

    pub fn should_alert(&self, metric: Metric, value: f64) -> bool {
        self.config.should_alert(metric, value)
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{}", line)
    }

    async fn notify_desktop(&self, kind: &str, message: &str, severity: Severity) {
        let urgency = if severity == Severity::Critical {
            "critical"
        } else {
            "normal"
        };
        let child = tokio::process::Command::new("notify-send")
            .arg("-u")
            .arg(urgency)
            .arg(format!("LKO Agent: {}", kind))
            .arg(message)
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(NOTIFY_TIMEOUT, child).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::debug!("notify-send unavailable: {}", e),
            Err(_) => tracing::debug!("notify-send timed out"),
        }
    }
}

/// Format one alert-log line.
pub fn format_alert(kind: &str, message: &str, severity: Severity) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    format!("[{}] {} - {}: {}", severity, timestamp, kind, message)
}

#[async_trait]
impl AlertSink for AlertSystem {
    async fn send(&self, kind: &str, message: &str, severity: Severity) {
        if !self.config.enabled {
            return;
        }
        let line = format_alert(kind, message, severity);
        if let Err(e) = self.append(&line) {
            tracing::warn!("failed to write alert log {}: {}", self.log_path.display(), e);
        }
        match severity {
            Severity::Critical => tracing::error!("{}: {}", kind, message),
            Severity::Warning => tracing::warn!("{}: {}", kind, message),
            Severity::Info => tracing::info!("{}: {}", kind, message),
        }
        if self.config.desktop {
            self.notify_desktop(kind, message, severity).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Captures alerts for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        pub alerts: Mutex<Vec<(String, String, Severity)>>,
    }

    impl RecordingSink {
        pub fn taken(&self) -> Vec<(String, String, Severity)> {
            self.alerts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn send(&self, kind: &str, message: &str, severity: Severity) {
            self.alerts
                .lock()
                .unwrap()
                .push((kind.to_string(), message.to_string(), severity));
        }
    }
}
