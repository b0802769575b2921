//! Agent statistics: incident memory, logs and runbooks at a glance.
//!
//! Used by `lko stats` to confirm the daemon is recording what it sees.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::incidents::JsonlLog;
use crate::logs::MANAGED_LOGS;
use crate::runbook::load_runbooks;
use crate::search::open_store;

/// Size and line count of one managed log.
struct LogStats {
    name: &'static str,
    bytes: u64,
    lines: Option<usize>,
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let vec_path = store.paths().map(|p| p.vectors.clone());
    let store_size = vec_path
        .as_deref()
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    let (runbooks, runbook_err) = load_runbooks(&config.runbooks.path);
    let enabled = runbooks.iter().filter(|r| r.enabled).count();

    println!("LKO Agent - Stats");
    println!("=================");
    println!();
    println!("  Mode:        {}", config.execution_mode());
    println!("  Memory:      {}", config.memory.dir.display());
    println!("  Incidents:   {}", store.count());
    println!("  Embedding:   {} ({} dims)", store.model_name(), store.dims());
    println!("  Index size:  {}", format_bytes(store_size));
    println!();
    println!("  Runbooks:    {} ({} enabled)", runbooks.len(), enabled);
    if let Some(e) = runbook_err {
        println!("  Runbook error: {}", e);
    }

    let logs = collect_log_stats(&config.logs.dir);
    println!();
    println!("  Logs in {}:", config.logs.dir.display());
    println!("  {:<18} {:>10} {:>8}", "FILE", "SIZE", "LINES");
    println!("  {}", "-".repeat(38));
    for log in &logs {
        let lines = log
            .lines
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  {:<18} {:>10} {:>8}", log.name, format_bytes(log.bytes), lines);
    }
    println!();
    Ok(())
}

fn collect_log_stats(dir: &Path) -> Vec<LogStats> {
    MANAGED_LOGS
        .iter()
        .map(|name| {
            let path: PathBuf = dir.join(name);
            let bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let lines = if name.ends_with(".jsonl") {
                JsonlLog::new(&path).len().ok()
            } else {
                None
            };
            LogStats { name, bytes, lines }
        })
        .collect()
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
