//! `lko remediate` and `lko hogs`.

use anyhow::{bail, Result};
use clap::ValueEnum;

use crate::config::Config;
use crate::models::ExecutionMode;
use crate::observe::{Observer, SystemObserver};
use crate::remediation::{
    Escalator, ProcessControl, RemediationAttempt, TierResult, UnixProcessControl,
};

/// Which intervention `lko remediate` applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TierChoice {
    /// Escalate through the tiers as configured.
    Smart,
    Renice,
    Stop,
    Kill,
}

pub fn format_tier(result: &TierResult) -> String {
    let status = match (result.success, result.dry_run) {
        (true, true) => "would",
        (true, false) => "ok",
        (false, _) => "FAILED",
    };
    format!("[{}] {}: {}", status, result.tier, result.message)
}

pub async fn remediate(
    escalator: &Escalator,
    pid: u32,
    tier: TierChoice,
    mode: ExecutionMode,
) -> RemediationAttempt {
    let tiers = match tier {
        TierChoice::Smart => return escalator.smart_remediate(pid, mode).await,
        TierChoice::Renice => vec![escalator.renice(pid, mode)],
        TierChoice::Stop => vec![escalator.graceful_stop(pid, mode).await],
        TierChoice::Kill => vec![escalator.force_kill(pid, mode).await],
    };
    RemediationAttempt { pid, mode, tiers }
}

pub async fn run_remediate(config: &Config, pid: u32, live: bool, tier: TierChoice) -> Result<()> {
    if pid == std::process::id() {
        bail!("refusing to remediate the agent itself (PID {})", pid);
    }
    // A dry-run kill of a missing process would otherwise report success.
    if !UnixProcessControl.is_running(pid) {
        bail!("no process with PID {}", pid);
    }
    let mode = if live {
        ExecutionMode::Live
    } else {
        config.execution_mode()
    };
    let escalator = Escalator::unix(&config.remediation);

    println!("Remediating PID {} ({})", pid, mode);
    let attempt = remediate(&escalator, pid, tier, mode).await;
    for result in &attempt.tiers {
        println!("  {}", format_tier(result));
    }
    match attempt.resolved_by() {
        Some(t) => println!("Resolved by {}.", t),
        None => bail!("no tier succeeded for PID {}", pid),
    }
    Ok(())
}

pub async fn run_hogs(config: &Config, cpu: Option<f32>, mem: Option<f32>) -> Result<()> {
    let cpu = cpu.unwrap_or(config.daemon.cpu_threshold);
    let mem = mem.unwrap_or(config.daemon.memory_threshold);
    let hogs = SystemObserver::new().resource_hogs(cpu, mem).await?;
    if hogs.is_empty() {
        println!("No processes above CPU {}% or memory {}%.", cpu, mem);
        return Ok(());
    }
    println!("{:>8}  {:<24} {:>6} {:>6}  REASON", "PID", "NAME", "CPU%", "MEM%");
    for hog in &hogs {
        println!(
            "{:>8}  {:<24} {:>6.1} {:>6.1}  {}",
            hog.pid,
            hog.name,
            hog.cpu_percent,
            hog.memory_percent,
            hog.reason()
        );
    }
    Ok(())
}
