//! `lko runbooks list|check`.

use anyhow::{bail, Result};
use std::sync::Arc;

use crate::alerts::{AlertSink, AlertSystem};
use crate::config::Config;
use crate::models::ObservationContext;
use crate::observe::{Observer, SystemObserver};
use crate::runbook::{ExecutionResult, Runbook, RunbookEngine};

fn load_engine(config: &Config) -> Result<RunbookEngine> {
    let (engine, err) = RunbookEngine::load(&config.runbooks.path, config.runbooks.stop_on_failure);
    if let Some(e) = err {
        bail!(e);
    }
    Ok(engine)
}

/// One listing line per runbook.
pub fn describe(runbook: &Runbook) -> String {
    let state = if runbook.enabled { "" } else { " [disabled]" };
    let mut line = format!(
        "{}{}: when {} -> {} action{}",
        runbook.name,
        state,
        runbook.trigger,
        runbook.actions.len(),
        if runbook.actions.len() == 1 { "" } else { "s" }
    );
    if let Some(desc) = &runbook.description {
        line.push_str(&format!("\n    {}", desc));
    }
    line
}

pub fn run_list(config: &Config) -> Result<()> {
    let engine = load_engine(config)?;
    if engine.runbooks().is_empty() {
        println!("No runbooks in {}.", config.runbooks.path.display());
        return Ok(());
    }
    println!("Runbooks in {}:", config.runbooks.path.display());
    for runbook in engine.runbooks() {
        println!("  {}", describe(runbook));
    }
    Ok(())
}

fn print_context(ctx: &ObservationContext) {
    println!("Observed:");
    for disk in &ctx.disk_usage {
        println!("  disk {:<24} {:>5.1}%", disk.filesystem, disk.usage_percent);
    }
    match ctx.memory_usage {
        Some(mem) => println!("  memory {:>28.1}%", mem),
        None => println!("  memory unavailable"),
    }
    println!();
}

fn print_execution(result: &ExecutionResult) {
    println!("  {} ({})", result.runbook_name, result.mode);
    for (i, action) in result.actions.iter().enumerate() {
        let status = if action.success { "ok" } else { "FAILED" };
        println!("    {}. [{}] {}: {}", i + 1, status, action.kind, action.message);
    }
    if result.aborted {
        println!("    aborted after a failed action");
    }
}

/// Observe the host and show which runbooks would fire. With `run`, execute
/// them in the configured mode.
pub async fn run_check(config: &Config, run: bool) -> Result<()> {
    let engine = load_engine(config)?;
    let ctx = SystemObserver::new().observe().await?;
    print_context(&ctx);

    let matching = engine.find_matching(&ctx);
    if matching.is_empty() {
        println!("No runbooks triggered.");
        return Ok(());
    }
    println!("Triggered:");
    for runbook in &matching {
        println!("  {}", describe(runbook));
    }
    if !run {
        return Ok(());
    }

    println!();
    let alerts: Arc<dyn AlertSink> = Arc::new(AlertSystem::new(
        config.alerts.clone(),
        config.logs.alerts_path(),
    ));
    for runbook in matching {
        let result = engine
            .execute(runbook, &ctx, config.execution_mode(), alerts.as_ref())
            .await;
        print_execution(&result);
    }
    Ok(())
}
