//! `lko ask`: plan probes for a question, run them, print what they found.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::incidents::{JsonlLog, QueryEntry};
use crate::planner::{LlmPlanner, Planner};
use crate::tools::{truncate, PlanRun, ToolExecutor};

/// Output shown per tool before truncation.
const DISPLAY_LIMIT: usize = 1000;

/// Plan and execute `query`, appending the outcome to the query log.
pub async fn ask(
    planner: &dyn Planner,
    executor: &ToolExecutor,
    log: &JsonlLog,
    query: &str,
) -> Result<PlanRun> {
    let plan = match planner.plan(query).await {
        Ok(plan) => plan,
        Err(failure) => bail!("Planning error: {}", failure),
    };
    println!("Plan");
    println!("  Goal:      {}", plan.goal);
    println!("  Tools:     {}", plan.tools.join(", "));
    println!("  Reasoning: {}", plan.reasoning);
    println!();

    let run = executor.execute_plan(&plan).await;
    if let Err(e) = log.append(&QueryEntry::new(query, &plan, &run)) {
        tracing::warn!("failed to append query log: {:#}", e);
    }
    Ok(run)
}

pub async fn run_ask(config: &Config, query: &str) -> Result<()> {
    if query.trim().is_empty() {
        bail!("query must not be empty");
    }
    let planner = LlmPlanner::new(config.llm.clone(), config.tools.allowed_tools.clone());
    let executor = ToolExecutor::from_config(config);
    let log = JsonlLog::new(config.logs.queries_path());

    println!("Query: {}", query);
    println!();
    let run = ask(&planner, &executor, &log, query).await?;
    print_run(&run);
    Ok(())
}

fn print_run(run: &PlanRun) {
    println!("{}", "=".repeat(60));
    println!("RESULTS");
    println!("{}", "=".repeat(60));
    for result in &run.results {
        let status = if result.success { "ok" } else { "FAILED" };
        println!();
        println!("[{}] {}", status, result.tool.to_uppercase());
        println!("{}", "-".repeat(60));
        let shown = truncate(&result.output, DISPLAY_LIMIT);
        println!("{}", shown);
        if shown.len() < result.output.len() {
            println!();
            println!("... (truncated, {} total chars)", result.output.chars().count());
        }
    }
    println!();
    println!("{}", "=".repeat(60));
    println!(
        "Completed: {} tools executed, {} succeeded",
        run.tools_executed(),
        run.success_count()
    );
}
