//! Diagnostic probes and the plan executor.
//!
//! Most tools are fixed shell pipelines; `network_status` and
//! `container_status` build their reports in-process. Only names on both
//! the built-in list and `[tools].allowed_tools` can run. With
//! `[safety].dry_run` set, probes are reported but not executed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::config::{Config, ContainersConfig, NetworkConfig, ToolsConfig};
use crate::models::ExecutionMode;
use crate::planner::Plan;
use crate::{containers, network, subprocess};

const STDERR_LIMIT: usize = 1000;
const TIMEOUT_OUTPUT: &str = "Command timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolKind {
    Shell(&'static str),
    Network,
    Containers,
}

/// Built-in tools.
const PROBES: [(&str, ToolKind); 7] = [
    ("disk_usage", ToolKind::Shell("df -h")),
    (
        "cpu_load",
        ToolKind::Shell("uptime && (mpstat 1 1 2>/dev/null || top -bn1 | head -20)"),
    ),
    ("memory_status", ToolKind::Shell("free -h")),
    ("process_list", ToolKind::Shell("ps aux --sort=-%mem | head -20")),
    (
        "recent_errors",
        ToolKind::Shell(
            "journalctl -b 0 -p err --no-pager -n 100 2>/dev/null || tail -100 /var/log/syslog | grep -i error",
        ),
    ),
    ("network_status", ToolKind::Network),
    ("container_status", ToolKind::Containers),
];

/// Human description of a probe, used in planner prompts.
pub fn describe(tool: &str) -> &'static str {
    match tool {
        "disk_usage" => "Check disk space usage across filesystems",
        "cpu_load" => "Check CPU load and performance metrics",
        "memory_status" => "Check RAM and swap memory usage",
        "process_list" => "List top memory-consuming processes",
        "recent_errors" => "Get recent system error logs",
        "network_status" => "Check interfaces, gateway reachability, DNS and open connections",
        "container_status" => "Check Docker containers for failures and resource hogs",
        _ => "",
    }
}

fn tool_kind(tool: &str) -> Option<ToolKind> {
    PROBES.iter().find(|(name, _)| *name == tool).map(|(_, p)| *p)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShellOutcome {
    pub success: bool,
    pub output: String,
}

/// Run `cmd` under `sh -c`, bounded by `timeout` and `max_output` bytes of
/// stdout. On a non-zero exit the head of stderr is appended. A timeout
/// kills everything `cmd` started.
pub async fn run_shell(cmd: &str, timeout: Duration, max_output: usize) -> ShellOutcome {
    match subprocess::run_bounded(subprocess::sh(cmd), timeout).await {
        Ok(None) => ShellOutcome {
            success: false,
            output: TIMEOUT_OUTPUT.to_string(),
        },
        Err(e) => ShellOutcome {
            success: false,
            output: format!("Error: {}", e),
        },
        Ok(Some(out)) => {
            let stdout = String::from_utf8_lossy(&out.stdout);
            let mut output = truncate(&stdout, max_output).to_string();
            if !out.status.success() {
                let stderr = String::from_utf8_lossy(&out.stderr);
                output.push_str("\nError: ");
                output.push_str(truncate(&stderr, STDERR_LIMIT));
            }
            ShellOutcome {
                success: out.status.success(),
                output,
            }
        }
    }
}

/// Longest prefix of `s` at most `max` bytes that ends on a char boundary.
pub fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub tool: String,
    pub success: bool,
    pub output: String,
    pub timestamp: DateTime<Utc>,
    pub dry_run: bool,
}

/// Results of running every tool in a plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanRun {
    pub goal: String,
    pub results: Vec<ToolResult>,
    pub timestamp: DateTime<Utc>,
}

impl PlanRun {
    pub fn tools_executed(&self) -> usize {
        self.results.len()
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }
}

pub struct ToolExecutor {
    config: ToolsConfig,
    network: NetworkConfig,
    containers: ContainersConfig,
    mode: ExecutionMode,
    log_actions: bool,
}

impl ToolExecutor {
    pub fn new(config: ToolsConfig, mode: ExecutionMode) -> Self {
        Self {
            config,
            network: NetworkConfig::default(),
            containers: ContainersConfig::default(),
            mode,
            log_actions: true,
        }
    }

    /// Executor for the full agent configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            network: config.network.clone(),
            containers: config.containers.clone(),
            log_actions: config.safety.log_all_actions,
            ..Self::new(config.tools.clone(), config.execution_mode())
        }
    }

    fn is_allowed(&self, tool: &str) -> bool {
        self.config.allowed_tools.iter().any(|t| t == tool)
    }

    pub async fn execute_tool(&self, tool: &str) -> ToolResult {
        let result = |success, output: String, dry_run| ToolResult {
            tool: tool.to_string(),
            success,
            output,
            timestamp: Utc::now(),
            dry_run,
        };

        let Some(kind) = tool_kind(tool).filter(|_| self.is_allowed(tool)) else {
            return result(false, format!("Unknown tool: {}", tool), false);
        };
        if self.mode.is_dry_run() {
            return result(true, format!("DRY RUN: Would execute {}", tool), true);
        }

        let outcome = self.run_kind(kind).await;
        result(outcome.success, outcome.output, false)
    }

    async fn run_kind(&self, kind: ToolKind) -> ShellOutcome {
        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let report = match kind {
            ToolKind::Shell(cmd) => return run_shell(cmd, timeout, self.config.max_output_size).await,
            ToolKind::Network => {
                let request = network::ReportRequest::from_config(&self.network);
                let collect = network::collect_report(&self.network, &request);
                match tokio::time::timeout(timeout, collect).await {
                    Err(_) => return timed_out(),
                    Ok(r) => r.map(|r| network::render(&r)),
                }
            }
            ToolKind::Containers => {
                match tokio::time::timeout(timeout, containers::collect_report(&self.containers)).await {
                    Err(_) => return timed_out(),
                    Ok(r) => r.map(|r| containers::render(&r)),
                }
            }
        };
        match report {
            Ok(text) => ShellOutcome {
                success: true,
                output: truncate(&text, self.config.max_output_size).to_string(),
            },
            Err(e) => ShellOutcome {
                success: false,
                output: format!("Error: {:#}", e),
            },
        }
    }

    /// Run the plan's tools in order. With `[safety].log_all_actions` each
    /// tool is logged at info, otherwise at debug.
    pub async fn execute_plan(&self, plan: &Plan) -> PlanRun {
        let mut results = Vec::with_capacity(plan.tools.len());
        for tool in &plan.tools {
            let r = self.execute_tool(tool).await;
            if self.log_actions {
                tracing::info!(tool = %r.tool, success = r.success, dry_run = r.dry_run, "executed tool");
            } else {
                tracing::debug!(tool = %r.tool, success = r.success, dry_run = r.dry_run, "executed tool");
            }
            results.push(r);
        }
        PlanRun {
            goal: plan.goal.clone(),
            results,
            timestamp: Utc::now(),
        }
    }
}

fn timed_out() -> ShellOutcome {
    ShellOutcome {
        success: false,
        output: TIMEOUT_OUTPUT.to_string(),
    }
}
