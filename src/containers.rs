//! Container monitoring through the docker (or compatible) CLI.
//!
//! Three read-only calls, each bounded by `[containers].timeout_secs`:
//!
//! - `ps -a --format '{{json .}}'`: every container and its state
//! - `stats --no-stream --format '{{json .}}'`: CPU / memory of running ones
//! - `inspect --format ...`: restart policy of exited containers
//!
//! Containers are never started, stopped or restarted from here.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;
use tokio::process::Command;

use crate::config::{Config, ContainersConfig};
use crate::subprocess;

const JSON_FORMAT: &str = "{{json .}}";
const RESTART_POLICY_FORMAT: &str = "{{.Name}} {{.HostConfig.RestartPolicy.Name}}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Unhealthy,
    Starting,
    /// No health check configured.
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    /// `running`, `exited`, `paused`, `restarting`, `created`, ...
    pub state: String,
    /// Free text such as `Up 2 hours (healthy)`.
    pub status: String,
    pub health: Health,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    names: String,
    image: String,
    #[serde(default)]
    state: String,
    status: String,
}

impl From<PsLine> for Container {
    fn from(line: PsLine) -> Self {
        let state = if line.state.is_empty() {
            state_from_status(&line.status).to_string()
        } else {
            line.state.to_lowercase()
        };
        Self {
            health: health_from_status(&line.status),
            id: line.id.chars().take(12).collect(),
            name: line.names.split(',').next().unwrap_or_default().to_string(),
            image: line.image,
            state,
            status: line.status,
        }
    }
}

/// Older engines omit `State`; recover it from the status text.
fn state_from_status(status: &str) -> &'static str {
    if status.contains("(Paused)") {
        "paused"
    } else if status.starts_with("Up") {
        "running"
    } else if status.starts_with("Restarting") {
        "restarting"
    } else if status.starts_with("Exited") {
        "exited"
    } else if status.starts_with("Created") {
        "created"
    } else {
        "unknown"
    }
}

fn health_from_status(status: &str) -> Health {
    if status.contains("(unhealthy)") {
        Health::Unhealthy
    } else if status.contains("(healthy)") {
        Health::Healthy
    } else if status.contains("(health: starting)") {
        Health::Starting
    } else {
        Health::None
    }
}

/// Parse `ps --format '{{json .}}'` output, one object per line.
pub fn parse_ps(text: &str) -> Result<Vec<Container>> {
    json_lines::<PsLine>(text)
        .map(|line| line.map(Container::from))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerStats {
    pub id: String,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// e.g. `120MiB / 1.5GiB`.
    pub memory_usage: String,
}

#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    #[serde(rename = "MemPerc")]
    mem_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
}

/// Parse `stats --no-stream --format '{{json .}}'` output.
pub fn parse_stats(text: &str) -> Result<Vec<ContainerStats>> {
    json_lines::<StatsLine>(text)
        .map(|line| {
            line.map(|l| ContainerStats {
                id: l.id.chars().take(12).collect(),
                name: l.name,
                cpu_percent: parse_percent(&l.cpu_perc),
                memory_percent: parse_percent(&l.mem_perc),
                memory_usage: l.mem_usage,
            })
        })
        .collect()
}

fn json_lines<T: for<'de> Deserialize<'de>>(text: &str) -> impl Iterator<Item = Result<T>> + '_ {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| {
            serde_json::from_str::<T>(l)
                .with_context(|| format!("unexpected container CLI output: {}", l))
        })
}

/// `"12.5%"` to `12.5`. Placeholders such as `"--"` read as zero.
fn parse_percent(s: &str) -> f64 {
    s.trim().trim_end_matches('%').parse().unwrap_or(0.0)
}

/// Container name to restart policy, from the inspect format above.
pub fn parse_restart_policies(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?.trim_start_matches('/').to_string();
            let policy = parts.next().unwrap_or("no").to_string();
            Some((name, policy))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerHog {
    pub id: String,
    pub name: String,
    pub reasons: Vec<String>,
    pub stats: ContainerStats,
}

/// Running containers strictly above either threshold.
pub fn find_container_hogs(
    stats: &[ContainerStats],
    cpu_threshold: f64,
    memory_threshold: f64,
) -> Vec<ContainerHog> {
    stats
        .iter()
        .filter_map(|s| {
            let mut reasons = Vec::new();
            if s.cpu_percent > cpu_threshold {
                reasons.push(format!("CPU: {:.1}%", s.cpu_percent));
            }
            if s.memory_percent > memory_threshold {
                reasons.push(format!("Memory: {:.1}%", s.memory_percent));
            }
            (!reasons.is_empty()).then(|| ContainerHog {
                id: s.id.clone(),
                name: s.name.clone(),
                reasons,
                stats: s.clone(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerIssue {
    pub id: String,
    pub name: String,
    pub state: String,
    pub problems: Vec<String>,
}

/// Containers that are unhealthy, restarting, or exited with nothing to
/// bring them back. A missing policy entry counts as `no`.
pub fn find_unhealthy(
    containers: &[Container],
    restart_policies: &HashMap<String, String>,
) -> Vec<ContainerIssue> {
    containers
        .iter()
        .filter_map(|c| {
            let mut problems = Vec::new();
            if c.state == "exited" {
                let policy = restart_policies.get(&c.name).map(String::as_str).unwrap_or("no");
                if policy == "no" || policy.is_empty() {
                    problems.push("Exited without restart policy".to_string());
                }
            }
            if c.health == Health::Unhealthy {
                problems.push("Health check failing".to_string());
            }
            if c.state == "restarting" {
                problems.push("Container restarting".to_string());
            }
            (!problems.is_empty()).then(|| ContainerIssue {
                id: c.id.clone(),
                name: c.name.clone(),
                state: c.state.clone(),
                problems,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerSummary {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
    pub paused: usize,
    pub restarting: usize,
}

pub fn summarize(containers: &[Container]) -> ContainerSummary {
    let mut summary = ContainerSummary {
        total: containers.len(),
        ..ContainerSummary::default()
    };
    for c in containers {
        match c.state.as_str() {
            "running" => summary.running += 1,
            "exited" => summary.stopped += 1,
            "paused" => summary.paused += 1,
            "restarting" => summary.restarting += 1,
            _ => {}
        }
    }
    summary
}

/// Thin wrapper over the configured container CLI.
pub struct ContainerClient {
    command: Vec<String>,
    timeout: Duration,
}

impl ContainerClient {
    pub fn new(config: &ContainersConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let Some((program, base)) = self.command.split_first() else {
            bail!("no container command configured");
        };
        let mut command = Command::new(program);
        command.args(base).args(args);

        match subprocess::run_bounded(command, self.timeout).await {
            Err(e) => bail!("{} not available: {}", program, e),
            Ok(None) => bail!(
                "{} {} timed out after {}s",
                program,
                args.first().unwrap_or(&""),
                self.timeout.as_secs()
            ),
            Ok(Some(out)) if !out.status.success() => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                bail!("{} {} failed: {}", program, args.join(" "), stderr.trim())
            }
            Ok(Some(out)) => Ok(String::from_utf8_lossy(&out.stdout).into_owned()),
        }
    }

    pub async fn containers(&self) -> Result<Vec<Container>> {
        parse_ps(&self.run(&["ps", "-a", "--format", JSON_FORMAT]).await?)
    }

    pub async fn stats(&self) -> Result<Vec<ContainerStats>> {
        parse_stats(&self.run(&["stats", "--no-stream", "--format", JSON_FORMAT]).await?)
    }

    pub async fn restart_policies(&self, names: &[&str]) -> Result<HashMap<String, String>> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }
        let mut args = vec!["inspect", "--format", RESTART_POLICY_FORMAT];
        args.extend_from_slice(names);
        Ok(parse_restart_policies(&self.run(&args).await?))
    }
}

/// Everything the `container_status` tool and `lko containers` report.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerReport {
    pub summary: ContainerSummary,
    pub containers: Vec<Container>,
    pub hogs: Vec<ContainerHog>,
    pub issues: Vec<ContainerIssue>,
}

pub async fn collect_report(config: &ContainersConfig) -> Result<ContainerReport> {
    let client = ContainerClient::new(config);
    let containers = client.containers().await?;

    let stats = if containers.iter().any(|c| c.state == "running") {
        client.stats().await?
    } else {
        Vec::new()
    };
    let exited: Vec<&str> = containers
        .iter()
        .filter(|c| c.state == "exited")
        .map(|c| c.name.as_str())
        .collect();
    let policies = client.restart_policies(&exited).await?;

    Ok(ContainerReport {
        summary: summarize(&containers),
        hogs: find_container_hogs(&stats, config.cpu_threshold, config.memory_threshold),
        issues: find_unhealthy(&containers, &policies),
        containers,
    })
}

pub fn render(report: &ContainerReport) -> String {
    let s = &report.summary;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Containers:    {} total, {} running, {} stopped, {} paused, {} restarting",
        s.total, s.running, s.stopped, s.paused, s.restarting
    );
    for c in &report.containers {
        let _ = writeln!(out, "  {:<12} {:<24} {:<10} {}", c.id, c.name, c.state, c.image);
    }
    if !report.hogs.is_empty() {
        let _ = writeln!(out, "Resource hogs:");
        for h in &report.hogs {
            let _ = writeln!(out, "  {} ({}): {}", h.name, h.id, h.reasons.join(", "));
        }
    }
    if !report.issues.is_empty() {
        let _ = writeln!(out, "Issues:");
        for i in &report.issues {
            let _ = writeln!(out, "  {} ({}): {}", i.name, i.state, i.problems.join("; "));
        }
    }
    out
}

/// `lko containers`. An unreachable engine is reported, not an error.
pub async fn run_containers(config: &Config) -> Result<()> {
    match collect_report(&config.containers).await {
        Ok(report) => print!("{}", render(&report)),
        Err(e) => {
            tracing::debug!("container report failed: {:#}", e);
            println!("Containers unavailable: {:#}", e);
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::fake_config;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_ps_derives_state_and_health() {
        let text = r#"{"ID":"0123456789abcdef","Names":"db,db-alias","Image":"postgres:16","Status":"Up 3 days (health: starting)"}
{"ID":"fedcba987654","Names":"old","Image":"busybox","Status":"Exited (137) 2 weeks ago"}
"#;
        let containers = parse_ps(text).unwrap();
        assert_eq!(containers[0].id, "0123456789ab");
        assert_eq!(containers[0].name, "db");
        assert_eq!(containers[0].state, "running");
        assert_eq!(containers[0].health, Health::Starting);
        assert_eq!(containers[1].state, "exited");
        assert_eq!(containers[1].health, Health::None);
    }

    #[test]
    fn test_parse_ps_rejects_garbage() {
        let err = parse_ps("Cannot connect to the Docker daemon\n").unwrap_err();
        assert!(err.to_string().contains("unexpected container CLI output"));
    }

    #[test]
    fn test_parse_stats_percentages() {
        let stats = parse_stats(
            r#"{"ID":"abc","Name":"x","CPUPerc":"12.5%","MemPerc":"--","MemUsage":"0B / 0B"}"#,
        )
        .unwrap();
        assert_eq!(stats[0].cpu_percent, 12.5);
        assert_eq!(stats[0].memory_percent, 0.0);
    }

    #[test]
    fn test_hog_thresholds_are_strict() {
        let stat = |name: &str, cpu, mem| ContainerStats {
            id: name.into(),
            name: name.into(),
            cpu_percent: cpu,
            memory_percent: mem,
            memory_usage: String::new(),
        };
        let hogs = find_container_hogs(
            &[stat("a", 80.0, 80.0), stat("b", 80.1, 10.0), stat("c", 90.0, 95.0)],
            80.0,
            80.0,
        );
        let names: Vec<&str> = hogs.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert_eq!(hogs[1].reasons, vec!["CPU: 90.0%", "Memory: 95.0%"]);
    }

    #[test]
    fn test_restart_policy_parsing() {
        let policies = parse_restart_policies("/a always\n/b \n");
        assert_eq!(policies["a"], "always");
        assert_eq!(policies["b"], "no");
    }

    #[tokio::test]
    async fn test_report_from_fake_cli() {
        let tmp = TempDir::new().unwrap();
        let report = collect_report(&fake_config(tmp.path())).await.unwrap();

        assert_eq!(
            report.summary,
            ContainerSummary {
                total: 4,
                running: 2,
                stopped: 2,
                paused: 0,
                restarting: 0,
            }
        );
        assert_eq!(report.hogs.len(), 1);
        assert_eq!(report.hogs[0].name, "worker");

        let issues: Vec<(&str, &Vec<String>)> =
            report.issues.iter().map(|i| (i.name.as_str(), &i.problems)).collect();
        assert_eq!(
            issues,
            vec![
                ("worker", &vec!["Health check failing".to_string()]),
                ("batch", &vec!["Exited without restart policy".to_string()]),
            ]
        );

        let text = render(&report);
        assert!(text.starts_with("Containers:    4 total, 2 running, 2 stopped"));
        assert!(text.contains("worker (bbbbbbbbbbbb): CPU: 96.2%, Memory: 85.0%"));
    }

    #[tokio::test]
    async fn test_missing_cli_is_error() {
        let config = ContainersConfig {
            command: vec!["/nonexistent/docker".into()],
            ..ContainersConfig::default()
        };
        let err = collect_report(&config).await.unwrap_err();
        assert!(err.to_string().contains("not available"));
    }
}
