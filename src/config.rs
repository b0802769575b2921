use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::ExecutionMode;

/// The probes the planner may select from.
pub const DEFAULT_TOOLS: [&str; 7] = [
    "disk_usage",
    "cpu_load",
    "memory_status",
    "process_list",
    "recent_errors",
    "network_status",
    "container_status",
];

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub remediation: RemediationConfig,
    #[serde(default)]
    pub runbooks: RunbooksConfig,
    #[serde(default)]
    pub logs: LogsConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub containers: ContainersConfig,
}

impl Config {
    /// Configuration used when no config file is available.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Global execution mode derived from `[safety].dry_run`.
    pub fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::from_dry_run(self.safety.dry_run)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_binary")]
    pub binary_path: PathBuf,
    #[serde(default = "default_llm_model")]
    pub model_path: PathBuf,
    #[serde(default = "default_threads")]
    pub threads: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            binary_path: default_llm_binary(),
            model_path: default_llm_model(),
            threads: default_threads(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

fn default_llm_binary() -> PathBuf {
    PathBuf::from("llama.cpp/build/bin/llama-simple")
}
fn default_llm_model() -> PathBuf {
    PathBuf::from("models/phi-3-mini-4k-instruct-q4.gguf")
}
fn default_threads() -> u32 {
    4
}
fn default_temperature() -> f32 {
    0.1
}
fn default_max_tokens() -> u32 {
    300
}
fn default_llm_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ToolsConfig {
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,
    #[serde(default = "default_tool_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_output")]
    pub max_output_size: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            allowed_tools: default_allowed_tools(),
            timeout_seconds: default_tool_timeout(),
            max_output_size: default_max_output(),
        }
    }
}

fn default_allowed_tools() -> Vec<String> {
    DEFAULT_TOOLS.iter().map(|t| t.to_string()).collect()
}
fn default_tool_timeout() -> u64 {
    30
}
fn default_max_output() -> usize {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SafetyConfig {
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default = "default_true")]
    pub log_all_actions: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            log_all_actions: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_k")]
    pub default_k: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dir: default_memory_dir(),
            default_k: default_k(),
        }
    }
}

fn default_memory_dir() -> PathBuf {
    PathBuf::from("agent/memory")
}
fn default_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    /// Poll period of the scheduler loop, in seconds.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    #[serde(default = "default_health_interval")]
    pub health_check_interval: u64,
    #[serde(default = "default_resource_interval")]
    pub resource_check_interval: u64,
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f32,
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f32,
    #[serde(default = "default_max_remediations")]
    pub max_remediations_per_cycle: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            health_check_interval: default_health_interval(),
            resource_check_interval: default_resource_interval(),
            cpu_threshold: default_cpu_threshold(),
            memory_threshold: default_memory_threshold(),
            max_remediations_per_cycle: default_max_remediations(),
        }
    }
}

impl DaemonConfig {
    pub fn poll_period(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }
    pub fn resource_interval(&self) -> Duration {
        Duration::from_secs(self.resource_check_interval)
    }
}

fn default_check_interval() -> u64 {
    60
}
fn default_health_interval() -> u64 {
    21_600
}
fn default_resource_interval() -> u64 {
    300
}
fn default_cpu_threshold() -> f32 {
    80.0
}
fn default_memory_threshold() -> f32 {
    50.0
}
fn default_max_remediations() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct AlertsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Also raise a desktop notification through `notify-send`.
    #[serde(default)]
    pub desktop: bool,
    #[serde(default = "default_critical_disk")]
    pub critical_disk_threshold: f64,
    #[serde(default = "default_critical_memory")]
    pub critical_memory_threshold: f64,
    #[serde(default = "default_critical_cpu")]
    pub critical_cpu_threshold: f64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            desktop: false,
            critical_disk_threshold: default_critical_disk(),
            critical_memory_threshold: default_critical_memory(),
            critical_cpu_threshold: default_critical_cpu(),
        }
    }
}

fn default_critical_disk() -> f64 {
    95.0
}
fn default_critical_memory() -> f64 {
    90.0
}
fn default_critical_cpu() -> f64 {
    90.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemediationConfig {
    #[serde(default = "default_target_niceness")]
    pub target_niceness: i32,
    #[serde(default = "default_graceful_wait")]
    pub graceful_wait_secs: u64,
    /// In live mode, continue to graceful stop / force kill when renice
    /// does not succeed. Dry runs always preview every tier.
    #[serde(default)]
    pub auto_escalate: bool,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            target_niceness: default_target_niceness(),
            graceful_wait_secs: default_graceful_wait(),
            auto_escalate: false,
        }
    }
}

fn default_target_niceness() -> i32 {
    19
}
fn default_graceful_wait() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunbooksConfig {
    #[serde(default = "default_runbooks_path")]
    pub path: PathBuf,
    /// Stop executing a runbook after its first failed action.
    #[serde(default)]
    pub stop_on_failure: bool,
}

impl Default for RunbooksConfig {
    fn default() -> Self {
        Self {
            path: default_runbooks_path(),
            stop_on_failure: false,
        }
    }
}

fn default_runbooks_path() -> PathBuf {
    PathBuf::from("agent/config/runbooks.yaml")
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogsConfig {
    #[serde(default = "default_logs_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            dir: default_logs_dir(),
            max_size_mb: default_max_size_mb(),
            max_age_days: default_max_age_days(),
        }
    }
}

impl LogsConfig {
    pub fn incidents_path(&self) -> PathBuf {
        self.dir.join("incidents.jsonl")
    }
    pub fn queries_path(&self) -> PathBuf {
        self.dir.join("queries.jsonl")
    }
    pub fn alerts_path(&self) -> PathBuf {
        self.dir.join("alerts.log")
    }
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("agent/logs")
}
fn default_max_size_mb() -> u64 {
    100
}
fn default_max_age_days() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    /// Echo requests per ping.
    #[serde(default = "default_ping_count")]
    pub ping_count: u32,
    /// Seconds to wait for each echo reply.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_dns_timeout")]
    pub dns_timeout_secs: u64,
    /// Hosts pinged by the `network_status` tool, besides the gateway.
    #[serde(default)]
    pub ping_hosts: Vec<String>,
    /// Names resolved by the `network_status` tool.
    #[serde(default)]
    pub dns_names: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ping_count: default_ping_count(),
            ping_timeout_secs: default_ping_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            dns_timeout_secs: default_dns_timeout(),
            ping_hosts: Vec::new(),
            dns_names: Vec::new(),
        }
    }
}

impl NetworkConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs)
    }
}

fn default_ping_count() -> u32 {
    3
}
fn default_ping_timeout() -> u64 {
    5
}
fn default_connect_timeout() -> u64 {
    2
}
fn default_dns_timeout() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContainersConfig {
    /// Program and leading arguments for the container CLI,
    /// e.g. `["docker"]`, `["sudo", "docker"]` or `["podman"]`.
    #[serde(default = "default_container_command")]
    pub command: Vec<String>,
    #[serde(default = "default_container_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_container_threshold")]
    pub cpu_threshold: f64,
    #[serde(default = "default_container_threshold")]
    pub memory_threshold: f64,
}

impl Default for ContainersConfig {
    fn default() -> Self {
        Self {
            command: default_container_command(),
            timeout_secs: default_container_timeout(),
            cpu_threshold: default_container_threshold(),
            memory_threshold: default_container_threshold(),
        }
    }
}

fn default_container_command() -> Vec<String> {
    vec!["docker".to_string()]
}
fn default_container_timeout() -> u64 {
    15
}
fn default_container_threshold() -> f64 {
    80.0
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate daemon intervals
    if config.daemon.check_interval == 0 {
        anyhow::bail!("daemon.check_interval must be > 0");
    }
    if config.daemon.health_check_interval == 0 || config.daemon.resource_check_interval == 0 {
        anyhow::bail!("daemon.health_check_interval and daemon.resource_check_interval must be > 0");
    }
    for (name, value) in [
        ("daemon.cpu_threshold", config.daemon.cpu_threshold as f64),
        ("daemon.memory_threshold", config.daemon.memory_threshold as f64),
        ("alerts.critical_disk_threshold", config.alerts.critical_disk_threshold),
        ("alerts.critical_memory_threshold", config.alerts.critical_memory_threshold),
        ("alerts.critical_cpu_threshold", config.alerts.critical_cpu_threshold),
        ("containers.cpu_threshold", config.containers.cpu_threshold),
        ("containers.memory_threshold", config.containers.memory_threshold),
    ] {
        if !(value > 0.0 && value <= 100.0) {
            anyhow::bail!("{} must be in (0, 100], got {}", name, value);
        }
    }

    if config.network.ping_count == 0 {
        anyhow::bail!("network.ping_count must be >= 1");
    }
    if config.network.ping_timeout_secs == 0
        || config.network.connect_timeout_secs == 0
        || config.network.dns_timeout_secs == 0
    {
        anyhow::bail!("network timeouts must be > 0");
    }
    if config.containers.command.is_empty() {
        anyhow::bail!("containers.command must name a program");
    }
    if config.containers.timeout_secs == 0 {
        anyhow::bail!("containers.timeout_secs must be > 0");
    }

    // Validate remediation
    if !(-20..=19).contains(&config.remediation.target_niceness) {
        anyhow::bail!("remediation.target_niceness must be in [-20, 19]");
    }

    // Validate memory
    if config.memory.default_k == 0 {
        anyhow::bail!("memory.default_k must be >= 1");
    }

    // Validate embedding
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    match config.embedding.provider.as_str() {
        "hash" | "ollama" | "openai" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash, ollama, openai, or local.",
            other
        ),
    }
    if matches!(config.embedding.provider.as_str(), "ollama" | "openai")
        && config.embedding.model.is_none()
    {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Result<Config> {
        let config: Config = toml::from_str(src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.daemon.health_check_interval, 21_600);
        assert_eq!(config.daemon.resource_check_interval, 300);
        assert_eq!(config.daemon.check_interval, 60);
        assert_eq!(config.remediation.target_niceness, 19);
        assert_eq!(config.remediation.graceful_wait_secs, 5);
        assert!(!config.remediation.auto_escalate);
        assert!(config.safety.dry_run);
        assert_eq!(config.tools.allowed_tools.len(), 7);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.network.ping_count, 3);
        assert_eq!(config.containers.command, vec!["docker"]);
        assert_eq!(config.execution_mode(), ExecutionMode::DryRun);
    }

    #[test]
    fn test_partial_sections() {
        let config = parse(
            r#"
[safety]
dry_run = false

[daemon]
resource_check_interval = 120
cpu_threshold = 70

[runbooks]
path = "/etc/lko/runbooks.yaml"
stop_on_failure = true
"#,
        )
        .unwrap();
        assert_eq!(config.execution_mode(), ExecutionMode::Live);
        assert_eq!(config.daemon.resource_check_interval, 120);
        assert_eq!(config.daemon.health_check_interval, 21_600);
        assert_eq!(config.daemon.cpu_threshold, 70.0);
        assert!(config.runbooks.stop_on_failure);
        assert_eq!(config.logs.incidents_path(), PathBuf::from("agent/logs/incidents.jsonl"));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let err = parse("[daemon]\ncheck_interval = 0\n").unwrap_err();
        assert!(err.to_string().contains("check_interval"));
    }

    #[test]
    fn test_rejects_bad_network_and_container_settings() {
        assert!(parse("[network]\nping_count = 0\n").is_err());
        assert!(parse("[network]\ndns_timeout_secs = 0\n").is_err());
        let err = parse("[containers]\ncommand = []\n").unwrap_err();
        assert!(err.to_string().contains("containers.command"));
        assert!(parse("[containers]\nmemory_threshold = 150\n").is_err());
    }

    #[test]
    fn test_rejects_bad_niceness() {
        assert!(parse("[remediation]\ntarget_niceness = 25\n").is_err());
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let err = parse("[embedding]\nprovider = \"faiss\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_http_provider_requires_model() {
        assert!(parse("[embedding]\nprovider = \"ollama\"\n").is_err());
        assert!(parse("[embedding]\nprovider = \"ollama\"\nmodel = \"all-minilm\"\n").is_ok());
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse(include_str!("../config/lko.example.toml")).unwrap();
        assert_eq!(config.tools.allowed_tools.len(), 7);
        assert_eq!(config.network.connect_timeout_secs, 2);
        assert_eq!(config.daemon.max_remediations_per_cycle, 3);
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/lko.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
