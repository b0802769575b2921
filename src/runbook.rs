//! Runbooks: declarative triggers paired with ordered remedial actions.
//!
//! A runbook file holds a list of runbooks under a top-level `runbooks` key,
//! in YAML (`.yaml` / `.yml`) or TOML (any other extension):
//!
//! ```yaml
//! runbooks:
//!   - name: home-disk-cleanup
//!     description: Clear caches when /home fills up
//!     trigger: { type: disk_usage, filesystem: /home, threshold: 90, operator: ">" }
//!     actions:
//!       - { type: alert, message: "/home above 90%", severity: WARNING }
//!       - { type: command, run: "rm -rf ~/.cache/thumbnails/*", timeout: 30 }
//!       - { type: wait, seconds: 5 }
//! ```
//!
//! Loading never fails hard. A missing file, a malformed file, or duplicate
//! runbook names all yield an empty set, with the problem surfaced as a
//! recoverable [`ConfigError`] for the caller to log.
//!
//! Execution is sequential in declared order. Every side effect is gated on
//! the [`ExecutionMode`] passed to [`RunbookEngine::execute`].

use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::alerts::AlertSink;
use crate::error::ConfigError;
use crate::models::{ExecutionMode, ObservationContext, Severity};
use crate::subprocess;

const DEFAULT_DISK_THRESHOLD: f64 = 90.0;
const DEFAULT_MEMORY_THRESHOLD: f64 = 85.0;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunbookSet {
    #[serde(default)]
    pub runbooks: Vec<Runbook>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Runbook {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub trigger: Trigger,
    #[serde(default)]
    pub actions: Vec<Action>,
}

fn default_enabled() -> bool {
    true
}

/// The metric a trigger watches. Unrecognized types are kept so the runbook
/// still loads; they never fire.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum TriggerKind {
    DiskUsage,
    MemoryUsage,
    Other(String),
}

impl From<String> for TriggerKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "disk_usage" => TriggerKind::DiskUsage,
            "memory_usage" => TriggerKind::MemoryUsage,
            _ => TriggerKind::Other(s),
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::DiskUsage => write!(f, "disk_usage"),
            TriggerKind::MemoryUsage => write!(f, "memory_usage"),
            TriggerKind::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Comparison applied as `usage <op> threshold`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum Operator {
    /// `>`
    Gt,
    /// `>=`
    Ge,
    Unsupported(String),
}

impl From<String> for Operator {
    fn from(s: String) -> Self {
        match s.trim() {
            ">" => Operator::Gt,
            ">=" => Operator::Ge,
            _ => Operator::Unsupported(s),
        }
    }
}

impl Operator {
    pub fn apply(&self, usage: f64, threshold: f64) -> bool {
        match self {
            Operator::Gt => usage > threshold,
            Operator::Ge => usage >= threshold,
            Operator::Unsupported(_) => false,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operator::Gt => write!(f, ">"),
            Operator::Ge => write!(f, ">="),
            Operator::Unsupported(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Trigger {
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub operator: Option<Operator>,
    #[serde(default)]
    pub filesystem: Option<String>,
}

impl Trigger {
    /// Declared threshold, or the per-kind default (disk 90, memory 85).
    pub fn threshold(&self) -> f64 {
        self.threshold.unwrap_or(match self.kind {
            TriggerKind::MemoryUsage => DEFAULT_MEMORY_THRESHOLD,
            _ => DEFAULT_DISK_THRESHOLD,
        })
    }

    /// Declared operator, or the per-kind default (disk `>`, memory `>=`).
    pub fn operator(&self) -> Operator {
        match (&self.operator, &self.kind) {
            (Some(op), _) => op.clone(),
            (None, TriggerKind::MemoryUsage) => Operator::Ge,
            (None, _) => Operator::Gt,
        }
    }

    pub fn filesystem(&self) -> &str {
        self.filesystem.as_deref().unwrap_or("/")
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TriggerKind::DiskUsage => write!(
                f,
                "disk_usage({}) {} {}",
                self.filesystem(),
                self.operator(),
                self.threshold()
            ),
            _ => write!(f, "{} {} {}", self.kind, self.operator(), self.threshold()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Alert {
        #[serde(default = "default_alert_message")]
        message: String,
        #[serde(default)]
        severity: Severity,
    },
    Command {
        run: String,
        /// Seconds.
        #[serde(default = "default_command_timeout")]
        timeout: u64,
    },
    Wait {
        #[serde(default = "default_wait_seconds")]
        seconds: u64,
    },
    #[serde(other)]
    Unsupported,
}

fn default_alert_message() -> String {
    "Alert".to_string()
}
fn default_command_timeout() -> u64 {
    30
}
fn default_wait_seconds() -> u64 {
    5
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Alert { .. } => "alert",
            Action::Command { .. } => "command",
            Action::Wait { .. } => "wait",
            Action::Unsupported => "unsupported",
        }
    }
}

/// Why an action did not succeed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionFailure {
    #[error("command timed out after {0}s")]
    CommandTimeout(u64),
    #[error("command failed: {0}")]
    CommandFailure(String),
    #[error("unsupported action type")]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionResult {
    pub kind: &'static str,
    pub success: bool,
    /// False when the side effect was only simulated.
    pub executed: bool,
    pub message: String,
    pub failure: Option<ActionFailure>,
}

impl ActionResult {
    fn ok(kind: &'static str, executed: bool, message: String) -> Self {
        Self {
            kind,
            success: true,
            executed,
            message,
            failure: None,
        }
    }

    fn failed(kind: &'static str, failure: ActionFailure) -> Self {
        Self {
            kind,
            success: false,
            executed: true,
            message: failure.to_string(),
            failure: Some(failure),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub runbook_name: String,
    pub mode: ExecutionMode,
    pub actions: Vec<ActionResult>,
    /// Set when execution stopped early after a failed action.
    pub aborted: bool,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        !self.aborted && self.actions.iter().all(|a| a.success)
    }
}

enum Format {
    Yaml,
    Toml,
}

impl RunbookSet {
    pub fn parse_yaml(src: &str) -> Result<Self, ConfigError> {
        Self::parse(src, Format::Yaml, "<yaml>")
    }

    pub fn parse_toml(src: &str) -> Result<Self, ConfigError> {
        Self::parse(src, Format::Toml, "<toml>")
    }

    fn parse(src: &str, format: Format, origin: &str) -> Result<Self, ConfigError> {
        let set: RunbookSet = match format {
            // An empty YAML document is an empty set, not a parse error.
            Format::Yaml if src.trim().is_empty() => RunbookSet::default(),
            Format::Yaml => serde_yaml::from_str(src).map_err(|e| ConfigError::Parse {
                path: origin.to_string(),
                message: e.to_string(),
            })?,
            Format::Toml => toml::from_str(src).map_err(|e| ConfigError::Parse {
                path: origin.to_string(),
                message: e.to_string(),
            })?,
        };
        set.check_unique_names()?;
        Ok(set)
    }

    fn check_unique_names(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for runbook in &self.runbooks {
            if !seen.insert(runbook.name.as_str()) {
                return Err(ConfigError::DuplicateRunbook {
                    name: runbook.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Load the runbook set at `path`.
///
/// Always returns a usable (possibly empty) set. A missing file is not an
/// error; any other problem is returned alongside the empty set.
pub fn load_runbooks(path: &Path) -> (Vec<Runbook>, Option<ConfigError>) {
    if !path.exists() {
        tracing::warn!("runbook file not found: {}", path.display());
        return (Vec::new(), None);
    }
    let src = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            let err = ConfigError::Read {
                path: path.display().to_string(),
                message: e.to_string(),
            };
            return (Vec::new(), Some(err));
        }
    };
    let format = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => Format::Yaml,
        _ => Format::Toml,
    };
    match RunbookSet::parse(&src, format, &path.display().to_string()) {
        Ok(set) => {
            let enabled = set.runbooks.iter().filter(|r| r.enabled).count();
            tracing::info!(
                "loaded {} runbooks ({} enabled) from {}",
                set.runbooks.len(),
                enabled,
                path.display()
            );
            (set.runbooks, None)
        }
        Err(e) => (Vec::new(), Some(e)),
    }
}

/// Whether `runbook` should fire for `ctx`.
pub fn check_trigger(runbook: &Runbook, ctx: &ObservationContext) -> bool {
    if !runbook.enabled {
        return false;
    }
    let trigger = &runbook.trigger;
    let usage = match trigger.kind {
        TriggerKind::DiskUsage => ctx.disk(trigger.filesystem()).map(|d| d.usage_percent),
        TriggerKind::MemoryUsage => ctx.memory_usage,
        TriggerKind::Other(_) => None,
    };
    match usage {
        Some(usage) => trigger.operator().apply(usage, trigger.threshold()),
        None => false,
    }
}

pub struct RunbookEngine {
    runbooks: Vec<Runbook>,
    stop_on_failure: bool,
    source: Option<PathBuf>,
}

impl RunbookEngine {
    pub fn new(runbooks: Vec<Runbook>, stop_on_failure: bool) -> Self {
        Self {
            runbooks,
            stop_on_failure,
            source: None,
        }
    }

    /// Load from `path`. A returned [`ConfigError`] is recoverable: the
    /// engine is usable with zero runbooks.
    pub fn load(path: &Path, stop_on_failure: bool) -> (Self, Option<ConfigError>) {
        let (runbooks, err) = load_runbooks(path);
        let engine = Self {
            runbooks,
            stop_on_failure,
            source: Some(path.to_path_buf()),
        };
        (engine, err)
    }

    /// Replace the whole set by re-reading the runbook file.
    pub fn reload(&mut self) -> Option<ConfigError> {
        let path = self.source.clone()?;
        let (runbooks, err) = load_runbooks(&path);
        self.runbooks = runbooks;
        err
    }

    pub fn runbooks(&self) -> &[Runbook] {
        &self.runbooks
    }

    /// All runbooks whose trigger fires, in load order.
    pub fn find_matching(&self, ctx: &ObservationContext) -> Vec<&Runbook> {
        self.runbooks
            .iter()
            .filter(|r| check_trigger(r, ctx))
            .collect()
    }

    pub async fn execute(
        &self,
        runbook: &Runbook,
        _ctx: &ObservationContext,
        mode: ExecutionMode,
        alerts: &dyn AlertSink,
    ) -> ExecutionResult {
        tracing::info!(runbook = %runbook.name, mode = %mode, "executing runbook");

        let mut result = ExecutionResult {
            runbook_name: runbook.name.clone(),
            mode,
            actions: Vec::with_capacity(runbook.actions.len()),
            aborted: false,
        };

        for (step, action) in runbook.actions.iter().enumerate() {
            let outcome = execute_action(action, mode, alerts).await;
            tracing::info!(
                runbook = %runbook.name,
                "step {}: {} -> {} ({})",
                step + 1,
                outcome.kind,
                if outcome.success { "ok" } else { "failed" },
                outcome.message
            );
            let failed = !outcome.success;
            result.actions.push(outcome);

            if failed && self.stop_on_failure {
                let remaining = runbook.actions.len() - step - 1;
                if remaining > 0 {
                    tracing::warn!(
                        runbook = %runbook.name,
                        "aborting after failed step {}, {} actions skipped",
                        step + 1,
                        remaining
                    );
                    result.aborted = true;
                }
                break;
            }
        }
        result
    }
}

async fn execute_action(action: &Action, mode: ExecutionMode, alerts: &dyn AlertSink) -> ActionResult {
    match action {
        Action::Alert { message, severity } => {
            if mode.is_dry_run() {
                ActionResult::ok("alert", false, format!("would alert [{}]: {}", severity, message))
            } else {
                alerts.send("Runbook Alert", message, *severity).await;
                ActionResult::ok("alert", true, format!("alert [{}]: {}", severity, message))
            }
        }
        Action::Command { run, timeout } => {
            if mode.is_dry_run() {
                return ActionResult::ok("command", false, format!("would run: {}", run));
            }
            run_command(run, *timeout).await
        }
        Action::Wait { seconds } => {
            if mode.is_dry_run() {
                ActionResult::ok("wait", false, format!("would wait {}s", seconds))
            } else {
                tokio::time::sleep(Duration::from_secs(*seconds)).await;
                ActionResult::ok("wait", true, format!("waited {}s", seconds))
            }
        }
        Action::Unsupported => ActionResult::failed("unsupported", ActionFailure::Unsupported),
    }
}

/// Run a command action. On timeout everything the command started is
/// killed along with it.
async fn run_command(run: &str, timeout_secs: u64) -> ActionResult {
    match subprocess::run_bounded(subprocess::sh(run), Duration::from_secs(timeout_secs)).await {
        Ok(None) => ActionResult::failed("command", ActionFailure::CommandTimeout(timeout_secs)),
        Err(e) => ActionResult::failed("command", ActionFailure::CommandFailure(e.to_string())),
        Ok(Some(out)) if out.status.success() => {
            ActionResult::ok("command", true, format!("ran: {}", run))
        }
        Ok(Some(out)) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let detail = match out.status.code() {
                Some(code) => format!("exit status {}", code),
                None => "terminated by signal".to_string(),
            };
            let message = match stderr.trim() {
                "" => detail,
                s => format!("{}: {}", detail, s.lines().next().unwrap_or_default()),
            };
            ActionResult::failed("command", ActionFailure::CommandFailure(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::testing::RecordingSink;
    use crate::models::DiskUsage;
    use crate::subprocess::testing::{group_survivors, read_pid};
    use std::time::Instant;
    use tempfile::TempDir;

    fn disk_ctx(fs: &str, usage: f64) -> ObservationContext {
        ObservationContext {
            disk_usage: vec![DiskUsage {
                filesystem: fs.to_string(),
                usage_percent: usage,
            }],
            memory_usage: None,
        }
    }

    fn runbook(trigger: &str) -> Runbook {
        let src = format!("runbooks:\n  - name: r\n    trigger: {}\n", trigger);
        RunbookSet::parse_yaml(&src).unwrap().runbooks.remove(0)
    }

    fn with_actions(actions: &str) -> Runbook {
        let src = format!(
            "runbooks:\n  - name: r\n    trigger: {{ type: memory_usage }}\n    actions:\n{}",
            actions
        );
        RunbookSet::parse_yaml(&src).unwrap().runbooks.remove(0)
    }

    #[test]
    fn test_home_disk_scenario() {
        let rb = runbook("{ type: disk_usage, filesystem: /home, threshold: 90, operator: \">\" }");
        assert!(check_trigger(&rb, &disk_ctx("/home", 92.0)));
        assert!(!check_trigger(&rb, &disk_ctx("/home", 88.0)));
    }

    #[test]
    fn test_operator_boundary() {
        let strict = runbook("{ type: disk_usage, threshold: 90, operator: \">\" }");
        assert!(!check_trigger(&strict, &disk_ctx("/", 90.0)));
        assert!(check_trigger(&strict, &disk_ctx("/", 91.0)));

        let inclusive = runbook("{ type: disk_usage, threshold: 90, operator: \">=\" }");
        assert!(check_trigger(&inclusive, &disk_ctx("/", 90.0)));
    }

    #[test]
    fn test_trigger_defaults() {
        let disk = runbook("{ type: disk_usage }");
        assert_eq!(disk.trigger.filesystem(), "/");
        assert_eq!(disk.trigger.threshold(), 90.0);
        assert_eq!(disk.trigger.operator(), Operator::Gt);
        assert!(!check_trigger(&disk, &disk_ctx("/", 90.0)));

        let mem = runbook("{ type: memory_usage }");
        assert_eq!(mem.trigger.threshold(), 85.0);
        assert_eq!(mem.trigger.operator(), Operator::Ge);
        let ctx = ObservationContext {
            disk_usage: vec![],
            memory_usage: Some(85.0),
        };
        assert!(check_trigger(&mem, &ctx));
    }

    #[test]
    fn test_missing_filesystem_or_reading() {
        let rb = runbook("{ type: disk_usage, filesystem: /data }");
        assert!(!check_trigger(&rb, &disk_ctx("/", 99.0)));
        let mem = runbook("{ type: memory_usage }");
        assert!(!check_trigger(&mem, &ObservationContext::default()));
    }

    #[test]
    fn test_unknown_type_and_operator_never_fire() {
        let rb = runbook("{ type: cpu_usage, threshold: 1 }");
        assert_eq!(rb.trigger.kind, TriggerKind::Other("cpu_usage".into()));
        assert!(!check_trigger(&rb, &disk_ctx("/", 99.0)));

        let rb = runbook("{ type: disk_usage, threshold: 1, operator: \"<\" }");
        assert!(!check_trigger(&rb, &disk_ctx("/", 99.0)));
    }

    #[test]
    fn test_disabled_never_fires() {
        let src = r#"
runbooks:
  - name: off
    enabled: false
    trigger: { type: disk_usage, threshold: 1 }
"#;
        let set = RunbookSet::parse_yaml(src).unwrap();
        assert!(!check_trigger(&set.runbooks[0], &disk_ctx("/", 99.0)));
    }

    #[test]
    fn test_find_matching_preserves_order() {
        let src = r#"
runbooks:
  - name: b
    trigger: { type: disk_usage, threshold: 50 }
  - name: skipped
    trigger: { type: disk_usage, threshold: 99 }
  - name: a
    trigger: { type: disk_usage, threshold: 10 }
"#;
        let engine = RunbookEngine::new(RunbookSet::parse_yaml(src).unwrap().runbooks, false);
        let names: Vec<&str> = engine
            .find_matching(&disk_ctx("/", 70.0))
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let src = r#"
runbooks:
  - name: same
    trigger: { type: disk_usage }
  - name: same
    trigger: { type: memory_usage }
"#;
        let err = RunbookSet::parse_yaml(src).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateRunbook { ref name } if name == "same"));
    }

    #[test]
    fn test_example_runbooks_parse() {
        let set = RunbookSet::parse_yaml(include_str!("../config/runbooks.example.yaml")).unwrap();
        assert_eq!(set.runbooks.len(), 3);
        assert_eq!(set.runbooks[1].trigger.operator(), Operator::Ge);
        assert!(!set.runbooks[2].enabled);
        assert!(set
            .runbooks
            .iter()
            .flat_map(|r| &r.actions)
            .all(|a| *a != Action::Unsupported));
    }

    #[test]
    fn test_parse_toml() {
        let src = r#"
[[runbooks]]
name = "mem"
trigger = { type = "memory_usage", threshold = 80.5 }

[[runbooks.actions]]
type = "alert"
message = "memory high"
severity = "CRITICAL"

[[runbooks.actions]]
type = "wait"
"#;
        let set = RunbookSet::parse_toml(src).unwrap();
        let rb = &set.runbooks[0];
        assert_eq!(rb.trigger.threshold(), 80.5);
        assert_eq!(
            rb.actions,
            vec![
                Action::Alert {
                    message: "memory high".into(),
                    severity: Severity::Critical
                },
                Action::Wait { seconds: 5 },
            ]
        );
    }

    #[test]
    fn test_action_defaults() {
        let rb = with_actions("      - { type: alert }\n      - { type: command, run: \"true\" }\n      - { type: reboot }\n");
        assert_eq!(
            rb.actions,
            vec![
                Action::Alert {
                    message: "Alert".into(),
                    severity: Severity::Info
                },
                Action::Command {
                    run: "true".into(),
                    timeout: 30
                },
                Action::Unsupported,
            ]
        );
    }

    #[test]
    fn test_load_missing_file_is_empty_without_error() {
        let (runbooks, err) = load_runbooks(Path::new("/nonexistent/runbooks.yaml"));
        assert!(runbooks.is_empty());
        assert!(err.is_none());
    }

    #[test]
    fn test_load_malformed_file_is_recoverable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("runbooks.yaml");
        std::fs::write(&path, "runbooks: [ { name: x, trigger: ").unwrap();
        let (engine, err) = RunbookEngine::load(&path, false);
        assert!(engine.runbooks().is_empty());
        assert!(matches!(err, Some(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_reload_replaces_set() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("runbooks.yml");
        std::fs::write(&path, "runbooks:\n  - name: one\n    trigger: { type: disk_usage }\n").unwrap();
        let (mut engine, err) = RunbookEngine::load(&path, false);
        assert!(err.is_none());
        assert_eq!(engine.runbooks().len(), 1);

        std::fs::write(&path, "runbooks: []\n").unwrap();
        assert!(engine.reload().is_none());
        assert!(engine.runbooks().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_has_no_side_effects() {
        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("touched");
        let rb = with_actions(&format!(
            "      - {{ type: alert, message: hi }}\n      - {{ type: command, run: \"touch {}\" }}\n      - {{ type: wait, seconds: 3600 }}\n",
            marker.display()
        ));
        let engine = RunbookEngine::new(vec![rb.clone()], false);
        let sink = RecordingSink::default();

        let started = Instant::now();
        let result = engine
            .execute(&rb, &ObservationContext::default(), ExecutionMode::DryRun, &sink)
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!marker.exists());
        assert!(sink.taken().is_empty());
        assert_eq!(result.actions.len(), 3);
        assert!(result.actions.iter().all(|a| a.success && !a.executed));
        assert!(result.succeeded());
    }

    #[tokio::test]
    async fn test_live_actions() {
        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("touched");
        let rb = with_actions(&format!(
            "      - {{ type: alert, message: hi, severity: WARNING }}\n      - {{ type: command, run: \"touch {}\" }}\n      - {{ type: wait, seconds: 0 }}\n",
            marker.display()
        ));
        let engine = RunbookEngine::new(vec![rb.clone()], false);
        let sink = RecordingSink::default();
        let result = engine
            .execute(&rb, &ObservationContext::default(), ExecutionMode::Live, &sink)
            .await;

        assert!(marker.exists());
        assert_eq!(
            sink.taken(),
            vec![("Runbook Alert".to_string(), "hi".to_string(), Severity::Warning)]
        );
        assert!(result.actions.iter().all(|a| a.success && a.executed));
    }

    #[tokio::test]
    async fn test_failures_continue_by_default() {
        let rb = with_actions(
            "      - { type: command, run: \"exit 3\" }\n      - { type: command, run: \"sleep 5\", timeout: 1 }\n      - { type: command, run: \"true\" }\n",
        );
        let engine = RunbookEngine::new(vec![], false);
        let result = engine
            .execute(&rb, &ObservationContext::default(), ExecutionMode::Live, &RecordingSink::default())
            .await;

        assert_eq!(result.actions.len(), 3);
        assert!(matches!(
            result.actions[0].failure,
            Some(ActionFailure::CommandFailure(ref m)) if m.contains("exit status 3")
        ));
        assert_eq!(result.actions[1].failure, Some(ActionFailure::CommandTimeout(1)));
        assert!(result.actions[2].success);
        assert!(!result.aborted);
        assert!(!result.succeeded());
    }

    #[tokio::test]
    async fn test_command_timeout_leaves_nothing_running() {
        let tmp = TempDir::new().unwrap();
        let pidfile = tmp.path().join("pid");
        let rb = with_actions(&format!(
            "      - {{ type: command, run: \"echo $$ > {}; sleep 47; true\", timeout: 1 }}\n",
            pidfile.display()
        ));
        let engine = RunbookEngine::new(vec![], false);
        let result = engine
            .execute(&rb, &ObservationContext::default(), ExecutionMode::Live, &RecordingSink::default())
            .await;

        assert_eq!(result.actions[0].failure, Some(ActionFailure::CommandTimeout(1)));
        let pgid = read_pid(&pidfile);
        assert_eq!(group_survivors(pgid).await, Vec::<i32>::new());
    }

    #[tokio::test]
    async fn test_stop_on_failure_aborts() {
        let rb = with_actions(
            "      - { type: command, run: \"false\" }\n      - { type: alert, message: never }\n",
        );
        let engine = RunbookEngine::new(vec![], true);
        let sink = RecordingSink::default();
        let result = engine
            .execute(&rb, &ObservationContext::default(), ExecutionMode::Live, &sink)
            .await;

        assert_eq!(result.actions.len(), 1);
        assert!(result.aborted);
        assert!(sink.taken().is_empty());
    }
}
