use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn lko_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("lko");
    path
}

const RUNBOOKS: &str = r#"
runbooks:
  - name: home-cleanup
    description: Clear caches when /home fills up
    trigger:
      type: disk_usage
      filesystem: /home
      threshold: 90
      operator: ">"
    actions:
      - type: alert
        message: "/home is filling up"
        severity: WARNING
      - type: command
        run: "true"
  - name: memory-pressure
    enabled: false
    trigger:
      type: memory_usage
    actions:
      - type: wait
        seconds: 1
"#;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(config_dir.join("runbooks.yaml"), RUNBOOKS).unwrap();

    // A stub "model" that always answers with the same plan.
    let model = root.join("model.sh");
    fs::write(
        &model,
        "echo 'thinking...'\necho '{\"goal\": \"Check disk\", \"tools\": [\"disk_usage\", \"process_list\"], \"reasoning\": \"disk question\"}'\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[llm]
binary_path = "sh"
model_path = "{root}/model.sh"
timeout_secs = 10

[safety]
dry_run = true

[memory]
dir = "{root}/memory"

[embedding]
provider = "hash"
dims = 128

[runbooks]
path = "{root}/config/runbooks.yaml"

[logs]
dir = "{root}/logs"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("lko.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_lko(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = lko_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run lko binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_stats_on_fresh_install() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_lko(&config, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Incidents:   0"));
    assert!(stdout.contains("Runbooks:    2 (1 enabled)"));
    assert!(stdout.contains("Mode:        dry-run"));
}

#[test]
fn test_search_empty_memory() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_lko(&config, &["search", "disk full", "-k", "3"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("No similar incidents."));
}

#[test]
fn test_runbooks_list() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_lko(&config, &["runbooks", "list"]);
    assert!(success, "runbooks list failed: {}", stderr);
    assert!(stdout.contains("home-cleanup: when disk_usage(/home) > 90 -> 2 actions"));
    assert!(stdout.contains("memory-pressure [disabled]"));
}

#[test]
fn test_runbooks_list_rejects_duplicates() {
    let (tmp, config) = setup_test_env();
    fs::write(
        tmp.path().join("config").join("runbooks.yaml"),
        "runbooks:\n  - {name: a, trigger: {type: disk_usage}}\n  - {name: a, trigger: {type: memory_usage}}\n",
    )
    .unwrap();
    let (_stdout, stderr, success) = run_lko(&config, &["runbooks", "list"]);
    assert!(!success);
    assert!(stderr.contains("duplicate runbook name"));
}

#[test]
fn test_runbooks_check_observes_host() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_lko(&config, &["runbooks", "check"]);
    assert!(success, "runbooks check failed: {}", stderr);
    assert!(stdout.contains("Observed:"));
}

#[test]
fn test_ask_dry_run_logs_query() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_lko(&config, &["ask", "Why is my disk filling up?"]);
    assert!(success, "ask failed: {}", stderr);
    assert!(stdout.contains("Goal:      Check disk"));
    assert!(stdout.contains("DRY RUN: Would execute disk_usage"));
    assert!(stdout.contains("Completed: 2 tools executed, 2 succeeded"));

    let log = fs::read_to_string(tmp.path().join("logs").join("queries.jsonl")).unwrap();
    assert_eq!(log.lines().count(), 1);
    let entry: serde_json::Value = serde_json::from_str(log.trim()).unwrap();
    assert_eq!(entry["query"], "Why is my disk filling up?");
    assert_eq!(entry["results_summary"]["tools_executed"], 2);
}

#[test]
fn test_remediate_dry_run_leaves_process_alone() {
    let (_tmp, config) = setup_test_env();
    let mut child = Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id().to_string();

    let (stdout, stderr, success) = run_lko(&config, &["remediate", &pid]);
    let still_running = child.try_wait().unwrap().is_none();
    child.kill().unwrap();
    child.wait().unwrap();

    assert!(still_running, "dry run must not stop the process");
    assert!(stdout.contains("Remediating PID"), "stdout: {} stderr: {}", stdout, stderr);
    assert!(stdout.contains("[would] force_kill"));
    // A child already at the lowest priority reports AlreadyDeprioritized.
    assert!(stdout.contains("renice"));
    assert!(success);
}

#[test]
fn test_remediate_missing_process_fails() {
    let (_tmp, config) = setup_test_env();
    // PIDs above pid_max never exist.
    let (_stdout, stderr, success) = run_lko(&config, &["remediate", "2147483000"]);
    assert!(!success);
    assert!(stderr.contains("no process with PID 2147483000"));
}

#[test]
fn test_usage_error_exits_nonzero() {
    let (_tmp, config) = setup_test_env();
    let (_stdout, stderr, success) = run_lko(&config, &["remediate", "not-a-pid"]);
    assert!(!success);
    assert!(stderr.contains("invalid value"));
}

#[test]
fn test_missing_config_uses_defaults() {
    let tmp = TempDir::new().unwrap();
    let output = Command::new(lko_binary())
        .current_dir(tmp.path())
        .arg("--config")
        .arg(tmp.path().join("absent.toml"))
        .arg("stats")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Incidents:   0"));
    assert!(stdout.contains("Runbooks:    0"));
}

#[test]
fn test_invalid_config_fails() {
    let (_tmp, config) = setup_test_env();
    fs::write(&config, "[daemon]\ncheck_interval = 0\n").unwrap();
    let (_stdout, stderr, success) = run_lko(&config, &["stats"]);
    assert!(!success);
    assert!(stderr.contains("check_interval"));
}

#[test]
fn test_network_resolves_requested_names() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) =
        run_lko(&config, &["network", "--no-gateway", "--dns", "127.0.0.1"]);
    assert!(success, "network failed: {}", stderr);
    assert!(stdout.contains("Interfaces:"));
    assert!(stdout.contains("Connections:"));
    assert!(stdout.contains("DNS 127.0.0.1: 127.0.0.1"));
    assert!(!stdout.contains("Ping "));
}

#[test]
fn test_containers_with_fake_cli() {
    let (tmp, config) = setup_test_env();
    let script = tmp.path().join("docker.sh");
    fs::write(
        &script,
        r#"case "$1" in
  ps) echo '{"ID":"0123456789abcdef","Names":"web","Image":"nginx","State":"exited","Status":"Exited (1) 2 minutes ago"}' ;;
  inspect) echo '/web no' ;;
  *) exit 1 ;;
esac
"#,
    )
    .unwrap();
    let mut content = fs::read_to_string(&config).unwrap();
    content.push_str(&format!(
        "\n[containers]\ncommand = [\"sh\", \"{}\"]\n",
        script.display()
    ));
    fs::write(&config, content).unwrap();

    let (stdout, stderr, success) = run_lko(&config, &["containers"]);
    assert!(success, "containers failed: {}", stderr);
    assert!(stdout.contains("1 total, 0 running, 1 stopped"));
    assert!(stdout.contains("web (exited): Exited without restart policy"));
}

#[test]
fn test_containers_without_cli_is_reported() {
    let (_tmp, config) = setup_test_env();
    let mut content = fs::read_to_string(&config).unwrap();
    content.push_str("\n[containers]\ncommand = [\"/nonexistent/docker\"]\n");
    fs::write(&config, content).unwrap();

    let (stdout, stderr, success) = run_lko(&config, &["containers"]);
    assert!(success, "containers failed: {}", stderr);
    assert!(stdout.contains("Containers unavailable:"));
}
