//! Query planning: which probes answer a free-text question.
//!
//! [`LlmPlanner`] prompts a local llama.cpp binary and pulls the first JSON
//! object out of whatever it prints. A response that is not JSON, or that
//! lacks any of `goal` / `tools` / `reasoning`, is a [`PlanningFailure`]
//! and no tools run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ffi::OsString;
use std::time::Duration;
use tokio::process::Command;

use crate::config::LlmConfig;
use crate::error::PlanningFailure;
use crate::{subprocess, tools};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub tools: Vec<String>,
    pub reasoning: String,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, query: &str) -> Result<Plan, PlanningFailure>;
}

pub fn build_prompt(query: &str, allowed_tools: &[String]) -> String {
    let tools_list = allowed_tools
        .iter()
        .map(|t| format!("- {}: {}", t, tools::describe(t)))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are a system diagnostics planner. Analyze the user query and decide which tools to use.

Available tools:
{tools_list}

User query: {query}

Respond with ONLY a valid JSON object (no explanation before or after) in this exact format:
{{"goal": "brief description", "tools": ["tool1", "tool2"], "reasoning": "why these tools"}}"#
    )
}

/// Extract a [`Plan`] from model output.
///
/// Scans for the first `{` that starts a complete JSON object, ignoring any
/// text around it. Tools outside `allowed_tools` are dropped.
pub fn parse_plan(text: &str, allowed_tools: &[String]) -> Result<Plan, PlanningFailure> {
    let object = text
        .match_indices('{')
        .find_map(|(start, _)| {
            serde_json::Deserializer::from_str(&text[start..])
                .into_iter::<Value>()
                .next()
                .and_then(|v| v.ok())
                .filter(Value::is_object)
        })
        .ok_or_else(|| {
            let preview: String = text.chars().take(200).collect();
            PlanningFailure::Parse(format!("no JSON object in response: {}", preview.trim()))
        })?;

    let (Some(goal), Some(tools), Some(reasoning)) =
        (object.get("goal"), object.get("tools"), object.get("reasoning"))
    else {
        return Err(PlanningFailure::MissingKeys);
    };

    let tools = match tools {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .filter(|t| allowed_tools.iter().any(|a| a == t))
            .map(str::to_string)
            .collect(),
        _ => return Err(PlanningFailure::Parse("\"tools\" is not a list".to_string())),
    };

    Ok(Plan {
        goal: value_text(goal),
        tools,
        reasoning: value_text(reasoning),
    })
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Planner backed by a llama.cpp completion binary.
pub struct LlmPlanner {
    config: LlmConfig,
    allowed_tools: Vec<String>,
}

impl LlmPlanner {
    pub fn new(config: LlmConfig, allowed_tools: Vec<String>) -> Self {
        Self {
            config,
            allowed_tools,
        }
    }

    async fn generate(&self, prompt: &str) -> Result<String, PlanningFailure> {
        let mut command = Command::new(&self.config.binary_path);
        command.args(generation_args(&self.config, prompt));

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = match subprocess::run_bounded(command, timeout).await {
            Ok(None) => return Err(PlanningFailure::Generation("LLM generation timeout".to_string())),
            Err(e) => {
                return Err(PlanningFailure::Generation(format!(
                    "failed to run {}: {}",
                    self.config.binary_path.display(),
                    e
                )))
            }
            Ok(Some(out)) => out,
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PlanningFailure::Generation(format!(
                "LLM failed: {}",
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// `<model> <prompt> -n <max_tokens> -t <threads> --temp <temperature>`.
fn generation_args(config: &LlmConfig, prompt: &str) -> Vec<OsString> {
    vec![
        config.model_path.clone().into_os_string(),
        prompt.into(),
        "-n".into(),
        config.max_tokens.to_string().into(),
        "-t".into(),
        config.threads.to_string().into(),
        "--temp".into(),
        config.temperature.to_string().into(),
    ]
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, query: &str) -> Result<Plan, PlanningFailure> {
        let prompt = build_prompt(query, &self.allowed_tools);
        let response = self.generate(&prompt).await?;
        let plan = parse_plan(&response, &self.allowed_tools)?;
        tracing::debug!(goal = %plan.goal, tools = ?plan.tools, "planned");
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TOOLS;
    use std::path::PathBuf;

    fn allowed() -> Vec<String> {
        DEFAULT_TOOLS.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_parse_plan_with_surrounding_text() {
        let text = r#"Sure! Here is the plan:
{"goal": "Find disk hogs", "tools": ["disk_usage", "process_list"], "reasoning": "disk is filling"}
Hope that helps {not json}"#;
        let plan = parse_plan(text, &allowed()).unwrap();
        assert_eq!(plan.goal, "Find disk hogs");
        assert_eq!(plan.tools, vec!["disk_usage", "process_list"]);
    }

    #[test]
    fn test_parse_plan_skips_braces_that_are_not_json() {
        let text = r#"{placeholder} {"goal": "g", "tools": [], "reasoning": "r"}"#;
        assert_eq!(parse_plan(text, &allowed()).unwrap().goal, "g");
    }

    #[test]
    fn test_parse_plan_filters_disallowed_tools() {
        let text = r#"{"goal": "g", "tools": ["disk_usage", "rm_rf", 3], "reasoning": "r"}"#;
        assert_eq!(parse_plan(text, &allowed()).unwrap().tools, vec!["disk_usage"]);
    }

    #[test]
    fn test_parse_plan_missing_keys() {
        let text = r#"{"goal": "g", "tools": ["disk_usage"]}"#;
        assert_eq!(parse_plan(text, &allowed()), Err(PlanningFailure::MissingKeys));
    }

    #[test]
    fn test_parse_plan_not_json() {
        let err = parse_plan("I cannot help with that.", &allowed()).unwrap_err();
        assert!(matches!(err, PlanningFailure::Parse(_)));
    }

    #[test]
    fn test_prompt_lists_tools() {
        let prompt = build_prompt("Why is my disk filling up?", &allowed());
        assert!(prompt.contains("- disk_usage: Check disk space usage across filesystems"));
        assert!(prompt.contains("User query: Why is my disk filling up?"));
        assert!(prompt.contains(r#"{"goal": "brief description""#));
    }

    #[tokio::test]
    async fn test_missing_binary_is_generation_failure() {
        let config = LlmConfig {
            binary_path: PathBuf::from("/nonexistent/llama-simple"),
            ..LlmConfig::default()
        };
        let err = LlmPlanner::new(config, allowed()).plan("x").await.unwrap_err();
        assert!(matches!(err, PlanningFailure::Generation(_)));
    }

    #[tokio::test]
    async fn test_plan_from_stub_model() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = tmp.path().join("model.sh");
        std::fs::write(
            &script,
            "echo 'loading model...'\necho '{\"goal\": \"health\", \"tools\": [\"cpu_load\"], \"reasoning\": \"r\"}'\n",
        )
        .unwrap();

        // `sh <model> <prompt>` runs the stub without exec'ing a fresh file.
        let config = LlmConfig {
            binary_path: PathBuf::from("sh"),
            model_path: script,
            ..LlmConfig::default()
        };
        let plan = LlmPlanner::new(config, allowed()).plan("health").await.unwrap();
        assert_eq!(plan.tools, vec!["cpu_load"]);
    }

    #[tokio::test]
    async fn test_model_receives_sampling_settings() {
        let tmp = tempfile::TempDir::new().unwrap();
        let args_file = tmp.path().join("args");
        let script = tmp.path().join("model.sh");
        std::fs::write(
            &script,
            format!(
                "printf '%s\\n' \"$@\" > {}\necho '{{\"goal\": \"g\", \"tools\": [], \"reasoning\": \"r\"}}'\n",
                args_file.display()
            ),
        )
        .unwrap();

        let config = LlmConfig {
            binary_path: PathBuf::from("sh"),
            model_path: script,
            threads: 6,
            temperature: 0.25,
            max_tokens: 128,
            ..LlmConfig::default()
        };
        LlmPlanner::new(config, allowed()).plan("is disk full").await.unwrap();

        let recorded = std::fs::read_to_string(&args_file).unwrap();
        assert!(recorded.contains("is disk full"));
        let args: Vec<&str> = recorded.lines().collect();
        assert_eq!(args[args.len() - 6..], ["-n", "128", "-t", "6", "--temp", "0.25"]);
    }
}
