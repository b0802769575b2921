//! Append-only JSONL logs and incident recording.
//!
//! Every answered query and every daemon finding is appended to a JSONL log
//! (one object per line). Incidents are also embedded into the
//! [`IncidentStore`] so later lookups can find similar past problems.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::memory::{IncidentStore, Metadata};
use crate::planner::Plan;
use crate::tools::PlanRun;

/// An append-only file of JSON lines.
#[derive(Debug, Clone)]
pub struct JsonlLog {
    path: PathBuf,
}

impl JsonlLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append<T: Serialize>(&self, entry: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let line = serde_json::to_string(entry)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// The last `n` entries that parse as `T`, oldest first.
    pub fn recent<T: DeserializeOwned>(&self, n: usize) -> Result<Vec<T>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open {}", self.path.display()))
            }
        };
        let mut entries: Vec<T> = Vec::new();
        for line in BufReader::new(file).lines() {
            if let Ok(entry) = serde_json::from_str(&line?) {
                entries.push(entry);
            }
        }
        let skip = entries.len().saturating_sub(n);
        Ok(entries.split_off(skip))
    }

    /// Number of lines in the log.
    pub fn len(&self) -> Result<usize> {
        match std::fs::File::open(&self.path) {
            Ok(f) => Ok(BufReader::new(f).lines().count()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e).with_context(|| format!("Failed to open {}", self.path.display())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsSummary {
    pub tools_executed: usize,
    pub success_count: usize,
    pub goal: String,
}

impl From<&PlanRun> for ResultsSummary {
    fn from(run: &PlanRun) -> Self {
        Self {
            tools_executed: run.tools_executed(),
            success_count: run.success_count(),
            goal: run.goal.clone(),
        }
    }
}

/// One line of `queries.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEntry {
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub plan: Plan,
    pub results_summary: ResultsSummary,
}

impl QueryEntry {
    pub fn new(query: &str, plan: &Plan, run: &PlanRun) -> Self {
        Self {
            timestamp: Utc::now(),
            query: query.to_string(),
            plan: plan.clone(),
            results_summary: run.into(),
        }
    }
}

/// One line of `incidents.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentEntry {
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub plan: Plan,
    pub results_summary: ResultsSummary,
    pub outcome: String,
    #[serde(default)]
    pub notes: String,
}

impl IncidentEntry {
    pub fn new(query: &str, plan: &Plan, summary: ResultsSummary, outcome: &str, notes: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            query: query.to_string(),
            plan: plan.clone(),
            results_summary: summary,
            outcome: outcome.to_string(),
            notes: notes.to_string(),
        }
    }

    /// Text embedded into incident memory.
    pub fn memory_text(&self) -> String {
        let mut text = format!("{}. {}", self.query, self.plan.goal);
        if !self.notes.is_empty() {
            text.push_str(". ");
            text.push_str(&self.notes);
        }
        text
    }

    pub fn memory_metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.insert("problem".into(), Value::String(self.query.clone()));
        meta.insert("solution".into(), Value::String(self.plan.goal.clone()));
        meta.insert("outcome".into(), Value::String(self.outcome.clone()));
        meta.insert("query".into(), Value::String(self.query.clone()));
        meta.insert(
            "tools".into(),
            Value::Array(self.plan.tools.iter().cloned().map(Value::String).collect()),
        );
        meta.insert("timestamp".into(), Value::String(self.timestamp.to_rfc3339()));
        if !self.notes.is_empty() {
            meta.insert("notes".into(), Value::String(self.notes.clone()));
        }
        meta
    }
}

/// Writes incidents to the JSONL log and into incident memory.
pub struct IncidentRecorder {
    log: JsonlLog,
}

impl IncidentRecorder {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log: JsonlLog::new(log_path),
        }
    }

    pub fn log(&self) -> &JsonlLog {
        &self.log
    }

    /// Record `entry`. Returns the memory id when it was stored.
    ///
    /// Neither sink is allowed to fail the caller: log and memory errors are
    /// reported as warnings.
    pub async fn record(&self, store: &mut IncidentStore, entry: &IncidentEntry) -> Option<usize> {
        if let Err(e) = self.log.append(entry) {
            tracing::warn!("failed to append incident log: {:#}", e);
        }

        let id = match store.add(&entry.memory_text(), entry.memory_metadata()).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("incident not added to memory: {}", e);
                return None;
            }
        };
        if let Err(e) = store.save() {
            tracing::warn!("failed to persist incident memory: {}", e);
        }
        tracing::debug!(id, outcome = %entry.outcome, "recorded incident");
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn plan() -> Plan {
        Plan {
            goal: "Resource monitoring".into(),
            tools: vec!["process_list".into()],
            reasoning: "Autonomous check".into(),
        }
    }

    fn summary() -> ResultsSummary {
        ResultsSummary {
            tools_executed: 1,
            success_count: 1,
            goal: "Resource monitoring".into(),
        }
    }

    #[test]
    fn test_jsonl_append_and_recent() {
        let tmp = TempDir::new().unwrap();
        let log = JsonlLog::new(tmp.path().join("logs").join("queries.jsonl"));
        assert!(log.recent::<Value>(5).unwrap().is_empty());
        for i in 0..4 {
            log.append(&serde_json::json!({ "n": i })).unwrap();
        }
        std::fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .unwrap()
            .write_all(b"not json\n")
            .unwrap();

        let recent: Vec<Value> = log.recent(2).unwrap();
        assert_eq!(recent, vec![serde_json::json!({"n": 2}), serde_json::json!({"n": 3})]);
        assert_eq!(log.len().unwrap(), 5);
    }

    #[test]
    fn test_incident_line_shape() {
        let tmp = TempDir::new().unwrap();
        let log = JsonlLog::new(tmp.path().join("incidents.jsonl"));
        let entry = IncidentEntry::new("High resource usage", &plan(), summary(), "warning", "Found 2 resource hogs");
        log.append(&entry).unwrap();

        let line = std::fs::read_to_string(log.path()).unwrap();
        let v: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(v["outcome"], "warning");
        assert_eq!(v["plan"]["tools"][0], "process_list");
        assert_eq!(v["results_summary"]["tools_executed"], 1);
        assert!(v["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_record_writes_log_and_memory() {
        let tmp = TempDir::new().unwrap();
        let mut store = IncidentStore::open(&tmp.path().join("memory"), Arc::new(HashEmbedder::new(64)));
        let recorder = IncidentRecorder::new(tmp.path().join("logs").join("incidents.jsonl"));
        let entry = IncidentEntry::new("Disk full on /var", &plan(), summary(), "success", "");

        assert_eq!(recorder.record(&mut store, &entry).await, Some(0));
        assert_eq!(recorder.log().len().unwrap(), 1);
        assert_eq!(store.records()[0].metadata["outcome"], "success");
        assert_eq!(store.records()[0].text, "Disk full on /var. Resource monitoring");
        assert!(tmp.path().join("memory").join("incidents.vec").exists());
    }
}
