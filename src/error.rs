//! Typed errors at component seams.
//!
//! Command-level code works in `anyhow::Result`; these enums are what the
//! components hand back so callers can decide what is recoverable.
//! Per-tier remediation failures and action failures are not errors at all:
//! they are encoded in the result types of [`crate::remediation`] and
//! [`crate::runbook`].

use thiserror::Error;

/// A malformed configuration or runbook source.
///
/// Always recoverable for runbooks: the engine falls back to an empty set.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("duplicate runbook name: \"{name}\"")]
    DuplicateRunbook { name: String },
}

/// Errors from the incident vector store.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The embedder was unavailable or returned unusable output.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// A persisted artifact is unreadable, corrupt, or inconsistent.
    #[error("incident store artifact {path} is unusable: {message}")]
    Persistence { path: String, message: String },

    #[error("embedding has {actual} dimensions, store expects {expected}")]
    Dimension { expected: usize, actual: usize },

    #[error("add_batch called with {texts} texts but {metadata} metadata entries")]
    BatchLength { texts: usize, metadata: usize },
}

impl MemoryError {
    pub(crate) fn persistence(path: &std::path::Path, message: impl std::fmt::Display) -> Self {
        MemoryError::Persistence {
            path: path.display().to_string(),
            message: message.to_string(),
        }
    }
}

/// The planner produced no usable plan. Zero tools are run.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanningFailure {
    #[error("planner could not generate a response: {0}")]
    Generation(String),

    #[error("planner response is not valid JSON: {0}")]
    Parse(String),

    #[error("planner response is missing required keys (goal, tools, reasoning)")]
    MissingKeys,
}
