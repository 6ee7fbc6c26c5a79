//! Typed error hierarchy for the Hive orchestrator.
//!
//! Three top-level enums cover the three seams where callers need to
//! distinguish failures:
//! - `InvocationError`: an agent process could not produce a transcript
//! - `EngineError`: workflow, run and checkpoint level failures
//! - `MergeError`: integrating a parallel task branch back into the main line
//!
//! Transcript parsing failures live next to the parser (`report::ParseError`)
//! because they never escape it: they are turned into a BLOCKED report.

use std::time::Duration;
use thiserror::Error;

/// Failure to obtain a transcript from an agent backend.
///
/// Distinct from a parsed "blocked" report: these mean the process itself
/// misbehaved, so the engine treats them as retry-eligible.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("Failed to spawn agent process '{cmd}': {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent process timed out after {}s", .elapsed.as_secs())]
    Timeout { elapsed: Duration },

    #[error("Agent process exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Agent invocation cancelled")]
    Cancelled,

    #[error("Agent backend misconfigured: {0}")]
    Backend(String),

    #[error("I/O error during agent invocation: {0}")]
    Io(#[from] std::io::Error),
}

impl InvocationError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            InvocationError::Cancelled | InvocationError::Backend(_)
        )
    }
}

/// Errors from the workflow engine and the run/checkpoint stores.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown workflow '{name}'. Available: {available}")]
    UnknownWorkflow { name: String, available: String },

    #[error("Invalid workflow '{workflow}': {message}")]
    InvalidWorkflow { workflow: String, message: String },

    #[error("No phase in workflow '{workflow}' is bound to agent '{agent}'")]
    UnknownAgent { workflow: String, agent: String },

    #[error("No active run. Start one with 'hive run <objective>'")]
    NoActiveRun,

    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Run {run_id} is {status} and cannot be resumed")]
    RunNotResumable { run_id: String, status: String },

    #[error("Checkpoint {id} not found")]
    CheckpointNotFound { id: String },

    #[error("Checkpoint {id} was already resolved or replaced; reload it and try again")]
    StaleCheckpoint { id: String },

    #[error("Checkpoint {id} snapshot digest mismatch (expected {expected}, found {found})")]
    SnapshotMismatch {
        id: String,
        expected: String,
        found: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from merging a task branch into the base branch.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("Merge of {branch} left unresolved conflicts in: {}", .files.join(", "))]
    Unresolved { branch: String, files: Vec<String> },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_error_spawn_is_matchable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "claude not found");
        let err = InvocationError::Spawn {
            cmd: "claude".to_string(),
            source: io_err,
        };
        match &err {
            InvocationError::Spawn { cmd, source } => {
                assert_eq!(cmd, "claude");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected Spawn variant"),
        }
        assert!(err.is_retryable());
    }

    #[test]
    fn invocation_error_timeout_mentions_seconds() {
        let err = InvocationError::Timeout {
            elapsed: Duration::from_secs(90),
        };
        assert!(err.to_string().contains("90s"));
        assert!(err.is_retryable());
    }

    #[test]
    fn cancelled_invocation_is_not_retryable() {
        assert!(!InvocationError::Cancelled.is_retryable());
    }

    #[test]
    fn non_zero_exit_carries_stderr() {
        let err = InvocationError::NonZeroExit {
            code: 2,
            stderr: "rate limited".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("code 2"));
        assert!(msg.contains("rate limited"));
    }

    #[test]
    fn engine_error_converts_from_anyhow() {
        let err: EngineError = anyhow::anyhow!("disk full").into();
        match &err {
            EngineError::Other(e) => assert_eq!(e.to_string(), "disk full"),
            _ => panic!("Expected Other"),
        }
    }

    #[test]
    fn snapshot_mismatch_reports_both_digests() {
        let err = EngineError::SnapshotMismatch {
            id: "cp-01".to_string(),
            expected: "aaa".to_string(),
            found: "bbb".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("aaa") && msg.contains("bbb"));
    }

    #[test]
    fn merge_error_lists_conflicted_files() {
        let err = MergeError::Unresolved {
            branch: "hive/task-a".to_string(),
            files: vec!["src/a.rs".to_string(), "src/b.rs".to_string()],
        };
        assert!(err.to_string().contains("src/a.rs, src/b.rs"));
    }
}
