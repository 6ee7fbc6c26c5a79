use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tokio::process::Command;

use crate::hive_config::TrackerConfig;

/// A unit of work owned by the external task tracker.
///
/// Hive only reads tasks; it never writes tracker data back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ids of tasks that must finish first
    #[serde(default, alias = "depends_on")]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl Task {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: None,
            blocked_by: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn with_blocked_by(mut self, deps: &[&str]) -> Self {
        self.blocked_by = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_labels(mut self, labels: &[&str]) -> Self {
        self.labels = labels.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }
}

/// Read access to the task tracker.
#[async_trait]
pub trait TaskTracker: Send + Sync {
    /// Tasks whose dependencies are satisfied.
    async fn ready(&self) -> Result<Vec<Task>>;

    /// Tasks still waiting on other tasks.
    async fn blocked(&self) -> Result<Vec<Task>>;
}

/// Tracker reached through its CLI (`bd ready --json` by default).
pub struct CliTaskTracker {
    config: TrackerConfig,
    workdir: PathBuf,
}

impl CliTaskTracker {
    pub fn new(config: TrackerConfig, workdir: PathBuf) -> Self {
        Self { config, workdir }
    }

    async fn query(&self, args: &[String]) -> Result<Vec<Task>> {
        tracing::debug!(cmd = %self.config.cmd, ?args, "querying task tracker");
        let output = Command::new(&self.config.cmd)
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .await
            .with_context(|| format!("Failed to run task tracker '{}'", self.config.cmd))?;
        if !output.status.success() {
            bail!(
                "Task tracker '{} {}' failed: {}",
                self.config.cmd,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_task_list(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl TaskTracker for CliTaskTracker {
    async fn ready(&self) -> Result<Vec<Task>> {
        self.query(&self.config.ready_args).await
    }

    async fn blocked(&self) -> Result<Vec<Task>> {
        self.query(&self.config.blocked_args).await
    }
}

/// Parse tracker output: a JSON array of tasks or an object with a `tasks` array.
/// Empty output is an empty list.
pub fn parse_task_list(stdout: &str) -> Result<Vec<Task>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(trimmed).context("Task tracker output is not JSON")?;
    let items = match value {
        Value::Array(_) => value,
        Value::Object(mut map) => match map.remove("tasks") {
            Some(tasks @ Value::Array(_)) => tasks,
            _ => bail!("Task tracker output has no 'tasks' array"),
        },
        Value::Null => return Ok(Vec::new()),
        _ => bail!("Task tracker output must be a JSON array"),
    };
    serde_json::from_value(items).context("Task tracker returned malformed tasks")
}
