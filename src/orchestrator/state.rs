//! Run state and the run registry.
//!
//! `RunState` is the single mutable document of a run. Only the engine
//! mutates it; every mutation is followed by an atomic save to
//! `.hive/runs/<run-id>/state.json`, so a crash at any point leaves the last
//! complete state on disk. Collections that feed prompts or digests are
//! ordered (`Vec`, `BTreeMap`) so identical runs serialize identically.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::challenge::ChallengeRecord;
use crate::confidence::ConfidenceScore;
use crate::config::Config;
use crate::errors::EngineError;
use crate::events::EVENTS_FILE;
use crate::report::HiveReport;
use crate::tracker::Task;
use crate::util::write_json_atomic;
use crate::workflow::{Phase, Workflow};

pub const STATE_FILE: &str = "state.json";
pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Complete,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Complete | RunStatus::Failed | RunStatus::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Complete => "complete",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who produced a scratchpad decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Agent,
    /// A needs_input default applied without a human
    Default,
    Human,
    Engine,
}

/// One entry of the append-only decision log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub key: String,
    pub value: String,
    pub source: DecisionSource,
    pub phase: String,
    pub recorded_at: DateTime<Utc>,
}

/// The part of a phase's report carried forward. Immutable once written;
/// a re-run appends a newer handoff instead of editing the old one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    pub phase: String,
    #[serde(default)]
    pub agent: Option<String>,
    pub attempt: u32,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    pub written_at: DateTime<Utc>,
}

impl Handoff {
    pub fn from_report(phase: &Phase, attempt: u32, report: &HiveReport) -> Self {
        Self {
            phase: phase.name.clone(),
            agent: phase.agent.clone(),
            attempt,
            decisions: report
                .decisions()
                .into_iter()
                .map(|d| match d.key {
                    Some(key) => format!("{}: {}", key, d.value),
                    None => d.value,
                })
                .collect(),
            files: report.files(),
            notes: report.notes(),
            rationale: report.rationale(),
            tasks: report.tasks(),
            written_at: Utc::now(),
        }
    }
}

/// A file passed with `-c`, captured when the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub path: String,
    pub content: String,
}

impl Attachment {
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read context file: {}", path.display()))?;
        Ok(Self {
            path: path.display().to_string(),
            content,
        })
    }
}

/// One attempt of one phase. Never overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub phase: String,
    pub phase_index: usize,
    pub attempt: u32,
    pub agent: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Rendered context bundle, relative to the run directory
    pub context_path: String,
    pub context_digest: String,
    pub transcript_path: String,
    #[serde(default)]
    pub report: Option<HiveReport>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub confidence: Option<ConfidenceScore>,
    pub duration_ms: u64,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    pub started_at: DateTime<Utc>,
}

/// A human note for the next invocation of one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guidance {
    pub phase_index: usize,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub version: u32,
    pub run_id: String,
    pub objective: String,
    pub workflow: Workflow,
    pub status: RunStatus,
    pub current_phase: usize,
    #[serde(default)]
    pub current_agent: Option<String>,
    #[serde(default)]
    pub autonomous: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub handoffs: Vec<Handoff>,
    #[serde(default)]
    pub invocations: Vec<AgentInvocation>,
    /// Invocations started per phase name
    #[serde(default)]
    pub attempts: BTreeMap<String, u32>,
    /// Failed attempts per phase name since it last advanced
    #[serde(default)]
    pub failures: BTreeMap<String, u32>,
    /// Defaults applied without asking, per phase name since it last advanced
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub defaults_applied: BTreeMap<String, u32>,
    /// Replays used per challenger->target edge
    #[serde(default)]
    pub challenge_rounds: BTreeMap<String, u32>,
    #[serde(default)]
    pub challenges: Vec<ChallengeRecord>,
    #[serde(default)]
    pub guidance: Option<Guidance>,
    #[serde(default)]
    pub pending_checkpoint: Option<String>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(
        run_id: String,
        objective: String,
        workflow: Workflow,
        autonomous: bool,
        attachments: Vec<Attachment>,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            run_id,
            objective,
            workflow,
            status: RunStatus::Pending,
            current_phase: 0,
            current_agent: None,
            autonomous,
            attachments,
            decisions: Vec::new(),
            handoffs: Vec::new(),
            invocations: Vec::new(),
            attempts: BTreeMap::new(),
            failures: BTreeMap::new(),
            defaults_applied: BTreeMap::new(),
            challenge_rounds: BTreeMap::new(),
            challenges: Vec::new(),
            guidance: None,
            pending_checkpoint: None,
            cost_usd: 0.0,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Latest value per decision key.
    pub fn scratchpad(&self) -> BTreeMap<String, String> {
        self.decisions
            .iter()
            .map(|d| (d.key.clone(), d.value.clone()))
            .collect()
    }

    pub fn record_decision(&mut self, key: &str, value: &str, source: DecisionSource, phase: &str) {
        self.decisions.push(Decision {
            key: key.to_string(),
            value: value.to_string(),
            source,
            phase: phase.to_string(),
            recorded_at: Utc::now(),
        });
    }

    /// Most recent handoff written by `phase`.
    pub fn latest_handoff(&self, phase: &str) -> Option<&Handoff> {
        self.handoffs.iter().rev().find(|h| h.phase == phase)
    }

    pub fn phase(&self, index: usize) -> Option<&Phase> {
        self.workflow.phases.get(index)
    }

    /// Increment and return the attempt number for a phase.
    pub fn next_attempt(&mut self, phase: &str) -> u32 {
        let n = self.attempts.entry(phase.to_string()).or_insert(0);
        *n += 1;
        *n
    }

    pub fn record_failure(&mut self, phase: &str) -> u32 {
        let n = self.failures.entry(phase.to_string()).or_insert(0);
        *n += 1;
        *n
    }

    pub fn record_default_applied(&mut self, phase: &str) -> u32 {
        let n = self.defaults_applied.entry(phase.to_string()).or_insert(0);
        *n += 1;
        *n
    }

    /// Forget the failures and applied defaults counted against a phase.
    pub fn reset_phase_budget(&mut self, phase: &str) {
        self.failures.remove(phase);
        self.defaults_applied.remove(phase);
    }

    pub fn phases_completed(&self) -> usize {
        if self.status == RunStatus::Complete {
            self.workflow.phases.len()
        } else {
            self.current_phase.min(self.workflow.phases.len())
        }
    }
}

/// `YYYYmmdd-HHMMSS-xxxxxxxx`: sortable by start time, unique per process.
pub fn generate_run_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &uuid[..8])
}

/// Persisted runs under `.hive/runs/`.
#[derive(Debug, Clone)]
pub struct RunStore {
    runs_dir: PathBuf,
    current_file: PathBuf,
}

impl RunStore {
    pub fn new(config: &Config) -> Self {
        Self {
            runs_dir: config.runs_dir.clone(),
            current_file: config.current_file.clone(),
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    pub fn state_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(STATE_FILE)
    }

    pub fn events_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(EVENTS_FILE)
    }

    pub fn artifacts_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("artifacts")
    }

    pub fn checkpoints_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("checkpoints")
    }

    /// Atomically replace `state.json`.
    pub fn save(&self, state: &RunState) -> Result<()> {
        write_json_atomic(&self.state_path(&state.run_id), state)
            .with_context(|| format!("Failed to save state for run {}", state.run_id))
    }

    pub fn load(&self, run_id: &str) -> Result<RunState, EngineError> {
        let path = self.state_path(run_id);
        if !path.exists() {
            return Err(EngineError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let state = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(state)
    }

    pub fn set_current(&self, run_id: &str) -> Result<()> {
        crate::util::write_atomic(&self.current_file, run_id.as_bytes())
    }

    pub fn current_run_id(&self) -> Option<String> {
        fs::read_to_string(&self.current_file)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// The named run, or the current one.
    pub fn resolve(&self, run_id: Option<&str>) -> Result<String, EngineError> {
        match run_id {
            Some(id) => Ok(id.to_string()),
            None => self.current_run_id().ok_or(EngineError::NoActiveRun),
        }
    }

    /// All runs with a readable state file, newest first.
    pub fn list_runs(&self) -> Result<Vec<RunState>> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.runs_dir).context("Failed to read runs directory")? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            match self.load(&name) {
                Ok(state) => runs.push(state),
                Err(EngineError::RunNotFound { .. }) => {}
                Err(e) => tracing::warn!(run_id = %name, error = %e, "skipping unreadable run"),
            }
        }
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.run_id.cmp(&a.run_id)));
        Ok(runs)
    }
}
