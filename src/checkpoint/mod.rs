//! Checkpoints: persisted human decision points.
//!
//! A checkpoint stores the complete run state at the moment the run paused,
//! its SHA-256 digest, and the event-log offset. Resuming restores that
//! snapshot after checking the digest, so no completed phase is ever re-run
//! and no invocation is replayed. Listing only reads checkpoint files.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::challenge::Challenge;
use crate::confidence::ConfidenceScore;
use crate::errors::EngineError;
use crate::orchestrator::state::RunState;
use crate::util::{sha256_hex, write_json_atomic};

/// Why the run paused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointReason {
    /// The phase is flagged `checkpoint_after` and completed
    PhaseFlagged,
    NeedsInput {
        question: String,
        #[serde(default)]
        default: Option<String>,
        #[serde(default)]
        key: Option<String>,
    },
    /// A repeat challenge on an edge that already used its replay
    ChallengeEscalated { challenges: Vec<Challenge> },
    /// The challenge could not be routed or the replay did not succeed
    ChallengeUnresolved { challenge: Challenge, detail: String },
    ConfidenceReview { score: ConfidenceScore },
    MergeConflict { unresolved: Vec<String> },
}

impl CheckpointReason {
    pub fn label(&self) -> &'static str {
        match self {
            CheckpointReason::PhaseFlagged => "phase checkpoint",
            CheckpointReason::NeedsInput { .. } => "needs input",
            CheckpointReason::ChallengeEscalated { .. } => "challenge escalated",
            CheckpointReason::ChallengeUnresolved { .. } => "challenge unresolved",
            CheckpointReason::ConfidenceReview { .. } => "confidence review",
            CheckpointReason::MergeConflict { .. } => "merge conflict",
        }
    }

    /// Whether `continue` re-runs the paused phase instead of advancing past it.
    ///
    /// A challenger that paused, or a phase that stopped to ask a question,
    /// never finished its own work, so continuing means running it again.
    pub fn continue_reruns(&self) -> bool {
        matches!(
            self,
            CheckpointReason::NeedsInput { .. }
                | CheckpointReason::ChallengeEscalated { .. }
                | CheckpointReason::ChallengeUnresolved { .. }
        )
    }

    /// Multi-line description for the resume prompt.
    pub fn describe(&self) -> String {
        match self {
            CheckpointReason::PhaseFlagged => "The phase completed and is flagged for review.".to_string(),
            CheckpointReason::NeedsInput {
                question, default, ..
            } => match default {
                Some(d) => format!("Question: {}\nDefault: {}", question, d),
                None => format!("Question: {}", question),
            },
            CheckpointReason::ChallengeEscalated { challenges } => {
                let mut out = String::from("The same edge was challenged again:\n");
                for (i, c) in challenges.iter().enumerate() {
                    out.push_str(&format!(
                        "  {}. [{}] {} -> {}: {}\n",
                        i + 1,
                        c.severity,
                        c.challenger,
                        c.target.as_deref().unwrap_or("previous phase"),
                        c.issue
                    ));
                }
                out
            }
            CheckpointReason::ChallengeUnresolved { challenge, detail } => format!(
                "Challenge from {}: {}\n{}",
                challenge.challenger, challenge.issue, detail
            ),
            CheckpointReason::ConfidenceReview { score } => {
                format!("Confidence {}", score.summary())
            }
            CheckpointReason::MergeConflict { unresolved } => {
                format!("Unresolved merges: {}", unresolved.join(", "))
            }
        }
    }
}

/// The human disposition of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum CheckpointDecision {
    Continue,
    /// Re-run the paused phase with this note added to its context
    Adjust { note: String },
    Reject { reason: String },
}

impl CheckpointDecision {
    pub fn label(&self) -> &'static str {
        match self {
            CheckpointDecision::Continue => "continue",
            CheckpointDecision::Adjust { .. } => "adjust",
            CheckpointDecision::Reject { .. } => "reject",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub decision: CheckpointDecision,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub run_id: String,
    pub phase_index: usize,
    pub phase_name: String,
    pub reason: CheckpointReason,
    /// Run state exactly as saved when the run paused
    pub snapshot: RunState,
    pub digest: String,
    /// Sequence number of the last event before the pause
    pub event_offset: u64,
    /// Opaque token a resolution must present; it must match the copy on disk
    pub token: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

impl Checkpoint {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Canonical digest of a run state.
pub fn snapshot_digest(state: &RunState) -> Result<String> {
    let bytes = serde_json::to_vec(state).context("Failed to serialize run snapshot")?;
    Ok(sha256_hex(&bytes))
}

/// `cp-<phase index>-<8 hex>`, unique within a run.
pub fn new_checkpoint_id(phase_index: usize) -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("cp-{:02}-{}", phase_index, &uuid[..8])
}

/// Checkpoint files under `.hive/runs/<run-id>/checkpoints/`.
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn for_run(run_dir: &Path) -> Self {
        Self::new(run_dir.join("checkpoints"))
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Build a checkpoint over `snapshot` (which must already carry its pending id).
    pub fn create(
        &self,
        id: &str,
        snapshot: &RunState,
        reason: CheckpointReason,
        event_offset: u64,
    ) -> Result<Checkpoint> {
        let phase_name = snapshot
            .phase(snapshot.current_phase)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        let checkpoint = Checkpoint {
            id: id.to_string(),
            run_id: snapshot.run_id.clone(),
            phase_index: snapshot.current_phase,
            phase_name,
            reason,
            digest: snapshot_digest(snapshot)?,
            snapshot: snapshot.clone(),
            event_offset,
            token: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            resolution: None,
        };
        self.save(&checkpoint)?;
        Ok(checkpoint)
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        write_json_atomic(&self.path(&checkpoint.id), checkpoint)
            .with_context(|| format!("Failed to save checkpoint {}", checkpoint.id))
    }

    pub fn load(&self, id: &str) -> Result<Checkpoint, EngineError> {
        let path = self.path(id);
        if !path.exists() {
            return Err(EngineError::CheckpointNotFound { id: id.to_string() });
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let checkpoint = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(checkpoint)
    }

    /// All checkpoints of the run, oldest first.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut checkpoints = Vec::new();
        for entry in fs::read_dir(&self.dir).context("Failed to read checkpoints directory")? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            match serde_json::from_str::<Checkpoint>(&content) {
                Ok(cp) => checkpoints.push(cp),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint"),
            }
        }
        checkpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(checkpoints)
    }

    /// The newest unresolved checkpoint.
    pub fn latest_open(&self) -> Result<Option<Checkpoint>> {
        Ok(self.list()?.into_iter().rev().find(|cp| !cp.is_resolved()))
    }

    /// The stored snapshot after verifying its digest.
    pub fn restore(&self, checkpoint: &Checkpoint) -> Result<RunState, EngineError> {
        let found = snapshot_digest(&checkpoint.snapshot)?;
        if found != checkpoint.digest {
            return Err(EngineError::SnapshotMismatch {
                id: checkpoint.id.clone(),
                expected: checkpoint.digest.clone(),
                found,
            });
        }
        Ok(checkpoint.snapshot.clone())
    }

    /// Record the decision. A checkpoint is resolved at most once, by a caller
    /// holding the token of the stored copy.
    pub fn resolve(&self, checkpoint: &mut Checkpoint, decision: CheckpointDecision) -> Result<(), EngineError> {
        let stored = self.load(&checkpoint.id)?;
        if stored.token != checkpoint.token || stored.is_resolved() {
            return Err(EngineError::StaleCheckpoint {
                id: checkpoint.id.clone(),
            });
        }
        checkpoint.resolution = Some(Resolution {
            decision,
            resolved_at: Utc::now(),
        });
        self.save(checkpoint)?;
        Ok(())
    }
}
