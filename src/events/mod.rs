//! Run event log.
//!
//! Every lifecycle transition of a run is appended to
//! `.hive/runs/<run-id>/events.jsonl` as one JSON object per line. Sequence
//! numbers start at 1 and are gap-free; the log is the timeline the status
//! views and `hive events` read.

mod log;

pub use log::{EventLog, read_events, read_events_after};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// File name of the event log inside a run directory.
pub const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    RunResumed,
    RunPaused,
    RunCompleted,
    RunFailed,
    RunAborted,
    PhaseStarted,
    PhaseCompleted,
    PhaseSkipped,
    PhaseFailed,
    InvocationFailed,
    ReportInvalid,
    ConfidenceEvaluated,
    DecisionRecorded,
    DefaultApplied,
    ChallengeRaised,
    ChallengeResolved,
    ChallengeEscalated,
    CheckpointCreated,
    CheckpointResolved,
    RecoveryStarted,
    TaskDispatched,
    TaskCompleted,
    TaskFailed,
    MergeStarted,
    MergeConflict,
    MergeCompleted,
}

impl EventKind {
    /// Kinds that end a run (or suspend it, for `RunPaused`).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventKind::RunCompleted
                | EventKind::RunFailed
                | EventKind::RunAborted
                | EventKind::RunPaused
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::RunStarted => "run_started",
            EventKind::RunResumed => "run_resumed",
            EventKind::RunPaused => "run_paused",
            EventKind::RunCompleted => "run_completed",
            EventKind::RunFailed => "run_failed",
            EventKind::RunAborted => "run_aborted",
            EventKind::PhaseStarted => "phase_started",
            EventKind::PhaseCompleted => "phase_completed",
            EventKind::PhaseSkipped => "phase_skipped",
            EventKind::PhaseFailed => "phase_failed",
            EventKind::InvocationFailed => "invocation_failed",
            EventKind::ReportInvalid => "report_invalid",
            EventKind::ConfidenceEvaluated => "confidence_evaluated",
            EventKind::DecisionRecorded => "decision_recorded",
            EventKind::DefaultApplied => "default_applied",
            EventKind::ChallengeRaised => "challenge_raised",
            EventKind::ChallengeResolved => "challenge_resolved",
            EventKind::ChallengeEscalated => "challenge_escalated",
            EventKind::CheckpointCreated => "checkpoint_created",
            EventKind::CheckpointResolved => "checkpoint_resolved",
            EventKind::RecoveryStarted => "recovery_started",
            EventKind::TaskDispatched => "task_dispatched",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
            EventKind::MergeStarted => "merge_started",
            EventKind::MergeConflict => "merge_conflict",
            EventKind::MergeCompleted => "merge_completed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    /// Agent, step or component that caused the event
    pub actor: String,
    #[serde(default)]
    pub detail: Value,
}

impl Event {
    /// String field from `detail`, if present.
    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.detail.get(key).and_then(|v| v.as_str())
    }
}

/// True when `events` is numbered 1, 2, 3, ... with no gaps or reordering.
pub fn is_gap_free(events: &[Event]) -> bool {
    events
        .iter()
        .enumerate()
        .all(|(i, e)| e.seq == i as u64 + 1)
}
