//! The workflow engine.
//!
//! Drives a run through its phases one at a time:
//!
//! ```text
//! start ─▶ RUNNING_PHASE(0) ─▶ … ─▶ RUNNING_PHASE(n-1) ─▶ COMPLETE
//!              │      ▲  ▲
//!              │      │  └── retry (attempt limit), challenge replay of an earlier phase
//!              ▼      │
//!      AWAITING_CHECKPOINT(i) ──resume──┘        blocked required phase ─▶ FAILED
//! ```
//!
//! Every transition is appended to the event log before the state file
//! changes, and the state file is rewritten atomically after each one, so a
//! crash leaves a run that `hive status` can explain.

use anyhow::Context;
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::challenge::{Challenge, ChallengeRecord, ChallengeRoute, ChallengeRouter, Severity, edge_key};
use crate::checkpoint::{
    Checkpoint, CheckpointDecision, CheckpointManager, CheckpointReason, new_checkpoint_id,
};
use crate::confidence::checks::{build_passed, debug_markers_absent, planned_files_touched};
use crate::confidence::{
    self, CheckResult, ConfidenceCategory, ConfidenceScore, EvaluationRound, run_evaluation_passes,
};
use crate::config::Config;
use crate::context::{self, ContextBundle, Directive, load_agent_brief};
use crate::errors::{EngineError, InvocationError};
use crate::events::{Event, EventKind, EventLog};
use crate::orchestrator::runner::{AgentBackend, InvocationRequest};
use crate::orchestrator::state::{
    AgentInvocation, Attachment, DecisionSource, Guidance, Handoff, RunState, RunStatus, RunStore,
    generate_run_id,
};
use crate::parallel::{
    CoordinatorSettings, GitWorkspace, ParallelCoordinator, ParallelOutcome, ParallelRequest,
    Workspace,
};
use crate::report::{HiveReport, ReportParser, ReportStatus};
use crate::tracker::{CliTaskTracker, GitTracker, TaskTracker, WorktreeSnapshot};
use crate::util::{slugify, tail_chars};
use crate::workflow::{Phase, PhaseKind, StepType, Workflow};

const ENGINE_ACTOR: &str = "engine";

/// Build output kept in events and directives.
const MAX_BUILD_OUTPUT: usize = 8_000;

/// What to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub objective: String,
    pub workflow: String,
    /// Run only the phases bound to this agent
    pub only: Option<String>,
    /// Files whose contents are captured into the run (`-c`)
    pub attachments: Vec<PathBuf>,
    pub autonomous: bool,
}

/// How far a `start` or `resume` call got.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    /// Set when the run paused
    pub checkpoint: Option<String>,
    pub failure: Option<String>,
    pub cost_usd: f64,
}

impl RunOutcome {
    fn from_state(state: &RunState) -> Self {
        Self {
            run_id: state.run_id.clone(),
            status: state.status,
            checkpoint: state.pending_checkpoint.clone(),
            failure: state.failure.clone(),
            cost_usd: state.cost_usd,
        }
    }

    /// 0 complete, 3 paused at a checkpoint, 1 anything else.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Complete => 0,
            RunStatus::Paused => 3,
            _ => 1,
        }
    }
}

/// Where the state machine goes after a phase attempt.
#[derive(Debug)]
enum Transition {
    Advance,
    /// Optional phase given up on
    Skip(String),
    /// Run the current phase again
    Retry,
    Pause(CheckpointReason),
    Fail(String),
    Abort,
}

/// One agent invocation, parsed and scored.
enum Attempt {
    Reported {
        attempt: u32,
        report: HiveReport,
        score: ConfidenceScore,
    },
    Failed {
        attempt: u32,
        error: InvocationError,
    },
}

struct BuildResult {
    success: bool,
    output: String,
}

pub struct Engine {
    config: Config,
    backend: Arc<dyn AgentBackend>,
    workspace: Arc<dyn Workspace>,
    tracker: Arc<dyn TaskTracker>,
    store: RunStore,
    parser: ReportParser,
    router: ChallengeRouter,
    cancel: CancellationToken,
    listener: Option<mpsc::UnboundedSender<Event>>,
}

impl Engine {
    pub fn new(config: Config, backend: Arc<dyn AgentBackend>) -> Self {
        let toml = config.toml();
        let workspace = Arc::new(GitWorkspace::new(
            config.project_dir.clone(),
            config.project_dir.join(&toml.parallel.worktrees_dir),
            toml.parallel.base_branch.clone(),
        ));
        let tracker = Arc::new(CliTaskTracker::new(
            toml.tracker.clone(),
            config.project_dir.clone(),
        ));
        Self {
            store: RunStore::new(&config),
            parser: ReportParser::new(config.verbose),
            router: ChallengeRouter::new(toml.challenge.max_rounds_per_edge),
            config,
            backend,
            workspace,
            tracker,
            cancel: CancellationToken::new(),
            listener: None,
        }
    }

    pub fn with_workspace(mut self, workspace: Arc<dyn Workspace>) -> Self {
        self.workspace = workspace;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn TaskTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Cancelling the token aborts the run at the next suspension point.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Forward every event of the runs this engine drives.
    pub fn with_listener(mut self, tx: mpsc::UnboundedSender<Event>) -> Self {
        self.listener = Some(tx);
        self
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn open_events(&self, run_id: &str) -> Result<EventLog, EngineError> {
        let log = EventLog::open(&self.store.events_path(run_id))?;
        Ok(match self.listener {
            Some(ref tx) => log.with_listener(tx.clone()),
            None => log,
        })
    }

    /// Start a new run and drive it until it completes, fails or pauses.
    pub async fn start(&self, request: RunRequest) -> Result<RunOutcome, EngineError> {
        let mut workflow = Workflow::load(&request.workflow, &self.config.workflows_dir)?;
        if let Some(ref agent) = request.only {
            workflow = workflow.only(agent)?;
        }
        self.start_workflow(workflow, request).await
    }

    /// Start a run over an already built workflow; `request.workflow` and
    /// `request.only` are not consulted.
    pub async fn start_workflow(&self, workflow: Workflow, request: RunRequest) -> Result<RunOutcome, EngineError> {
        workflow.validate()?;

        let attachments = request
            .attachments
            .iter()
            .map(|p| Attachment::read(p))
            .collect::<anyhow::Result<Vec<_>>>()?;

        self.config.ensure_directories()?;
        let run_id = generate_run_id();
        let mut state = RunState::new(
            run_id.clone(),
            request.objective.clone(),
            workflow,
            request.autonomous,
            attachments,
        );
        std::fs::create_dir_all(self.store.artifacts_dir(&run_id))
            .context("Failed to create run directory")?;

        let events = self.open_events(&run_id)?;
        let phase_names: Vec<&str> = state.workflow.phases.iter().map(|p| p.name.as_str()).collect();
        events.emit(
            EventKind::RunStarted,
            ENGINE_ACTOR,
            json!({
                "objective": state.objective,
                "workflow": state.workflow.name,
                "phases": phase_names,
                "autonomous": state.autonomous,
            }),
        )?;
        state.status = RunStatus::Running;
        state.touch();
        self.store.save(&state)?;
        self.store.set_current(&run_id)?;
        tracing::info!(run_id = %run_id, workflow = %state.workflow.name, "run started");

        self.drive_guarded(&mut state, &events).await
    }

    /// Resolve a checkpoint and continue the run.
    ///
    /// The run state is restored from the checkpoint snapshot (digest
    /// verified), not from `state.json`, so nothing that happened after the
    /// pause can leak in.
    pub async fn resume(
        &self,
        run_id: &str,
        checkpoint_id: Option<&str>,
        decision: CheckpointDecision,
        autonomous: bool,
    ) -> Result<RunOutcome, EngineError> {
        let current = self.store.load(run_id)?;
        if current.status != RunStatus::Paused {
            return Err(EngineError::RunNotResumable {
                run_id: run_id.to_string(),
                status: current.status.to_string(),
            });
        }
        let manager = CheckpointManager::for_run(&self.store.run_dir(run_id));
        let id = match checkpoint_id {
            Some(id) => id.to_string(),
            None => match current.pending_checkpoint.clone() {
                Some(id) => id,
                None => manager
                    .latest_open()?
                    .map(|cp| cp.id)
                    .ok_or_else(|| EngineError::RunNotResumable {
                        run_id: run_id.to_string(),
                        status: "paused without an open checkpoint".to_string(),
                    })?,
            },
        };
        let mut checkpoint = manager.load(&id)?;
        if checkpoint.is_resolved() {
            return Err(EngineError::RunNotResumable {
                run_id: run_id.to_string(),
                status: format!("paused, but checkpoint {} is already resolved", id),
            });
        }

        let mut state = manager.restore(&checkpoint)?;
        manager.resolve(&mut checkpoint, decision.clone())?;
        let events = self.open_events(run_id)?;
        events.emit(
            EventKind::CheckpointResolved,
            ENGINE_ACTOR,
            json!({
                "checkpoint": checkpoint.id,
                "phase": checkpoint.phase_name,
                "decision": decision.label(),
                "detail": decision_detail(&decision),
            }),
        )?;
        tracing::info!(run_id = %run_id, checkpoint = %checkpoint.id, decision = decision.label(), "checkpoint resolved");

        state.pending_checkpoint = None;
        if autonomous {
            state.autonomous = true;
        }

        if let CheckpointDecision::Reject { ref reason } = decision {
            let failure = format!("rejected at checkpoint {}: {}", checkpoint.id, reason);
            return self.fail_run(&mut state, &events, failure);
        }

        self.apply_decision(&mut state, &events, &checkpoint, &decision)?;
        state.status = RunStatus::Running;
        events.emit(
            EventKind::RunResumed,
            ENGINE_ACTOR,
            json!({"checkpoint": checkpoint.id, "phase_index": state.current_phase}),
        )?;
        state.touch();
        self.store.save(&state)?;

        self.drive_guarded(&mut state, &events).await
    }

    fn apply_decision(
        &self,
        state: &mut RunState,
        events: &EventLog,
        checkpoint: &Checkpoint,
        decision: &CheckpointDecision,
    ) -> Result<(), EngineError> {
        let phase_name = checkpoint.phase_name.clone();
        let answer = match (decision, &checkpoint.reason) {
            (CheckpointDecision::Continue, CheckpointReason::NeedsInput { default, .. }) => default.clone(),
            (CheckpointDecision::Adjust { note }, CheckpointReason::NeedsInput { .. }) => Some(note.clone()),
            _ => None,
        };
        if let (Some(value), CheckpointReason::NeedsInput { question, key, .. }) = (answer, &checkpoint.reason) {
            let key = key.clone().unwrap_or_else(|| question.clone());
            self.record_decision(state, events, &key, &value, DecisionSource::Human, &phase_name)?;
        }

        match decision {
            CheckpointDecision::Continue => {
                if checkpoint.reason.continue_reruns() {
                    state.reset_phase_budget(&phase_name);
                    return Ok(());
                }
                if checkpoint.reason != CheckpointReason::PhaseFlagged {
                    events.emit(
                        EventKind::PhaseCompleted,
                        &phase_name,
                        json!({"phase": phase_name, "index": checkpoint.phase_index, "via": "checkpoint"}),
                    )?;
                }
                self.advance(state)
            }
            CheckpointDecision::Adjust { note } => {
                state.reset_phase_budget(&phase_name);
                state.guidance = Some(Guidance {
                    phase_index: checkpoint.phase_index,
                    note: note.clone(),
                });
                Ok(())
            }
            CheckpointDecision::Reject { .. } => Ok(()),
        }
    }

    /// `drive`, recording an unexpected error as a failed run.
    async fn drive_guarded(&self, state: &mut RunState, events: &EventLog) -> Result<RunOutcome, EngineError> {
        match self.drive(state, events).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(run_id = %state.run_id, error = %e, "run stopped by an internal error");
                let _ = events.emit(
                    EventKind::RunFailed,
                    ENGINE_ACTOR,
                    json!({"error": e.to_string(), "internal": true}),
                );
                state.status = RunStatus::Failed;
                state.failure = Some(e.to_string());
                state.touch();
                let _ = self.store.save(state);
                Err(e)
            }
        }
    }

    async fn drive(&self, state: &mut RunState, events: &EventLog) -> Result<RunOutcome, EngineError> {
        loop {
            if self.cancel.is_cancelled() {
                return self.abort_run(state, events);
            }
            let index = state.current_phase;
            let Some(phase) = state.phase(index).cloned() else {
                return self.complete_run(state, events);
            };

            let transition = match phase.kind() {
                PhaseKind::Agent(agent) => {
                    let agent = agent.to_string();
                    self.run_agent_phase(state, events, index, &phase, &agent).await?
                }
                PhaseKind::Step(StepType::BuildVerify) => {
                    self.run_build_verify(state, events, index, &phase).await?
                }
                PhaseKind::Step(StepType::Parallel) => self.run_parallel(state, events, index, &phase).await?,
            };
            tracing::debug!(phase = %phase.name, transition = ?transition, "phase transition");

            match transition {
                Transition::Advance => {
                    events.emit(
                        EventKind::PhaseCompleted,
                        phase.actor(),
                        json!({
                            "phase": phase.name,
                            "index": index,
                            "attempts": state.attempts.get(&phase.name).copied().unwrap_or(0),
                        }),
                    )?;
                    if phase.checkpoint_after {
                        return self.pause(state, events, CheckpointReason::PhaseFlagged);
                    }
                    self.advance(state)?;
                }
                Transition::Skip(reason) => {
                    events.emit(
                        EventKind::PhaseSkipped,
                        phase.actor(),
                        json!({"phase": phase.name, "index": index, "reason": reason}),
                    )?;
                    self.advance(state)?;
                }
                Transition::Retry => {
                    state.touch();
                    self.store.save(state)?;
                }
                Transition::Pause(reason) => return self.pause(state, events, reason),
                Transition::Fail(reason) => {
                    events.emit(
                        EventKind::PhaseFailed,
                        phase.actor(),
                        json!({"phase": phase.name, "index": index, "reason": reason, "will_retry": false}),
                    )?;
                    return self.fail_run(state, events, reason);
                }
                Transition::Abort => return self.abort_run(state, events),
            }
        }
    }

    fn advance(&self, state: &mut RunState) -> Result<(), EngineError> {
        if let Some(name) = state.phase(state.current_phase).map(|p| p.name.clone()) {
            state.reset_phase_budget(&name);
        }
        state.current_phase += 1;
        state.current_agent = None;
        if state
            .guidance
            .as_ref()
            .is_some_and(|g| g.phase_index < state.current_phase)
        {
            state.guidance = None;
        }
        state.touch();
        self.store.save(state)?;
        Ok(())
    }

    fn pause(
        &self,
        state: &mut RunState,
        events: &EventLog,
        reason: CheckpointReason,
    ) -> Result<RunOutcome, EngineError> {
        let id = new_checkpoint_id(state.current_phase);
        let phase_name = state
            .phase(state.current_phase)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        events.emit(
            EventKind::CheckpointCreated,
            ENGINE_ACTOR,
            json!({
                "checkpoint": id,
                "phase": phase_name,
                "reason": reason.label(),
                "detail": reason.describe(),
            }),
        )?;
        events.emit(EventKind::RunPaused, ENGINE_ACTOR, json!({"checkpoint": id}))?;

        state.status = RunStatus::Paused;
        state.pending_checkpoint = Some(id.clone());
        state.touch();
        let manager = CheckpointManager::for_run(&self.store.run_dir(&state.run_id));
        manager.create(&id, state, reason, events.last_seq())?;
        self.store.save(state)?;
        tracing::info!(run_id = %state.run_id, checkpoint = %id, phase = %phase_name, "run paused");
        Ok(RunOutcome::from_state(state))
    }

    fn fail_run(&self, state: &mut RunState, events: &EventLog, reason: String) -> Result<RunOutcome, EngineError> {
        let phase = state
            .phase(state.current_phase)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        events.emit(
            EventKind::RunFailed,
            ENGINE_ACTOR,
            json!({"phase": phase, "reason": reason}),
        )?;
        state.status = RunStatus::Failed;
        state.failure = Some(reason);
        state.current_agent = None;
        state.touch();
        self.store.save(state)?;
        tracing::warn!(run_id = %state.run_id, phase = %phase, "run failed");
        Ok(RunOutcome::from_state(state))
    }

    fn abort_run(&self, state: &mut RunState, events: &EventLog) -> Result<RunOutcome, EngineError> {
        events.emit(
            EventKind::RunAborted,
            ENGINE_ACTOR,
            json!({"phase_index": state.current_phase}),
        )?;
        state.status = RunStatus::Aborted;
        state.current_agent = None;
        state.touch();
        self.store.save(state)?;
        tracing::warn!(run_id = %state.run_id, "run aborted");
        Ok(RunOutcome::from_state(state))
    }

    fn complete_run(&self, state: &mut RunState, events: &EventLog) -> Result<RunOutcome, EngineError> {
        events.emit(
            EventKind::RunCompleted,
            ENGINE_ACTOR,
            json!({
                "phases": state.workflow.phases.len(),
                "invocations": state.invocations.len(),
                "cost_usd": state.cost_usd,
            }),
        )?;
        state.status = RunStatus::Complete;
        state.current_agent = None;
        state.touch();
        self.store.save(state)?;
        tracing::info!(run_id = %state.run_id, cost_usd = state.cost_usd, "run complete");
        Ok(RunOutcome::from_state(state))
    }

    fn record_decision(
        &self,
        state: &mut RunState,
        events: &EventLog,
        key: &str,
        value: &str,
        source: DecisionSource,
        phase: &str,
    ) -> Result<(), EngineError> {
        state.record_decision(key, value, source, phase);
        events.emit(
            EventKind::DecisionRecorded,
            phase,
            json!({"key": key, "value": value, "source": source, "phase": phase}),
        )?;
        Ok(())
    }

    fn record_handoff(
        &self,
        state: &mut RunState,
        events: &EventLog,
        phase: &Phase,
        attempt: u32,
        report: &HiveReport,
    ) -> Result<(), EngineError> {
        for (i, decision) in report.decisions().into_iter().enumerate() {
            let key = decision
                .key
                .unwrap_or_else(|| format!("{}.{}", phase.name, i + 1));
            self.record_decision(state, events, &key, &decision.value, DecisionSource::Agent, &phase.name)?;
        }
        state.handoffs.push(Handoff::from_report(phase, attempt, report));
        Ok(())
    }

    fn max_attempts(&self, phase: &Phase) -> u32 {
        let defaults = self.config.toml().defaults.max_attempts.max(1);
        match phase.kind() {
            PhaseKind::Agent(agent) => self
                .config
                .toml()
                .agent_settings(agent)
                .map(|s| s.max_attempts)
                .unwrap_or(defaults),
            PhaseKind::Step(_) => defaults,
        }
    }

    /// Count a failed attempt; retry while attempts remain.
    fn retry_or_fail(
        &self,
        state: &mut RunState,
        events: &EventLog,
        index: usize,
        phase: &Phase,
        reason: String,
    ) -> Result<Transition, EngineError> {
        let failures = state.record_failure(&phase.name);
        let max = self.max_attempts(phase);
        if failures < max {
            events.emit(
                EventKind::PhaseFailed,
                phase.actor(),
                json!({
                    "phase": phase.name,
                    "index": index,
                    "reason": reason,
                    "failures": failures,
                    "max_attempts": max,
                    "will_retry": true,
                }),
            )?;
            tracing::warn!(phase = %phase.name, failures, max, "phase attempt failed, retrying");
            return Ok(Transition::Retry);
        }
        let reason = format!("{} failed after {} attempt(s): {}", phase.name, failures, reason);
        Ok(if phase.required {
            Transition::Fail(reason)
        } else {
            Transition::Skip(reason)
        })
    }

    /// Invoke the agent once with `bundle`, then parse, check and score its report.
    async fn invoke_agent(
        &self,
        state: &mut RunState,
        events: &EventLog,
        index: usize,
        phase: &Phase,
        agent: &str,
        bundle: ContextBundle,
    ) -> Result<Attempt, EngineError> {
        let toml = self.config.toml();
        let attempt = state.next_attempt(&phase.name);
        state.current_agent = Some(agent.to_string());
        state.touch();
        self.store.save(state)?;

        events.emit(
            EventKind::PhaseStarted,
            agent,
            json!({"phase": phase.name, "index": index, "agent": agent, "attempt": attempt}),
        )?;

        let settings = match toml.agent_settings(agent) {
            Ok(s) => s,
            Err(e) => {
                return Ok(Attempt::Failed {
                    attempt,
                    error: InvocationError::Backend(format!("{:#}", e)),
                });
            }
        };

        let brief = load_agent_brief(&self.config.agents_dir, agent);
        let prompt = bundle.render(&brief);
        let context_digest = context::digest(&prompt);
        let artifacts = self.store.artifacts_dir(&state.run_id);
        std::fs::create_dir_all(&artifacts).context("Failed to create artifacts directory")?;
        let stem = format!("{:02}-{}-{}", index, slugify(&phase.name, 40), attempt);
        let context_file = format!("{}.prompt.md", stem);
        let transcript_file = format!("{}.log", stem);
        crate::util::write_atomic(&artifacts.join(&context_file), prompt.as_bytes())?;

        let snapshot = if phase.role().modifies_files() {
            self.git_snapshot()
        } else {
            None
        };

        let request = InvocationRequest {
            agent: agent.to_string(),
            prompt,
            model: phase.model.clone(),
            workdir: self.config.project_dir.clone(),
            artifact: Some(artifacts.join(&transcript_file)),
            timeout: settings.timeout,
        };
        tracing::info!(phase = %phase.name, agent = %agent, attempt, "invoking agent");
        let started_at = Utc::now();
        let clock = Instant::now();
        let result = self.backend.invoke(request).await;

        let mut record = AgentInvocation {
            phase: phase.name.clone(),
            phase_index: index,
            attempt,
            agent: agent.to_string(),
            model: phase.model.clone().or(settings.model.clone()),
            context_path: format!("artifacts/{}", context_file),
            context_digest,
            transcript_path: format!("artifacts/{}", transcript_file),
            report: None,
            error: None,
            confidence: None,
            duration_ms: clock.elapsed().as_millis() as u64,
            cost_usd: None,
            started_at,
        };

        let output = match result {
            Ok(output) => output,
            Err(error) => {
                record.error = Some(error.to_string());
                state.invocations.push(record);
                state.touch();
                self.store.save(state)?;
                return Ok(Attempt::Failed { attempt, error });
            }
        };

        if let Some(cost) = output.cost_usd {
            state.cost_usd += cost;
            record.cost_usd = Some(cost);
        }

        let report = self.parser.parse_or_blocked(&output.text);
        if report.synthesized {
            events.emit(
                EventKind::ReportInvalid,
                agent,
                json!({"phase": phase.name, "attempt": attempt, "diagnostics": report.diagnostics}),
            )?;
        }

        let mut checks: Vec<CheckResult> = Vec::new();
        if let Some(ref snapshot) = snapshot {
            checks.extend(self.file_checks(snapshot, &bundle, &report));
        }

        let evaluation = if toml.evaluation.enabled && report.status.is_success() {
            run_evaluation_passes(
                self.backend.as_ref(),
                &toml.evaluation.agent,
                &toml.evaluation.passes,
                &state.objective,
                &phase.name,
                &output.text,
                &self.config.project_dir,
                settings.timeout,
            )
            .await
        } else {
            EvaluationRound::default()
        };
        state.cost_usd += evaluation.cost_usd;

        let score = confidence::score(&toml.confidence, &report, &checks, &evaluation.results);
        events.emit(
            EventKind::ConfidenceEvaluated,
            agent,
            json!({
                "phase": phase.name,
                "attempt": attempt,
                "status": report.status,
                "score": score.score,
                "category": score.category,
                "summary": score.summary(),
                "evaluation_cost_usd": evaluation.cost_usd,
            }),
        )?;

        record.report = Some(report.clone());
        record.confidence = Some(score.clone());
        state.invocations.push(record);
        state.touch();
        self.store.save(state)?;

        Ok(Attempt::Reported {
            attempt,
            report,
            score,
        })
    }

    fn git_snapshot(&self) -> Option<WorktreeSnapshot> {
        let tracker = GitTracker::open(&self.config.project_dir)?;
        match tracker.snapshot() {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(error = %e, "could not snapshot the working tree");
                None
            }
        }
    }

    /// Automated checks for phases that edit files.
    fn file_checks(&self, snapshot: &WorktreeSnapshot, bundle: &ContextBundle, report: &HiveReport) -> Vec<CheckResult> {
        let Some(tracker) = GitTracker::open(&self.config.project_dir) else {
            return Vec::new();
        };
        let touched = match tracker.touched_since(snapshot) {
            Ok(touched) => touched,
            Err(e) => {
                tracing::warn!(error = %e, "could not diff the working tree");
                return Vec::new();
            }
        };
        let mut planned = bundle.planned_files();
        if planned.is_empty() {
            planned = report.files();
        }

        let mut checks = Vec::new();
        checks.extend(planned_files_touched(&planned, &touched));
        checks.extend(debug_markers_absent(
            tracker.root(),
            &touched,
            &self.config.toml().confidence.debug_markers,
        ));
        checks
    }

    async fn run_agent_phase(
        &self,
        state: &mut RunState,
        events: &EventLog,
        index: usize,
        phase: &Phase,
        agent: &str,
    ) -> Result<Transition, EngineError> {
        let bundle = context::assemble(state, index, Vec::new())
            .with_context(|| format!("No phase at index {}", index))?;
        match self.invoke_agent(state, events, index, phase, agent, bundle).await? {
            Attempt::Failed { attempt, error } => {
                self.on_invocation_error(state, events, index, phase, attempt, error)
            }
            Attempt::Reported {
                attempt,
                report,
                score,
            } => self.route(state, events, index, phase, attempt, report, score).await,
        }
    }

    fn on_invocation_error(
        &self,
        state: &mut RunState,
        events: &EventLog,
        index: usize,
        phase: &Phase,
        attempt: u32,
        error: InvocationError,
    ) -> Result<Transition, EngineError> {
        events.emit(
            EventKind::InvocationFailed,
            phase.actor(),
            json!({
                "phase": phase.name,
                "attempt": attempt,
                "error": error.to_string(),
                "retryable": error.is_retryable(),
            }),
        )?;
        if matches!(error, InvocationError::Cancelled) {
            return Ok(Transition::Abort);
        }
        if !error.is_retryable() {
            let reason = format!("{}: {}", phase.name, error);
            return Ok(if phase.required {
                Transition::Fail(reason)
            } else {
                Transition::Skip(reason)
            });
        }
        self.retry_or_fail(state, events, index, phase, error.to_string())
    }

    #[allow(clippy::too_many_arguments)]
    async fn route(
        &self,
        state: &mut RunState,
        events: &EventLog,
        index: usize,
        phase: &Phase,
        attempt: u32,
        report: HiveReport,
        score: ConfidenceScore,
    ) -> Result<Transition, EngineError> {
        match report.status {
            ReportStatus::Complete | ReportStatus::Partial => match score.category {
                ConfidenceCategory::Fail => {
                    self.retry_or_fail(state, events, index, phase, format!("confidence {}", score.summary()))
                }
                ConfidenceCategory::ClearPass => {
                    self.record_handoff(state, events, phase, attempt, &report)?;
                    Ok(Transition::Advance)
                }
                ConfidenceCategory::NeedsReview => {
                    self.record_handoff(state, events, phase, attempt, &report)?;
                    if state.autonomous {
                        let value = format!("accepted without review at {:.2}", score.score);
                        let key = format!("{}.review", phase.name);
                        self.record_decision(state, events, &key, &value, DecisionSource::Engine, &phase.name)?;
                        Ok(Transition::Advance)
                    } else {
                        Ok(Transition::Pause(CheckpointReason::ConfidenceReview { score }))
                    }
                }
            },
            ReportStatus::Blocked => {
                let detail = if report.diagnostics.is_empty() {
                    "no diagnostics given".to_string()
                } else {
                    report.diagnostics.join("; ")
                };
                let reason = format!("{} reported blocked: {}", phase.name, detail);
                Ok(if phase.required {
                    Transition::Fail(reason)
                } else {
                    Transition::Skip(reason)
                })
            }
            ReportStatus::Challenge => self.handle_challenge(state, events, index, phase, &report).await,
            ReportStatus::NeedsInput => self.handle_needs_input(state, events, phase, &report),
        }
    }

    async fn handle_challenge(
        &self,
        state: &mut RunState,
        events: &EventLog,
        index: usize,
        phase: &Phase,
        report: &HiveReport,
    ) -> Result<Transition, EngineError> {
        let challenge = report.challenge(&phase.name).unwrap_or_else(|| Challenge {
            challenger: phase.name.clone(),
            target: None,
            issue: if report.diagnostics.is_empty() {
                "challenge raised without an issue".to_string()
            } else {
                report.diagnostics.join("; ")
            },
            evidence: None,
            suggestion: None,
            severity: Severity::default(),
            can_proceed_with_default: false,
        });
        events.emit(
            EventKind::ChallengeRaised,
            phase.actor(),
            json!({
                "challenger": challenge.challenger,
                "target": challenge.target,
                "issue": challenge.issue,
                "severity": challenge.severity,
            }),
        )?;

        match self.router.route(state, index, &challenge) {
            ChallengeRoute::InvalidTarget { reason } => Ok(Transition::Pause(CheckpointReason::ChallengeUnresolved {
                challenge,
                detail: reason,
            })),
            ChallengeRoute::Escalate {
                target_index,
                history,
            } => {
                let target = state.workflow.phases[target_index].name.clone();
                events.emit(
                    EventKind::ChallengeEscalated,
                    phase.actor(),
                    json!({"challenger": phase.name, "target": target, "challenges": history.len()}),
                )?;
                state.challenges.push(ChallengeRecord {
                    challenge,
                    target_phase: target,
                    round: history.len() as u32,
                    resolved: false,
                });
                Ok(Transition::Pause(CheckpointReason::ChallengeEscalated { challenges: history }))
            }
            ChallengeRoute::Replay {
                target_index,
                round,
            } => self.replay(state, events, phase, target_index, round, challenge).await,
        }
    }

    /// Re-invoke the challenged phase once with the challenge injected.
    /// On success the challenger runs again.
    async fn replay(
        &self,
        state: &mut RunState,
        events: &EventLog,
        phase: &Phase,
        target_index: usize,
        round: u32,
        challenge: Challenge,
    ) -> Result<Transition, EngineError> {
        let target = state.workflow.phases[target_index].clone();
        state
            .challenge_rounds
            .insert(edge_key(&phase.name, &target.name), round);
        state.challenges.push(ChallengeRecord {
            challenge: challenge.clone(),
            target_phase: target.name.clone(),
            round,
            resolved: false,
        });
        state.touch();
        self.store.save(state)?;

        let agent = match target.kind() {
            PhaseKind::Agent(agent) => agent.to_string(),
            PhaseKind::Step(step) => {
                return Ok(Transition::Pause(CheckpointReason::ChallengeUnresolved {
                    challenge,
                    detail: format!("the {} step cannot be replayed", step),
                }));
            }
        };
        tracing::info!(challenger = %phase.name, target = %target.name, round, "replaying challenged phase");

        let bundle = context::assemble(state, target_index, vec![Directive::Challenge(challenge.clone())])
            .with_context(|| format!("No phase at index {}", target_index))?;
        let detail = match self.invoke_agent(state, events, target_index, &target, &agent, bundle).await? {
            Attempt::Reported {
                attempt,
                report,
                score,
            } if report.status.is_success() && score.category != ConfidenceCategory::Fail => {
                self.record_handoff(state, events, &target, attempt, &report)?;
                if let Some(record) = state.challenges.last_mut() {
                    record.resolved = true;
                }
                events.emit(
                    EventKind::ChallengeResolved,
                    target.actor(),
                    json!({"challenger": phase.name, "target": target.name, "round": round}),
                )?;
                return Ok(Transition::Retry);
            }
            Attempt::Reported { report, score, .. } => format!(
                "replay of {} reported {} with confidence {}",
                target.name,
                report.status,
                score.summary()
            ),
            Attempt::Failed { attempt, error } => {
                events.emit(
                    EventKind::InvocationFailed,
                    target.actor(),
                    json!({"phase": target.name, "attempt": attempt, "error": error.to_string()}),
                )?;
                if matches!(error, InvocationError::Cancelled) {
                    return Ok(Transition::Abort);
                }
                format!("replay of {} failed: {}", target.name, error)
            }
        };
        Ok(Transition::Pause(CheckpointReason::ChallengeUnresolved { challenge, detail }))
    }

    fn handle_needs_input(
        &self,
        state: &mut RunState,
        events: &EventLog,
        phase: &Phase,
        report: &HiveReport,
    ) -> Result<Transition, EngineError> {
        let question = report
            .question()
            .unwrap_or_else(|| "(no question given)".to_string());
        let key = report.input_key().unwrap_or_else(|| question.clone());
        let answered = state.scratchpad().contains_key(&key);

        let defaults_used = state.defaults_applied.get(&phase.name).copied().unwrap_or(0);
        if state.autonomous
            && report.default_allowed()
            && !answered
            && let Some(default) = report.default_answer()
        {
            if defaults_used >= self.max_attempts(phase) {
                tracing::warn!(
                    phase = %phase.name,
                    defaults_used,
                    "agent keeps asking after applied defaults; pausing for a human"
                );
                return Ok(Transition::Pause(CheckpointReason::NeedsInput {
                    question,
                    default: Some(default),
                    key: Some(key),
                }));
            }
            state.record_default_applied(&phase.name);
            state.record_decision(&key, &default, DecisionSource::Default, &phase.name);
            events.emit(
                EventKind::DefaultApplied,
                phase.actor(),
                json!({"phase": phase.name, "key": key, "question": question, "value": default}),
            )?;
            return Ok(Transition::Retry);
        }

        Ok(Transition::Pause(CheckpointReason::NeedsInput {
            question,
            default: report.default_answer(),
            key: Some(key),
        }))
    }

    async fn run_build(&self, cmd: &str, timeout: Duration) -> BuildResult {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(cmd)
            .current_dir(&self.config.project_dir)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        tokio::select! {
            _ = self.cancel.cancelled() => BuildResult {
                success: false,
                output: "build cancelled".to_string(),
            },
            result = tokio::time::timeout(timeout, command.output()) => match result {
                Ok(Ok(output)) => {
                    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                    text.push_str(&String::from_utf8_lossy(&output.stderr));
                    BuildResult {
                        success: output.status.success(),
                        output: text,
                    }
                }
                Ok(Err(e)) => BuildResult {
                    success: false,
                    output: format!("failed to run build command: {}", e),
                },
                Err(_) => BuildResult {
                    success: false,
                    output: format!("build timed out after {}s", timeout.as_secs()),
                },
            },
        }
    }

    /// Run the build; on failure hand it to the recovery agent, then rebuild.
    async fn run_build_verify(
        &self,
        state: &mut RunState,
        events: &EventLog,
        index: usize,
        phase: &Phase,
    ) -> Result<Transition, EngineError> {
        let verify = self.config.toml().verify.clone();
        let attempt = state.next_attempt(&phase.name);
        state.current_agent = None;
        state.touch();
        self.store.save(state)?;
        events.emit(
            EventKind::PhaseStarted,
            phase.actor(),
            json!({"phase": phase.name, "index": index, "step": "build_verify", "attempt": attempt}),
        )?;

        let Some(cmd) = verify.build_cmd.clone().filter(|c| !c.trim().is_empty()) else {
            tracing::info!(phase = %phase.name, "no build command configured, skipping verification");
            return Ok(Transition::Advance);
        };
        let timeout = Duration::from_secs(verify.timeout_secs);

        let mut result = self.run_build(&cmd, timeout).await;
        let mut recoveries = 0;
        while !result.success && recoveries < verify.max_recovery_attempts {
            if self.cancel.is_cancelled() {
                return Ok(Transition::Abort);
            }
            recoveries += 1;
            events.emit(
                EventKind::RecoveryStarted,
                &verify.recovery_agent,
                json!({
                    "phase": phase.name,
                    "attempt": recoveries,
                    "command": cmd,
                    "output": tail_chars(&result.output, 2_000),
                }),
            )?;

            let recovery_phase = Phase::agent(&verify.recovery_agent).named(&format!("{}-recovery", phase.name));
            let bundle = context::assemble_for(
                state,
                &recovery_phase,
                index,
                vec![Directive::BuildFailure {
                    command: cmd.clone(),
                    output: tail_chars(&result.output, MAX_BUILD_OUTPUT).to_string(),
                }],
            );
            if let Attempt::Failed { attempt, error } = self
                .invoke_agent(state, events, index, &recovery_phase, &verify.recovery_agent, bundle)
                .await?
            {
                events.emit(
                    EventKind::InvocationFailed,
                    &verify.recovery_agent,
                    json!({"phase": recovery_phase.name, "attempt": attempt, "error": error.to_string()}),
                )?;
                if matches!(error, InvocationError::Cancelled) {
                    return Ok(Transition::Abort);
                }
            }
            result = self.run_build(&cmd, timeout).await;
        }
        if self.cancel.is_cancelled() {
            return Ok(Transition::Abort);
        }

        let check = build_passed(result.success, tail_chars(&result.output, 2_000));
        let report = HiveReport {
            status: if result.success {
                ReportStatus::Complete
            } else {
                ReportStatus::Blocked
            },
            confidence: Some(if result.success { 1.0 } else { 0.0 }),
            diagnostics: if result.success {
                Vec::new()
            } else {
                vec![tail_chars(&result.output, 2_000).to_string()]
            },
            payload: json!({
                "command": cmd,
                "recoveries": recoveries,
                "notes": format!("`{}` {} after {} recovery attempt(s)", cmd,
                    if result.success { "passed" } else { "failed" }, recoveries),
            }),
            synthesized: false,
        };
        let score = confidence::score(&self.config.toml().confidence, &report, &[check], &[]);
        events.emit(
            EventKind::ConfidenceEvaluated,
            phase.actor(),
            json!({
                "phase": phase.name,
                "attempt": attempt,
                "status": report.status,
                "score": score.score,
                "category": score.category,
                "summary": score.summary(),
            }),
        )?;

        if result.success {
            self.record_handoff(state, events, phase, attempt, &report)?;
            return Ok(Transition::Advance);
        }
        let reason = format!(
            "build command `{}` still failing after {} recovery attempt(s): {}",
            cmd,
            recoveries,
            tail_chars(&result.output, 500).trim()
        );
        Ok(if phase.required {
            Transition::Fail(reason)
        } else {
            Transition::Skip(reason)
        })
    }

    /// Tasks for a parallel step: from the latest handoff that proposed
    /// some, else whatever the tracker reports ready.
    async fn parallel_tasks(&self, state: &RunState) -> anyhow::Result<Vec<crate::tracker::Task>> {
        if let Some(handoff) = state.handoffs.iter().rev().find(|h| !h.tasks.is_empty()) {
            return Ok(handoff.tasks.clone());
        }
        self.tracker.ready().await
    }

    async fn run_parallel(
        &self,
        state: &mut RunState,
        events: &EventLog,
        index: usize,
        phase: &Phase,
    ) -> Result<Transition, EngineError> {
        let toml = self.config.toml();
        let attempt = state.next_attempt(&phase.name);
        state.current_agent = Some(toml.parallel.task_agent.clone());
        state.touch();
        self.store.save(state)?;
        events.emit(
            EventKind::PhaseStarted,
            phase.actor(),
            json!({"phase": phase.name, "index": index, "step": "parallel", "attempt": attempt}),
        )?;

        let tasks = match self.parallel_tasks(state).await {
            Ok(tasks) => tasks,
            Err(e) => {
                return self.retry_or_fail(state, events, index, phase, format!("task tracker query failed: {:#}", e));
            }
        };
        if tasks.is_empty() {
            tracing::info!(phase = %phase.name, "no tasks to run");
            return Ok(Transition::Advance);
        }

        let settings = match toml.agent_settings(&toml.parallel.task_agent) {
            Ok(s) => s,
            Err(e) => return Ok(Transition::Fail(format!("{:#}", e))),
        };
        let coordinator = ParallelCoordinator::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.workspace),
            events.clone(),
            CoordinatorSettings {
                max_parallel: self.config.settings().max_parallel(),
                task_agent: toml.parallel.task_agent.clone(),
                merge_agent: toml.parallel.merge_agent.clone(),
                shared_labels: toml.parallel.shared_labels.clone(),
                timeout: settings.timeout,
                max_attempts: settings.max_attempts,
                artifacts_dir: self.store.artifacts_dir(&state.run_id),
            },
            self.cancel.clone(),
        );
        let base = context::assemble(state, index, Vec::new())
            .with_context(|| format!("No phase at index {}", index))?;
        let total = tasks.len();
        let outcome = coordinator
            .execute(ParallelRequest {
                scope: state.run_id.clone(),
                phase: phase.name.clone(),
                base,
                task_brief: load_agent_brief(&self.config.agents_dir, &toml.parallel.task_agent),
                merge_brief: load_agent_brief(&self.config.agents_dir, &toml.parallel.merge_agent),
                tasks,
            })
            .await?;

        self.record_parallel(state, index, phase, attempt, &outcome);
        state.touch();
        self.store.save(state)?;

        if outcome.cancelled {
            return Ok(Transition::Abort);
        }
        if !outcome.unresolved.is_empty() {
            return Ok(Transition::Pause(CheckpointReason::MergeConflict {
                unresolved: outcome.unresolved.clone(),
            }));
        }

        let checks: Vec<CheckResult> = outcome
            .tasks
            .iter()
            .map(|t| {
                let name = format!("task {}", t.task.id);
                if t.succeeded() {
                    CheckResult::pass(&name)
                } else {
                    CheckResult::soft_fail(&name, t.error.clone().unwrap_or_else(|| "did not complete".to_string()))
                }
            })
            .collect();
        let completed = outcome.completed().len();
        let report = HiveReport {
            status: if completed == total {
                ReportStatus::Complete
            } else {
                ReportStatus::Partial
            },
            confidence: Some(completed as f64 / total as f64),
            diagnostics: Vec::new(),
            payload: json!({}),
            synthesized: false,
        };
        let score = confidence::score(&toml.confidence, &report, &checks, &[]);
        events.emit(
            EventKind::ConfidenceEvaluated,
            phase.actor(),
            json!({
                "phase": phase.name,
                "attempt": attempt,
                "status": report.status,
                "score": score.score,
                "category": score.category,
                "summary": score.summary(),
            }),
        )?;

        match score.category {
            ConfidenceCategory::ClearPass => Ok(Transition::Advance),
            ConfidenceCategory::NeedsReview if state.autonomous => {
                let value = format!("accepted {}/{} tasks without review", completed, total);
                let key = format!("{}.review", phase.name);
                self.record_decision(state, events, &key, &value, DecisionSource::Engine, &phase.name)?;
                Ok(Transition::Advance)
            }
            ConfidenceCategory::NeedsReview => Ok(Transition::Pause(CheckpointReason::ConfidenceReview { score })),
            ConfidenceCategory::Fail => {
                let reason = format!("{} of {} tasks completed", completed, total);
                Ok(if phase.required {
                    Transition::Fail(reason)
                } else {
                    Transition::Skip(reason)
                })
            }
        }
    }

    /// Append one invocation record per task and a handoff summarising the batch.
    fn record_parallel(
        &self,
        state: &mut RunState,
        index: usize,
        phase: &Phase,
        attempt: u32,
        outcome: &ParallelOutcome,
    ) {
        let task_agent = self.config.toml().parallel.task_agent.clone();
        let run_dir = self.store.run_dir(&state.run_id);
        let relative = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.strip_prefix(&run_dir).unwrap_or(p).display().to_string())
                .unwrap_or_default()
        };

        state.cost_usd += outcome.cost_usd;
        for task in &outcome.tasks {
            state.invocations.push(AgentInvocation {
                phase: format!("{}:{}", phase.name, task.task.id),
                phase_index: index,
                attempt: task.attempts,
                agent: task_agent.clone(),
                model: None,
                context_path: relative(&task.context_path),
                context_digest: task.context_digest.clone(),
                transcript_path: relative(&task.transcript_path),
                report: task.report.clone(),
                error: task.error.clone(),
                confidence: None,
                duration_ms: task.duration_ms,
                cost_usd: task.cost_usd,
                started_at: Utc::now(),
            });
        }

        let mut files: Vec<String> = outcome
            .completed()
            .iter()
            .filter_map(|t| t.report.as_ref())
            .flat_map(|r| r.files())
            .collect();
        files.sort();
        files.dedup();
        let failed: Vec<&str> = outcome.failed().iter().map(|t| t.task.id.as_str()).collect();
        let mut notes = format!("merged tasks: {}", outcome.merged.join(", "));
        if !failed.is_empty() {
            notes.push_str(&format!("; failed tasks: {}", failed.join(", ")));
        }
        if !outcome.skipped.is_empty() {
            notes.push_str(&format!("; skipped tasks: {}", outcome.skipped.join(", ")));
        }
        if !outcome.unresolved.is_empty() {
            notes.push_str(&format!("; unresolved merges: {}", outcome.unresolved.join(", ")));
        }
        state.handoffs.push(Handoff {
            phase: phase.name.clone(),
            agent: Some(task_agent),
            attempt,
            decisions: Vec::new(),
            files,
            notes: Some(notes),
            rationale: None,
            tasks: Vec::new(),
            written_at: Utc::now(),
        });
    }
}

fn decision_detail(decision: &CheckpointDecision) -> Option<&str> {
    match decision {
        CheckpointDecision::Continue => None,
        CheckpointDecision::Adjust { note } => Some(note.as_str()),
        CheckpointDecision::Reject { reason } => Some(reason.as_str()),
    }
}
