//! Parallel execution coordinator.
//!
//! Dispatches one agent invocation per task, each in its own worktree, with
//! at most `max_parallel` running at once. A task that waits on others in the
//! batch starts from their branches. When every task is terminal a
//! single merge stage integrates the successful branches in `merge_order`,
//! handing conflicts to the merge agent.

use anyhow::{Context, Result};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::context::{ContextBundle, Directive, digest};
use crate::errors::InvocationError;
use crate::events::{EventKind, EventLog};
use crate::orchestrator::runner::{AgentBackend, InvocationRequest};
use crate::parallel::merge::merge_order;
use crate::parallel::scheduler::TaskScheduler;
use crate::parallel::workspace::{MergeOutcome, TaskWorkspace, Workspace};
use crate::report::{HiveReport, ReportParser};
use crate::tracker::Task;
use crate::util::slugify;
use crate::workflow::Role;

/// Knobs for one coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub max_parallel: usize,
    pub task_agent: String,
    pub merge_agent: String,
    pub shared_labels: Vec<String>,
    pub timeout: Duration,
    /// Attempts per task for retryable invocation errors
    pub max_attempts: u32,
    pub artifacts_dir: PathBuf,
}

/// One batch to run.
#[derive(Debug, Clone)]
pub struct ParallelRequest {
    /// Namespace for branches and worktrees (the run id)
    pub scope: String,
    /// Phase name, used as the event actor and artifact prefix
    pub phase: String,
    /// Context shared by every task; each task adds its own directive
    pub base: ContextBundle,
    pub task_brief: String,
    pub merge_brief: String,
    pub tasks: Vec<Task>,
}

/// How one task ended.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task: Task,
    pub workspace: Option<TaskWorkspace>,
    pub report: Option<HiveReport>,
    pub error: Option<String>,
    pub attempts: u32,
    pub cost_usd: Option<f64>,
    pub duration_ms: u64,
    pub context_path: Option<PathBuf>,
    pub context_digest: String,
    pub transcript_path: Option<PathBuf>,
    pub committed: bool,
}

impl TaskOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
            && self
                .report
                .as_ref()
                .map(|r| r.status.is_success())
                .unwrap_or(false)
    }

    fn failure(&self) -> String {
        if let Some(ref e) = self.error {
            return e.clone();
        }
        match self.report {
            Some(ref r) if !r.diagnostics.is_empty() => {
                format!("{}: {}", r.status, r.diagnostics.join("; "))
            }
            Some(ref r) => format!("reported {}", r.status),
            None => "no report".to_string(),
        }
    }
}

/// Result of the whole batch.
#[derive(Debug, Clone, Default)]
pub struct ParallelOutcome {
    /// Terminal tasks in completion order
    pub tasks: Vec<TaskOutcome>,
    /// Tasks never dispatched because a dependency failed
    pub skipped: Vec<String>,
    /// Task ids merged into the main line, in merge order
    pub merged: Vec<String>,
    /// Task ids whose merge could not be reconciled
    pub unresolved: Vec<String>,
    pub cost_usd: f64,
    pub cancelled: bool,
}

impl ParallelOutcome {
    pub fn failed(&self) -> Vec<&TaskOutcome> {
        self.tasks.iter().filter(|t| !t.succeeded()).collect()
    }

    pub fn completed(&self) -> Vec<&TaskOutcome> {
        self.tasks.iter().filter(|t| t.succeeded()).collect()
    }
}

pub struct ParallelCoordinator {
    backend: Arc<dyn AgentBackend>,
    workspace: Arc<dyn Workspace>,
    events: EventLog,
    settings: CoordinatorSettings,
    cancel: CancellationToken,
}

struct TaskJob {
    backend: Arc<dyn AgentBackend>,
    workspace: Arc<dyn Workspace>,
    task: Task,
    ws: TaskWorkspace,
    agent: String,
    prompt: String,
    context_path: Option<PathBuf>,
    context_digest: String,
    transcript_prefix: PathBuf,
    timeout: Duration,
    max_attempts: u32,
}

impl TaskJob {
    async fn run(self) -> TaskOutcome {
        let start = Instant::now();
        let mut outcome = TaskOutcome {
            task: self.task.clone(),
            workspace: Some(self.ws.clone()),
            report: None,
            error: None,
            attempts: 0,
            cost_usd: None,
            duration_ms: 0,
            context_path: self.context_path.clone(),
            context_digest: self.context_digest.clone(),
            transcript_path: None,
            committed: false,
        };
        let max_attempts = self.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            outcome.attempts = attempt;
            let transcript = self
                .transcript_prefix
                .with_extension(format!("{}.log", attempt));
            outcome.transcript_path = Some(transcript.clone());
            let request = InvocationRequest {
                agent: self.agent.clone(),
                prompt: self.prompt.clone(),
                model: None,
                workdir: self.ws.path.clone(),
                artifact: Some(transcript),
                timeout: self.timeout,
            };
            match self.backend.invoke(request).await {
                Ok(output) => {
                    if let Some(cost) = output.cost_usd {
                        *outcome.cost_usd.get_or_insert(0.0) += cost;
                    }
                    outcome.error = None;
                    outcome.report = Some(ReportParser::new(false).parse_or_blocked(&output.text));
                    break;
                }
                Err(e) => {
                    let retry = e.is_retryable() && attempt < max_attempts;
                    tracing::warn!(task = %self.task.id, attempt, error = %e, retry, "task invocation failed");
                    outcome.error = Some(e.to_string());
                    if !retry || matches!(e, InvocationError::Cancelled) {
                        break;
                    }
                }
            }
        }

        if outcome.succeeded() {
            let message = format!("{}: {}", self.task.id, self.task.title);
            match self.workspace.commit(&self.ws, &message).await {
                Ok(committed) => outcome.committed = committed,
                Err(e) => outcome.error = Some(format!("commit failed: {:#}", e)),
            }
        }
        outcome.duration_ms = start.elapsed().as_millis() as u64;
        outcome
    }
}

impl ParallelCoordinator {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        workspace: Arc<dyn Workspace>,
        events: EventLog,
        settings: CoordinatorSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            workspace,
            events,
            settings,
            cancel,
        }
    }

    fn task_prompt(&self, request: &ParallelRequest, task: &Task) -> String {
        let mut bundle = request.base.clone();
        bundle.agent = self.settings.task_agent.clone();
        bundle.role = Role::Execute;
        bundle.directives.push(Directive::Task(task.clone()));
        bundle.render(&request.task_brief)
    }

    fn artifact_stem(&self, request: &ParallelRequest, what: &str, id: &str) -> PathBuf {
        self.settings.artifacts_dir.join(format!(
            "{}-{}-{}",
            slugify(&request.phase, 40),
            what,
            slugify(id, 40)
        ))
    }

    /// Run every task, then merge. Returns once all tasks are terminal and
    /// the merge stage has finished (or the run was cancelled).
    pub async fn execute(&self, request: ParallelRequest) -> Result<ParallelOutcome> {
        let mut scheduler = TaskScheduler::new(request.tasks.clone())
            .context("Invalid task batch for parallel step")?;
        let mut result = ParallelOutcome::default();
        if request.tasks.is_empty() {
            return Ok(result);
        }

        let waves = scheduler.waves();
        tracing::info!(
            phase = %request.phase,
            tasks = request.tasks.len(),
            waves = waves.len(),
            max_parallel = self.settings.max_parallel,
            "dispatching parallel tasks"
        );
        std::fs::create_dir_all(&self.settings.artifacts_dir)
            .context("Failed to create artifacts directory")?;

        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel.max(1)));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<TaskOutcome>();
        let mut active = 0usize;
        // Branches of tasks that finished successfully, by task id.
        let mut finished: HashMap<String, String> = HashMap::new();

        loop {
            if !self.cancel.is_cancelled() {
                for task in scheduler.ready() {
                    if active >= self.settings.max_parallel.max(1) {
                        break;
                    }
                    let permit = semaphore.clone().acquire_owned().await?;
                    scheduler.mark_running(&task.id);

                    let bases: Vec<String> = task
                        .blocked_by
                        .iter()
                        .filter_map(|dep| finished.get(dep).cloned())
                        .collect();
                    let ws = match self.workspace.provision(&request.scope, &task, &bases).await {
                        Ok(ws) => ws,
                        Err(e) => {
                            let error = format!("provisioning failed: {:#}", e);
                            self.record_failure(&mut scheduler, &mut result, &task, &error)?;
                            continue;
                        }
                    };

                    let prompt = self.task_prompt(&request, &task);
                    let stem = self.artifact_stem(&request, "task", &task.id);
                    let context_path = stem.with_extension("prompt.md");
                    let context_path = match std::fs::write(&context_path, &prompt) {
                        Ok(()) => Some(context_path),
                        Err(e) => {
                            tracing::warn!(task = %task.id, error = %e, "could not write task context");
                            None
                        }
                    };

                    self.events.emit(
                        EventKind::TaskDispatched,
                        &self.settings.task_agent,
                        json!({
                            "phase": request.phase,
                            "task": task.id,
                            "title": task.title,
                            "branch": ws.branch,
                            "worktree": ws.path.display().to_string(),
                        }),
                    )?;

                    let job = TaskJob {
                        backend: Arc::clone(&self.backend),
                        workspace: Arc::clone(&self.workspace),
                        task: task.clone(),
                        ws,
                        agent: self.settings.task_agent.clone(),
                        context_digest: digest(&prompt),
                        prompt,
                        context_path,
                        transcript_prefix: stem,
                        timeout: self.settings.timeout,
                        max_attempts: self.settings.max_attempts,
                    };
                    let tx = result_tx.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let outcome = job.run().await;
                        tx.send(outcome).ok();
                    });
                    active += 1;
                }
            }

            if active == 0 {
                break;
            }

            match result_rx.recv().await {
                Some(outcome) => {
                    active -= 1;
                    if let Some(cost) = outcome.cost_usd {
                        result.cost_usd += cost;
                    }
                    if outcome.succeeded() {
                        scheduler.mark_completed(&outcome.task.id);
                        if let Some(ref ws) = outcome.workspace {
                            finished.insert(outcome.task.id.clone(), ws.branch.clone());
                        }
                        self.events.emit(
                            EventKind::TaskCompleted,
                            &self.settings.task_agent,
                            json!({
                                "phase": request.phase,
                                "task": outcome.task.id,
                                "attempts": outcome.attempts,
                                "committed": outcome.committed,
                                "cost_usd": outcome.cost_usd,
                            }),
                        )?;
                    } else {
                        let error = outcome.failure();
                        self.events.emit(
                            EventKind::TaskFailed,
                            &self.settings.task_agent,
                            json!({
                                "phase": request.phase,
                                "task": outcome.task.id,
                                "attempts": outcome.attempts,
                                "error": error,
                            }),
                        )?;
                        let skipped = scheduler.mark_failed(&outcome.task.id, &error);
                        self.record_skipped(&mut result, &request.phase, &outcome.task.id, skipped)?;
                    }
                    result.tasks.push(outcome);
                }
                None => break,
            }
        }

        if self.cancel.is_cancelled() {
            result.cancelled = true;
            self.cleanup(&result).await;
            return Ok(result);
        }

        self.merge_all(&request, &scheduler, &mut result).await?;
        self.cleanup(&result).await;
        Ok(result)
    }

    fn record_failure(
        &self,
        scheduler: &mut TaskScheduler,
        result: &mut ParallelOutcome,
        task: &Task,
        error: &str,
    ) -> Result<()> {
        tracing::warn!(task = %task.id, error = %error, "task failed before dispatch");
        self.events.emit(
            EventKind::TaskFailed,
            &self.settings.task_agent,
            json!({"task": task.id, "attempts": 0, "error": error}),
        )?;
        let skipped = scheduler.mark_failed(&task.id, error);
        result.tasks.push(TaskOutcome {
            task: task.clone(),
            workspace: None,
            report: None,
            error: Some(error.to_string()),
            attempts: 0,
            cost_usd: None,
            duration_ms: 0,
            context_path: None,
            context_digest: String::new(),
            transcript_path: None,
            committed: false,
        });
        self.record_skipped(result, "", &task.id, skipped)
    }

    fn record_skipped(
        &self,
        result: &mut ParallelOutcome,
        phase: &str,
        failed: &str,
        skipped: Vec<String>,
    ) -> Result<()> {
        for id in skipped {
            self.events.emit(
                EventKind::TaskFailed,
                &self.settings.task_agent,
                json!({
                    "phase": phase,
                    "task": id,
                    "attempts": 0,
                    "error": format!("skipped: dependency {} failed", failed),
                }),
            )?;
            result.skipped.push(id);
        }
        Ok(())
    }

    async fn merge_all(
        &self,
        request: &ParallelRequest,
        scheduler: &TaskScheduler,
        result: &mut ParallelOutcome,
    ) -> Result<()> {
        let completed: Vec<Task> = result.completed().iter().map(|t| t.task.clone()).collect();
        let order = merge_order(scheduler.graph(), &completed, &self.settings.shared_labels);
        let order_ids: Vec<&str> = order.iter().map(|t| t.id.as_str()).collect();

        self.events.emit(
            EventKind::MergeStarted,
            &request.phase,
            json!({"phase": request.phase, "order": order_ids}),
        )?;

        let mut merged_intents: Vec<String> = Vec::new();
        for task in &order {
            let Some(outcome) = result.tasks.iter().find(|t| t.task.id == task.id) else {
                continue;
            };
            let Some(ws) = outcome.workspace.clone() else {
                continue;
            };
            let intent = task_intent(outcome);

            let merged = match self.workspace.merge(&ws).await {
                Ok(MergeOutcome::Merged) => true,
                Ok(MergeOutcome::Conflict { files }) => {
                    self.events.emit(
                        EventKind::MergeConflict,
                        &self.settings.merge_agent,
                        json!({"task": task.id, "branch": ws.branch, "files": files}),
                    )?;
                    let reconciled = self
                        .reconcile(request, &ws, &files, &intent, &merged_intents, result)
                        .await;
                    if !reconciled && let Err(e) = self.workspace.abort_merge().await {
                        tracing::error!(task = %task.id, error = %e, "merge --abort failed");
                    }
                    reconciled
                }
                Err(e) => {
                    tracing::warn!(task = %task.id, error = %e, "merge failed");
                    false
                }
            };

            if merged {
                result.merged.push(task.id.clone());
                merged_intents.push(intent);
            } else {
                result.unresolved.push(task.id.clone());
            }
        }

        self.events.emit(
            EventKind::MergeCompleted,
            &request.phase,
            json!({
                "phase": request.phase,
                "merged": result.merged,
                "unresolved": result.unresolved,
            }),
        )?;
        Ok(())
    }

    /// Ask the merge agent to resolve a conflicted merge in the main tree.
    async fn reconcile(
        &self,
        request: &ParallelRequest,
        ws: &TaskWorkspace,
        files: &[String],
        incoming: &str,
        merged_intents: &[String],
        result: &mut ParallelOutcome,
    ) -> bool {
        let mut intents = vec![format!("incoming {}", incoming)];
        intents.extend(merged_intents.iter().map(|i| format!("already merged {}", i)));

        let mut bundle = request.base.clone();
        bundle.agent = self.settings.merge_agent.clone();
        bundle.role = Role::Execute;
        bundle.directives = vec![Directive::MergeConflict {
            branch: ws.branch.clone(),
            files: files.to_vec(),
            intents,
        }];
        let invocation = InvocationRequest {
            agent: self.settings.merge_agent.clone(),
            prompt: bundle.render(&request.merge_brief),
            model: None,
            workdir: self.workspace.main_dir().to_path_buf(),
            artifact: Some(
                self.artifact_stem(request, "merge", &ws.task_id)
                    .with_extension("log"),
            ),
            timeout: self.settings.timeout,
        };

        let report = match self.backend.invoke(invocation).await {
            Ok(output) => {
                if let Some(cost) = output.cost_usd {
                    result.cost_usd += cost;
                }
                ReportParser::new(false).parse_or_blocked(&output.text)
            }
            Err(e) => {
                tracing::warn!(task = %ws.task_id, error = %e, "merge agent failed");
                return false;
            }
        };
        if !report.status.is_success() {
            tracing::warn!(task = %ws.task_id, status = %report.status, "merge agent did not resolve the conflict");
            return false;
        }

        match self.workspace.finish_merge(ws).await {
            Ok(MergeOutcome::Merged) => true,
            Ok(MergeOutcome::Conflict { files }) => {
                tracing::warn!(task = %ws.task_id, files = ?files, "conflicts remain after reconciliation");
                false
            }
            Err(e) => {
                tracing::warn!(task = %ws.task_id, error = %e, "could not conclude merge");
                false
            }
        }
    }

    async fn cleanup(&self, result: &ParallelOutcome) {
        for outcome in &result.tasks {
            if let Some(ref ws) = outcome.workspace
                && let Err(e) = self.workspace.cleanup(ws).await
            {
                tracing::warn!(task = %outcome.task.id, error = %e, "worktree cleanup failed");
            }
        }
    }
}

fn task_intent(outcome: &TaskOutcome) -> String {
    let mut intent = format!("{} ({})", outcome.task.id, outcome.task.title);
    if let Some(notes) = outcome.report.as_ref().and_then(|r| r.notes()) {
        intent.push_str(": ");
        intent.push_str(&notes);
    }
    intent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::MergeError;
    use crate::events::read_events;
    use crate::orchestrator::runner::InvocationOutput;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Completes every task after a short delay, tracking peak concurrency.
    struct SlowBackend {
        live: AtomicUsize,
        peak: AtomicUsize,
        fail_task: Option<String>,
    }

    #[async_trait]
    impl AgentBackend for SlowBackend {
        async fn invoke(&self, request: InvocationRequest) -> Result<InvocationOutput, InvocationError> {
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(live, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.live.fetch_sub(1, Ordering::SeqCst);

            let status = match self.fail_task {
                Some(ref id) if request.prompt.contains(&format!("Implement task {}:", id)) => "blocked",
                _ => "complete",
            };
            Ok(InvocationOutput {
                text: format!("done\nHIVE_REPORT {{\"status\": \"{}\", \"confidence\": 0.9}} END_HIVE_REPORT", status),
                exit_code: 0,
                duration: Duration::from_millis(30),
                cost_usd: Some(0.5),
            })
        }
    }

    /// Records operations; `conflicts` names tasks whose first merge conflicts.
    struct FakeWorkspace {
        root: PathBuf,
        log: Mutex<Vec<String>>,
        conflicts: HashSet<String>,
    }

    #[async_trait]
    impl Workspace for FakeWorkspace {
        async fn provision(&self, scope: &str, task: &Task, bases: &[String]) -> Result<TaskWorkspace> {
            let mut line = format!("provision {}", task.id);
            if !bases.is_empty() {
                line.push_str(&format!(" from {}", bases.join(",")));
            }
            self.log.lock().unwrap().push(line);
            Ok(TaskWorkspace {
                task_id: task.id.clone(),
                path: self.root.clone(),
                branch: format!("hive/{}/{}", scope, task.id),
            })
        }
        async fn commit(&self, ws: &TaskWorkspace, _message: &str) -> Result<bool> {
            self.log.lock().unwrap().push(format!("commit {}", ws.task_id));
            Ok(true)
        }
        async fn merge(&self, ws: &TaskWorkspace) -> Result<MergeOutcome, MergeError> {
            self.log.lock().unwrap().push(format!("merge {}", ws.task_id));
            if self.conflicts.contains(&ws.task_id) {
                return Ok(MergeOutcome::Conflict {
                    files: vec!["src/lib.rs".to_string()],
                });
            }
            Ok(MergeOutcome::Merged)
        }
        async fn finish_merge(&self, ws: &TaskWorkspace) -> Result<MergeOutcome, MergeError> {
            self.log.lock().unwrap().push(format!("finish {}", ws.task_id));
            Ok(MergeOutcome::Merged)
        }
        async fn abort_merge(&self) -> Result<()> {
            self.log.lock().unwrap().push("abort".to_string());
            Ok(())
        }
        async fn cleanup(&self, ws: &TaskWorkspace) -> Result<()> {
            self.log.lock().unwrap().push(format!("cleanup {}", ws.task_id));
            Ok(())
        }
        fn main_dir(&self) -> &Path {
            &self.root
        }
    }

    fn bundle() -> ContextBundle {
        ContextBundle {
            objective: "three features".to_string(),
            phase: "parallel".to_string(),
            agent: "implementer".to_string(),
            role: Role::Execute,
            attachments: Vec::new(),
            decisions: Vec::new(),
            handoffs: Vec::new(),
            directives: Vec::new(),
        }
    }

    fn setup(
        dir: &Path,
        max_parallel: usize,
        fail_task: Option<&str>,
        conflicts: &[&str],
    ) -> (ParallelCoordinator, Arc<SlowBackend>, Arc<FakeWorkspace>, EventLog) {
        let backend = Arc::new(SlowBackend {
            live: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            fail_task: fail_task.map(String::from),
        });
        let workspace = Arc::new(FakeWorkspace {
            root: dir.to_path_buf(),
            log: Mutex::new(Vec::new()),
            conflicts: conflicts.iter().map(|s| s.to_string()).collect(),
        });
        let events = EventLog::open(&dir.join("events.jsonl")).unwrap();
        let settings = CoordinatorSettings {
            max_parallel,
            task_agent: "implementer".to_string(),
            merge_agent: "merger".to_string(),
            shared_labels: vec!["infra".to_string()],
            timeout: Duration::from_secs(5),
            max_attempts: 1,
            artifacts_dir: dir.join("artifacts"),
        };
        let coordinator = ParallelCoordinator::new(
            backend.clone(),
            workspace.clone(),
            events.clone(),
            settings,
            CancellationToken::new(),
        );
        (coordinator, backend, workspace, events)
    }

    fn request(tasks: Vec<Task>) -> ParallelRequest {
        ParallelRequest {
            scope: "r1".to_string(),
            phase: "parallel".to_string(),
            base: bundle(),
            task_brief: "You implement one task.".to_string(),
            merge_brief: "You resolve merge conflicts.".to_string(),
            tasks,
        }
    }

    fn abc() -> Vec<Task> {
        vec![Task::new("A", "alpha"), Task::new("B", "beta"), Task::new("C", "gamma")]
    }

    #[tokio::test]
    async fn test_all_dispatches_precede_single_merge() {
        let dir = tempdir().unwrap();
        let (coordinator, backend, _ws, events) = setup(dir.path(), 4, None, &[]);

        let outcome = coordinator.execute(request(abc())).await.unwrap();
        assert_eq!(outcome.completed().len(), 3);
        assert_eq!(outcome.merged, vec!["A", "B", "C"]);
        assert!(outcome.unresolved.is_empty());
        assert!((outcome.cost_usd - 1.5).abs() < 1e-9);
        assert!(backend.peak.load(Ordering::SeqCst) > 1);

        let log = read_events(&events.path()).unwrap();
        let kinds: Vec<EventKind> = log.iter().map(|e| e.kind).collect();
        let dispatched: Vec<usize> = kinds
            .iter()
            .enumerate()
            .filter(|(_, k)| **k == EventKind::TaskDispatched)
            .map(|(i, _)| i)
            .collect();
        let merges: Vec<usize> = kinds
            .iter()
            .enumerate()
            .filter(|(_, k)| **k == EventKind::MergeStarted)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(dispatched.len(), 3);
        assert_eq!(merges.len(), 1);
        assert!(dispatched.iter().all(|d| *d < merges[0]));
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::TaskCompleted).count(), 3);
        assert_eq!(kinds.last(), Some(&EventKind::MergeCompleted));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let dir = tempdir().unwrap();
        let (coordinator, backend, _ws, _events) = setup(dir.path(), 1, None, &[]);
        let tasks = vec![
            Task::new("1", "one"),
            Task::new("2", "two"),
            Task::new("3", "three"),
            Task::new("4", "four"),
        ];
        let outcome = coordinator.execute(request(tasks)).await.unwrap();
        assert_eq!(outcome.completed().len(), 4);
        assert_eq!(backend.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_task_skips_dependents_and_is_not_merged() {
        let dir = tempdir().unwrap();
        let (coordinator, _backend, ws, _events) = setup(dir.path(), 4, Some("A"), &[]);
        let tasks = vec![
            Task::new("A", "alpha"),
            Task::new("B", "beta").with_blocked_by(&["A"]),
            Task::new("C", "gamma"),
        ];
        let outcome = coordinator.execute(request(tasks)).await.unwrap();
        assert_eq!(outcome.skipped, vec!["B"]);
        assert_eq!(outcome.failed().len(), 1);
        assert_eq!(outcome.merged, vec!["C"]);

        let log = ws.log.lock().unwrap();
        assert!(!log.iter().any(|l| l == "provision B"));
        assert!(!log.iter().any(|l| l == "merge A"));
        assert!(log.iter().any(|l| l == "cleanup A"));
    }

    #[tokio::test]
    async fn test_dependent_task_forks_from_dependency_branches() {
        let dir = tempdir().unwrap();
        let (coordinator, _backend, ws, _events) = setup(dir.path(), 4, None, &[]);
        let tasks = vec![
            Task::new("A", "alpha"),
            Task::new("B", "beta"),
            Task::new("C", "gamma").with_blocked_by(&["A", "B"]),
        ];
        let outcome = coordinator.execute(request(tasks)).await.unwrap();
        assert_eq!(outcome.completed().len(), 3);

        let log = ws.log.lock().unwrap();
        assert!(log.iter().any(|l| l == "provision A"));
        assert!(log.iter().any(|l| l == "provision C from hive/r1/A,hive/r1/B"));
        let commit_a = log.iter().position(|l| l == "commit A").unwrap();
        let provision_c = log.iter().position(|l| l.starts_with("provision C")).unwrap();
        assert!(commit_a < provision_c);
        let merge_c = log.iter().position(|l| l == "merge C").unwrap();
        let merge_a = log.iter().position(|l| l == "merge A").unwrap();
        assert!(merge_a < merge_c);
    }

    #[tokio::test]
    async fn test_conflict_goes_to_merge_agent() {
        let dir = tempdir().unwrap();
        let (coordinator, _backend, ws, events) = setup(dir.path(), 4, None, &["B"]);
        let outcome = coordinator.execute(request(abc())).await.unwrap();
        assert_eq!(outcome.merged, vec!["A", "B", "C"]);

        let log = ws.log.lock().unwrap();
        let merge_b = log.iter().position(|l| l == "merge B").unwrap();
        let finish_b = log.iter().position(|l| l == "finish B").unwrap();
        assert!(merge_b < finish_b);

        let conflicts: Vec<_> = read_events(&events.path())
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == EventKind::MergeConflict)
            .collect();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].detail_str("task"), Some("B"));
    }

    #[tokio::test]
    async fn test_shared_task_merges_first() {
        let dir = tempdir().unwrap();
        let (coordinator, _backend, _ws, _events) = setup(dir.path(), 4, None, &[]);
        let tasks = vec![
            Task::new("a", "feature"),
            Task::new("z", "build plumbing").with_labels(&["infra"]),
        ];
        let outcome = coordinator.execute(request(tasks)).await.unwrap();
        assert_eq!(outcome.merged, vec!["z", "a"]);
    }

    #[tokio::test]
    async fn test_empty_batch_emits_nothing() {
        let dir = tempdir().unwrap();
        let (coordinator, _backend, _ws, events) = setup(dir.path(), 4, None, &[]);
        let outcome = coordinator.execute(request(Vec::new())).await.unwrap();
        assert!(outcome.tasks.is_empty());
        assert_eq!(events.last_seq(), 0);
    }
}
