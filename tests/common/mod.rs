//! Shared fixtures for engine-level tests: a scripted agent backend and
//! in-memory stand-ins for the workspace and task tracker.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use hive::config::Config;
use hive::errors::{InvocationError, MergeError};
use hive::events::{Event, EventKind, read_events};
use hive::orchestrator::{AgentBackend, Engine, InvocationOutput, InvocationRequest, RunStore};
use hive::parallel::{MergeOutcome, TaskWorkspace, Workspace};
use hive::tracker::{Task, TaskTracker};

/// One scripted response.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Transcript text returned as-is
    Text(String),
    /// Transcript text with a reported cost
    Priced(String, f64),
    /// Process exits non-zero
    Crash(String),
    Timeout,
}

/// A transcript whose final report block carries `payload`.
pub fn report(payload: Value) -> Reply {
    Reply::Text(format!(
        "Working on it.\n\nHIVE_REPORT\n{}\nEND_HIVE_REPORT\n",
        payload
    ))
}

pub fn complete(confidence: f64) -> Reply {
    report(json!({"status": "complete", "confidence": confidence, "notes": "done"}))
}

#[derive(Debug, Clone)]
pub struct Call {
    pub agent: String,
    pub prompt: String,
    pub model: Option<String>,
}

/// Backend answering from per-agent queues; an agent with an empty queue
/// reports a confident `complete`.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, agent: &str, reply: Reply) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(agent.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, agent: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.agent == agent).collect()
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn invoke(&self, request: InvocationRequest) -> Result<InvocationOutput, InvocationError> {
        self.calls.lock().unwrap().push(Call {
            agent: request.agent.clone(),
            prompt: request.prompt.clone(),
            model: request.model.clone(),
        });
        let reply = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.agent)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| complete(0.95));
        match reply {
            Reply::Text(text) => Ok(InvocationOutput {
                text,
                exit_code: 0,
                duration: Duration::from_millis(5),
                cost_usd: None,
            }),
            Reply::Priced(text, cost) => Ok(InvocationOutput {
                text,
                exit_code: 0,
                duration: Duration::from_millis(5),
                cost_usd: Some(cost),
            }),
            Reply::Crash(stderr) => Err(InvocationError::NonZeroExit { code: 1, stderr }),
            Reply::Timeout => Err(InvocationError::Timeout {
                elapsed: request.timeout,
            }),
        }
    }
}

/// Workspace that records calls and never touches git.
pub struct MemoryWorkspace {
    root: PathBuf,
    pub log: Mutex<Vec<String>>,
}

impl MemoryWorkspace {
    pub fn new(root: &Path) -> Arc<Self> {
        Arc::new(Self {
            root: root.to_path_buf(),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Workspace for MemoryWorkspace {
    async fn provision(&self, scope: &str, task: &Task, _bases: &[String]) -> Result<TaskWorkspace> {
        self.log.lock().unwrap().push(format!("provision {}", task.id));
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

/// Tracker with a fixed ready list.
pub struct StaticTracker {
    pub ready: Vec<Task>,
}

#[async_trait]
impl TaskTracker for StaticTracker {
    async fn ready(&self) -> Result<Vec<Task>> {
        Ok(self.ready.clone())
    }
    async fn blocked(&self) -> Result<Vec<Task>> {
        Ok(Vec::new())
    }
}

/// An initialized project in a temp dir.
pub struct Fixture {
    pub dir: TempDir,
    pub config: Config,
    pub backend: Arc<ScriptedBackend>,
    pub workspace: Arc<MemoryWorkspace>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_toml("")
    }

    /// `toml` is written to `.hive/hive.toml` before the config is loaded.
    pub fn with_toml(toml: &str) -> Self {
        let dir = TempDir::new().unwrap();
        hive::init::init_project(dir.path()).unwrap();
        if !toml.is_empty() {
            std::fs::write(dir.path().join(".hive/hive.toml"), toml).unwrap();
        }
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        let workspace = MemoryWorkspace::new(&config.project_dir);
        Self {
            dir,
            config,
            backend: ScriptedBackend::new(),
            workspace,
        }
    }

    pub fn engine(&self) -> Engine {
        self.engine_with_tasks(Vec::new())
    }

    pub fn engine_with_tasks(&self, ready: Vec<Task>) -> Engine {
        Engine::new(self.config.clone(), self.backend.clone())
            .with_workspace(self.workspace.clone())
            .with_tracker(Arc::new(StaticTracker { ready }))
    }

    pub fn store(&self) -> RunStore {
        RunStore::new(&self.config)
    }

    pub fn events(&self, run_id: &str) -> Vec<Event> {
        read_events(&self.store().events_path(run_id)).unwrap()
    }
}

pub fn count(events: &[Event], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind == kind).count()
}

pub fn position(events: &[Event], kind: EventKind) -> Option<usize> {
    events.iter().position(|e| e.kind == kind)
}
