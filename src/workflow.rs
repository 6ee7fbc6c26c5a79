//! Workflow and phase definitions.
//!
//! A workflow is an ordered list of phases. Each phase is bound either to an
//! agent (an external LLM invocation) or to a built-in step type. Built-in
//! workflows cover the common pipelines; projects add their own as
//! `.hive/workflows/<name>.yaml`:
//!
//! ```yaml
//! name: feature
//! phases:
//!   - agent: architect
//!     checkpoint_after: true
//!   - agent: implementer
//!   - step: build_verify
//!   - agent: documenter
//!     required: false
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::errors::EngineError;

/// Built-in step types executed by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Run the configured build command, routing failures to a recovery agent
    BuildVerify,
    /// Dispatch independent tasks to parallel worktrees, then merge
    Parallel,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepType::BuildVerify => write!(f, "build_verify"),
            StepType::Parallel => write!(f, "parallel"),
        }
    }
}

/// What kind of output a phase consumes, which decides the handoff fields it sees.
///
/// | Role       | Rationale | File targets |
/// |------------|-----------|--------------|
/// | `Design`   | yes       | no           |
/// | `Execute`  | no        | yes          |
/// | `Test`     | no        | yes          |
/// | `Review`   | yes       | yes          |
/// | `Document` | yes       | no           |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Design,
    Execute,
    Test,
    Review,
    Document,
}

impl Role {
    /// Default role for well-known agent names; anything else executes.
    pub fn for_agent(agent: &str) -> Role {
        match agent {
            "architect" | "planner" | "designer" | "analyst" => Role::Design,
            "tester" | "qa" => Role::Test,
            "reviewer" | "auditor" => Role::Review,
            "documenter" | "writer" => Role::Document,
            _ => Role::Execute,
        }
    }

    pub fn receives_rationale(self) -> bool {
        matches!(self, Role::Design | Role::Review | Role::Document)
    }

    pub fn receives_file_targets(self) -> bool {
        matches!(self, Role::Execute | Role::Test | Role::Review)
    }

    /// Whether the phase edits the working tree (and so gets file-level checks).
    pub fn modifies_files(self) -> bool {
        matches!(self, Role::Execute | Role::Test)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Design => "design",
            Role::Execute => "execute",
            Role::Test => "test",
            Role::Review => "review",
            Role::Document => "document",
        };
        write!(f, "{}", s)
    }
}

fn default_true() -> bool {
    true
}

/// A single workflow step. Immutable once a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    /// Unique name within the workflow (defaults to the agent or step name)
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepType>,
    /// A blocked required phase fails the run; an optional one is skipped
    #[serde(default = "default_true")]
    pub required: bool,
    /// Pause for a human decision after this phase completes
    #[serde(default)]
    pub checkpoint_after: bool,
    /// Earlier phases whose handoffs this phase needs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// What a phase executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind<'a> {
    Agent(&'a str),
    Step(StepType),
}

impl Phase {
    pub fn agent(agent: &str) -> Self {
        Self {
            name: agent.to_string(),
            agent: Some(agent.to_string()),
            step: None,
            required: true,
            checkpoint_after: false,
            depends_on: Vec::new(),
            role: None,
            model: None,
        }
    }

    pub fn step(step: StepType) -> Self {
        Self {
            name: step.to_string(),
            agent: None,
            step: Some(step),
            required: true,
            checkpoint_after: false,
            depends_on: Vec::new(),
            role: None,
            model: None,
        }
    }

    pub fn with_checkpoint(mut self) -> Self {
        self.checkpoint_after = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Agent or step. Only meaningful on validated workflows.
    pub fn kind(&self) -> PhaseKind<'_> {
        match (&self.agent, self.step) {
            (Some(agent), _) => PhaseKind::Agent(agent),
            (None, Some(step)) => PhaseKind::Step(step),
            (None, None) => PhaseKind::Agent(&self.name),
        }
    }

    /// Explicit role, else the default for the bound agent.
    pub fn role(&self) -> Role {
        if let Some(role) = self.role {
            return role;
        }
        match self.kind() {
            PhaseKind::Agent(agent) => Role::for_agent(agent),
            PhaseKind::Step(StepType::BuildVerify) => Role::Test,
            PhaseKind::Step(StepType::Parallel) => Role::Execute,
        }
    }

    /// Label used as the event actor.
    pub fn actor(&self) -> &str {
        match &self.agent {
            Some(agent) => agent,
            None => &self.name,
        }
    }
}

/// An ordered list of phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub phases: Vec<Phase>,
}

/// Names of the workflows compiled into the binary.
pub const BUILTIN_WORKFLOWS: &[&str] = &["full", "quick", "parallel", "review"];

impl Workflow {
    pub fn new(name: &str, phases: Vec<Phase>) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            phases,
        }
    }

    /// A workflow compiled into the binary.
    pub fn builtin(name: &str) -> Option<Workflow> {
        let (description, phases) = match name {
            "full" => (
                "Design, implement, verify, test, review and document",
                vec![
                    Phase::agent("architect").with_checkpoint(),
                    Phase::agent("implementer"),
                    Phase::step(StepType::BuildVerify),
                    Phase::agent("tester"),
                    Phase::agent("reviewer"),
                    Phase::agent("documenter").optional(),
                ],
            ),
            "quick" => (
                "Implement and verify",
                vec![
                    Phase::agent("implementer"),
                    Phase::step(StepType::BuildVerify),
                ],
            ),
            "parallel" => (
                "Design, implement independent tasks in parallel worktrees, verify, review",
                vec![
                    Phase::agent("architect").with_checkpoint(),
                    Phase::step(StepType::Parallel),
                    Phase::step(StepType::BuildVerify),
                    Phase::agent("reviewer"),
                ],
            ),
            "review" => ("Review the current working tree", vec![Phase::agent("reviewer")]),
            _ => return None,
        };
        Some(Workflow {
            name: name.to_string(),
            description: Some(description.to_string()),
            phases,
        })
    }

    /// Resolve a workflow: project file first (`<name>.yaml`, `.yml`, `.toml`), then built-ins.
    pub fn load(name: &str, workflows_dir: &Path) -> Result<Workflow, EngineError> {
        if let Some(path) = find_workflow_file(name, workflows_dir) {
            let workflow = Self::load_file(&path)?;
            workflow.validate()?;
            return Ok(workflow);
        }
        match Self::builtin(name) {
            Some(workflow) => Ok(workflow),
            None => Err(EngineError::UnknownWorkflow {
                name: name.to_string(),
                available: available_workflows(workflows_dir).join(", "),
            }),
        }
    }

    /// Parse a workflow file, filling in defaulted names.
    pub fn load_file(path: &Path) -> Result<Workflow> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow: {}", path.display()))?;
        let mut workflow: Workflow = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("Failed to parse workflow: {}", path.display()))?,
            _ => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse workflow: {}", path.display()))?,
        };
        workflow.fill_names();
        Ok(workflow)
    }

    fn fill_names(&mut self) {
        for phase in &mut self.phases {
            if phase.name.is_empty() {
                phase.name = match (&phase.agent, phase.step) {
                    (Some(agent), _) => agent.clone(),
                    (None, Some(step)) => step.to_string(),
                    (None, None) => String::new(),
                };
            }
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |message: String| EngineError::InvalidWorkflow {
            workflow: self.name.clone(),
            message,
        };

        if self.phases.is_empty() {
            return Err(invalid("workflow has no phases".to_string()));
        }

        let mut seen = HashSet::new();
        for (i, phase) in self.phases.iter().enumerate() {
            if phase.name.trim().is_empty() {
                return Err(invalid(format!("phase {} has no name", i)));
            }
            match (&phase.agent, phase.step) {
                (Some(_), Some(_)) => {
                    return Err(invalid(format!(
                        "phase '{}' sets both agent and step",
                        phase.name
                    )));
                }
                (None, None) => {
                    return Err(invalid(format!(
                        "phase '{}' needs an agent or a step",
                        phase.name
                    )));
                }
                _ => {}
            }
            for dep in &phase.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(invalid(format!(
                        "phase '{}' depends on '{}', which is not an earlier phase",
                        phase.name, dep
                    )));
                }
            }
            if !seen.insert(phase.name.as_str()) {
                return Err(invalid(format!("duplicate phase name '{}'", phase.name)));
            }
        }
        Ok(())
    }

    /// Restrict the workflow to the phases bound to one agent (`--only`).
    pub fn only(&self, agent: &str) -> Result<Workflow, EngineError> {
        let phases: Vec<Phase> = self
            .phases
            .iter()
            .filter(|p| p.agent.as_deref() == Some(agent) || p.name == agent)
            .cloned()
            .map(|mut p| {
                p.depends_on.clear();
                p
            })
            .collect();
        if phases.is_empty() {
            return Err(EngineError::UnknownAgent {
                workflow: self.name.clone(),
                agent: agent.to_string(),
            });
        }
        Ok(Workflow {
            name: format!("{}:{}", self.name, agent),
            description: self.description.clone(),
            phases,
        })
    }

    /// Index of a phase by name, or by bound agent.
    pub fn phase_index(&self, name_or_agent: &str) -> Option<usize> {
        self.phases
            .iter()
            .position(|p| p.name == name_or_agent)
            .or_else(|| {
                self.phases
                    .iter()
                    .position(|p| p.agent.as_deref() == Some(name_or_agent))
            })
    }
}

fn find_workflow_file(name: &str, workflows_dir: &Path) -> Option<PathBuf> {
    ["yaml", "yml", "toml"]
        .iter()
        .map(|ext| workflows_dir.join(format!("{}.{}", name, ext)))
        .find(|p| p.is_file())
}

/// Built-in names plus any workflow files in the project, sorted and deduplicated.
pub fn available_workflows(workflows_dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = BUILTIN_WORKFLOWS.iter().map(|s| s.to_string()).collect();
    let pattern = workflows_dir.join("*.*");
    if let Some(pattern) = pattern.to_str()
        && let Ok(paths) = glob::glob(pattern)
    {
        for path in paths.flatten() {
            let is_workflow = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml" | "yml" | "toml")
            );
            if is_workflow && let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
    }
    names.sort();
    names.dedup();
    names
}
