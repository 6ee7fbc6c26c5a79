//! Unified configuration system for Hive.
//!
//! Settings are read from `.hive/hive.toml` and layered:
//! user defaults (`~/.config/hive/hive.toml`) → project file → environment → CLI.
//! A project file, when present, replaces the user file wholesale.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "my-project"
//!
//! [defaults]
//! backend = "claude"
//! model = "sonnet"
//! max_attempts = 3
//! timeout_secs = 1800
//! autonomous = false
//!
//! [backends.claude]
//! cmd = "claude"
//! args = ["--print", "--output-format", "stream-json", "--verbose"]
//! model_flag = "--model"
//! output = "stream_json"
//!
//! [agents.architect]
//! model = "opus"
//! role = "design"
//!
//! [agents."review-*"]
//! max_attempts = 1
//!
//! [confidence]
//! clear_pass = 0.8
//! fail_below = 0.5
//! debug_markers = ["dbg!(", "console.log(", "debugger;"]
//!
//! [evaluation]
//! enabled = true
//! passes = ["completeness", "coherence", "risk"]
//!
//! [challenge]
//! max_rounds_per_edge = 1
//!
//! [verify]
//! build_cmd = "cargo build"
//! recovery_agent = "debugger"
//! max_recovery_attempts = 2
//!
//! [parallel]
//! max_parallel = 4
//! merge_agent = "merger"
//! shared_labels = ["infra", "shared", "core"]
//!
//! [tracker]
//! cmd = "bd"
//! ready_args = ["ready", "--json"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::init::HIVE_DIR;
use crate::workflow::Role;

/// File name of the configuration file inside `.hive/`.
pub const CONFIG_FILE: &str = "hive.toml";

/// Project-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name (optional, defaults to directory name)
    #[serde(default)]
    pub name: Option<String>,
}

/// Default settings for every agent phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Backend used when an agent does not name one
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Model passed to the backend when an agent does not name one
    #[serde(default)]
    pub model: Option<String>,
    /// Attempts per phase before the run fails
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wall-clock limit for a single invocation
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Apply needs_input defaults and accept needs-review phases without pausing
    #[serde(default)]
    pub autonomous: bool,
}

fn default_backend() -> String {
    "claude".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    1800
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            model: None,
            max_attempts: default_max_attempts(),
            timeout_secs: default_timeout_secs(),
            autonomous: false,
        }
    }
}

/// How the backend receives the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptInput {
    #[default]
    Stdin,
    /// Prompt appended as the final positional argument
    Arg,
}

/// Shape of the backend's stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Claude CLI `--output-format stream-json` events
    StreamJson,
    #[default]
    Text,
}

/// An LLM-execution CLI: text in, text out, with a model-selection flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub model_flag: Option<String>,
    #[serde(default)]
    pub prompt_input: PromptInput,
    #[serde(default)]
    pub output: OutputFormat,
}

impl BackendConfig {
    /// The Claude CLI in non-interactive stream-json mode.
    pub fn claude() -> Self {
        let cmd = std::env::var("HIVE_CLAUDE_CMD")
            .or_else(|_| std::env::var("CLAUDE_CMD"))
            .unwrap_or_else(|_| "claude".to_string());
        Self {
            cmd,
            args: vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            model_flag: Some("--model".to_string()),
            prompt_input: PromptInput::Stdin,
            output: OutputFormat::StreamJson,
        }
    }
}

/// Per-agent overrides. Keys in `[agents]` may be glob patterns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOverride {
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// Thresholds and weights for the composite confidence score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    /// Scores at or above this are a clear pass
    #[serde(default = "default_clear_pass")]
    pub clear_pass: f64,
    /// Scores below this fail
    #[serde(default = "default_fail_below")]
    pub fail_below: f64,
    #[serde(default = "default_self_weight")]
    pub self_weight: f64,
    #[serde(default = "default_checks_weight")]
    pub checks_weight: f64,
    #[serde(default = "default_eval_weight")]
    pub eval_weight: f64,
    /// Substrings that must not appear in files touched by execution phases
    #[serde(default = "default_debug_markers")]
    pub debug_markers: Vec<String>,
}

fn default_clear_pass() -> f64 {
    0.8
}

fn default_fail_below() -> f64 {
    0.5
}

fn default_self_weight() -> f64 {
    0.4
}

fn default_checks_weight() -> f64 {
    0.4
}

fn default_eval_weight() -> f64 {
    0.2
}

fn default_debug_markers() -> Vec<String> {
    ["dbg!(", "console.log(", "debugger;", "breakpoint()"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            clear_pass: default_clear_pass(),
            fail_below: default_fail_below(),
            self_weight: default_self_weight(),
            checks_weight: default_checks_weight(),
            eval_weight: default_eval_weight(),
            debug_markers: default_debug_markers(),
        }
    }
}

/// Independent evaluation passes run against a phase's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_eval_passes")]
    pub passes: Vec<String>,
    /// Agent name the passes are invoked as (resolves backend and model)
    #[serde(default = "default_eval_agent")]
    pub agent: String,
}

fn default_eval_passes() -> Vec<String> {
    vec![
        "completeness".to_string(),
        "coherence".to_string(),
        "risk".to_string(),
    ]
}

fn default_eval_agent() -> String {
    "evaluator".to_string()
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            passes: default_eval_passes(),
            agent: default_eval_agent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeConfig {
    /// Replays allowed per challenger→target edge before escalating
    #[serde(default = "default_max_rounds")]
    pub max_rounds_per_edge: u32,
}

fn default_max_rounds() -> u32 {
    1
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            max_rounds_per_edge: default_max_rounds(),
        }
    }
}

/// The built-in `build_verify` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Shell command; when unset the step passes without running anything
    #[serde(default)]
    pub build_cmd: Option<String>,
    #[serde(default = "default_verify_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_recovery_agent")]
    pub recovery_agent: String,
    #[serde(default = "default_max_recovery")]
    pub max_recovery_attempts: u32,
}

fn default_verify_timeout() -> u64 {
    600
}

fn default_recovery_agent() -> String {
    "debugger".to_string()
}

fn default_max_recovery() -> u32 {
    2
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            build_cmd: None,
            timeout_secs: default_verify_timeout(),
            recovery_agent: default_recovery_agent(),
            max_recovery_attempts: default_max_recovery(),
        }
    }
}

/// Parallel worktree execution and merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Branch the worktrees fork from and merges land on (default: current HEAD)
    #[serde(default)]
    pub base_branch: Option<String>,
    /// Agent that implements each task
    #[serde(default = "default_task_agent")]
    pub task_agent: String,
    /// Agent that reconciles merge conflicts
    #[serde(default = "default_merge_agent")]
    pub merge_agent: String,
    /// Worktree root, relative to the project directory
    #[serde(default = "default_worktrees_dir")]
    pub worktrees_dir: String,
    /// Task labels that mark shared/infrastructure work, merged first
    #[serde(default = "default_shared_labels")]
    pub shared_labels: Vec<String>,
}

fn default_max_parallel() -> usize {
    4
}

fn default_task_agent() -> String {
    "implementer".to_string()
}

fn default_merge_agent() -> String {
    "merger".to_string()
}

fn default_worktrees_dir() -> String {
    format!("{}/worktrees", HIVE_DIR)
}

fn default_shared_labels() -> Vec<String> {
    vec!["infra".to_string(), "shared".to_string(), "core".to_string()]
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            base_branch: None,
            task_agent: default_task_agent(),
            merge_agent: default_merge_agent(),
            worktrees_dir: default_worktrees_dir(),
            shared_labels: default_shared_labels(),
        }
    }
}

/// External task-tracker CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_tracker_cmd")]
    pub cmd: String,
    #[serde(default = "default_ready_args")]
    pub ready_args: Vec<String>,
    #[serde(default = "default_blocked_args")]
    pub blocked_args: Vec<String>,
}

fn default_tracker_cmd() -> String {
    "bd".to_string()
}

fn default_ready_args() -> Vec<String> {
    vec!["ready".to_string(), "--json".to_string()]
}

fn default_blocked_args() -> Vec<String> {
    vec!["blocked".to_string(), "--json".to_string()]
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            cmd: default_tracker_cmd(),
            ready_args: default_ready_args(),
            blocked_args: default_blocked_args(),
        }
    }
}

/// Contents of `.hive/hive.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HiveToml {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentOverride>,
    #[serde(default)]
    pub confidence: ConfidenceConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub challenge: ChallengeConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub parallel: ParallelConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

/// Resolved settings for one agent.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub backend_name: String,
    pub backend: BackendConfig,
    pub model: Option<String>,
    pub role: Option<Role>,
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl HiveToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse hive.toml")
    }

    /// Load `.hive/hive.toml`, falling back to the user-level file, then defaults.
    pub fn load_or_default(hive_dir: &Path) -> Result<Self> {
        let config_path = hive_dir.join(CONFIG_FILE);
        if config_path.exists() {
            return Self::load(&config_path);
        }
        match user_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize hive.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Look up a backend by name. `claude` is always available.
    pub fn backend(&self, name: &str) -> Option<BackendConfig> {
        match self.backends.get(name) {
            Some(backend) => Some(backend.clone()),
            None if name == "claude" => Some(BackendConfig::claude()),
            None => None,
        }
    }

    /// Effective settings for an agent, applying every matching `[agents]` entry
    /// in key order, so exact names should sort after broader patterns.
    pub fn agent_settings(&self, agent: &str) -> Result<AgentSettings> {
        let mut backend_name = self.defaults.backend.clone();
        let mut model = self.defaults.model.clone();
        let mut role = None;
        let mut timeout_secs = self.defaults.timeout_secs;
        let mut max_attempts = self.defaults.max_attempts;

        for (pattern, over) in &self.agents {
            if !pattern_matches(pattern, agent) {
                continue;
            }
            if let Some(ref b) = over.backend {
                backend_name = b.clone();
            }
            if let Some(ref m) = over.model {
                model = Some(m.clone());
            }
            if over.role.is_some() {
                role = over.role;
            }
            if let Some(t) = over.timeout_secs {
                timeout_secs = t;
            }
            if let Some(n) = over.max_attempts {
                max_attempts = n;
            }
        }

        let backend = self.backend(&backend_name).with_context(|| {
            format!(
                "Agent '{}' uses unknown backend '{}'. Define [backends.{}] in hive.toml",
                agent, backend_name, backend_name
            )
        })?;

        Ok(AgentSettings {
            backend_name,
            backend,
            model,
            role,
            timeout: Duration::from_secs(timeout_secs),
            max_attempts: max_attempts.max(1),
        })
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let c = &self.confidence;
        for (name, value) in [("clear_pass", c.clear_pass), ("fail_below", c.fail_below)] {
            if !(0.0..=1.0).contains(&value) {
                warnings.push(format!("confidence.{} must be within 0.0..=1.0, got {}", name, value));
            }
        }
        if c.fail_below > c.clear_pass {
            warnings.push(format!(
                "confidence.fail_below ({}) is above confidence.clear_pass ({})",
                c.fail_below, c.clear_pass
            ));
        }
        if c.self_weight < 0.0 || c.checks_weight < 0.0 || c.eval_weight < 0.0 {
            warnings.push("confidence weights must not be negative".to_string());
        }
        if self.defaults.max_attempts == 0 {
            warnings.push("defaults.max_attempts is 0; it will be treated as 1".to_string());
        }
        if self.parallel.max_parallel == 0 {
            warnings.push("parallel.max_parallel must be at least 1".to_string());
        }
        if self.backend(&self.defaults.backend).is_none() {
            warnings.push(format!(
                "defaults.backend '{}' has no [backends.{}] section",
                self.defaults.backend, self.defaults.backend
            ));
        }
        for (pattern, over) in &self.agents {
            if glob::Pattern::new(pattern).is_err() {
                warnings.push(format!("Invalid agent pattern '{}'", pattern));
            }
            if let Some(ref b) = over.backend
                && self.backend(b).is_none()
            {
                warnings.push(format!("Agent '{}' uses unknown backend '{}'", pattern, b));
            }
        }
        for (name, backend) in &self.backends {
            if backend.cmd.trim().is_empty() {
                warnings.push(format!("backends.{}.cmd is empty", name));
            }
        }
        warnings
    }
}

/// Path of the user-level defaults file.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("hive").join(CONFIG_FILE))
}

/// Case-insensitive glob match of an `[agents]` key against an agent name.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let options = glob::MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    glob::Pattern::new(pattern)
        .map(|p| p.matches_with(name, options))
        .unwrap_or(false)
}

/// Configuration merged from file, environment and CLI.
#[derive(Debug, Clone)]
pub struct HiveConfig {
    pub project_dir: PathBuf,
    pub hive_dir: PathBuf,
    pub toml: HiveToml,
    pub verbose: bool,
    cli_autonomous: bool,
    cli_max_parallel: Option<usize>,
}

impl HiveConfig {
    /// Load configuration for a project directory (file → environment).
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let hive_dir = project_dir.join(HIVE_DIR);
        let mut toml = HiveToml::load_or_default(&hive_dir)?;

        if let Ok(v) = std::env::var("HIVE_MAX_ATTEMPTS") {
            toml.defaults.max_attempts = v
                .parse()
                .with_context(|| format!("HIVE_MAX_ATTEMPTS is not a number: {}", v))?;
        }
        if let Ok(v) = std::env::var("HIVE_BUILD_CMD") {
            toml.verify.build_cmd = Some(v);
        }

        Ok(Self {
            project_dir,
            hive_dir,
            toml,
            verbose: false,
            cli_autonomous: false,
            cli_max_parallel: None,
        })
    }

    /// Load and apply CLI overrides.
    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        autonomous: bool,
        max_parallel: Option<usize>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.cli_autonomous = autonomous;
        config.cli_max_parallel = max_parallel;
        Ok(config)
    }

    /// Autonomous mode (CLI flag or file default).
    pub fn autonomous(&self) -> bool {
        self.cli_autonomous || self.toml.defaults.autonomous
    }

    /// Concurrency bound for parallel steps (CLI → file → default).
    pub fn max_parallel(&self) -> usize {
        self.cli_max_parallel
            .unwrap_or(self.toml.parallel.max_parallel)
            .max(1)
    }

    pub fn config_file(&self) -> PathBuf {
        self.hive_dir.join(CONFIG_FILE)
    }
}
