use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "hive")]
#[command(version, about = "Multi-phase AI agent workflow orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new hive project
    Init,
    /// Run an objective through a workflow
    Run {
        objective: String,
        /// Workflow name (built-in or .hive/workflows/<name>.yaml)
        #[arg(short, long, default_value = "full")]
        workflow: String,
        /// Run only the phases of this agent
        #[arg(long)]
        only: Option<String>,
        /// Apply needs_input defaults and accept reviewable confidence without pausing
        #[arg(long)]
        auto: bool,
        /// Attach a file to the run context (repeatable)
        #[arg(short = 'c', long = "context")]
        context: Vec<PathBuf>,
    },
    /// Show the state of the current (or a given) run
    Status {
        /// Redraw continuously until the run stops
        #[arg(long)]
        tui: bool,
        #[arg(long)]
        run: Option<String>,
        /// List every run
        #[arg(long)]
        all: bool,
    },
    /// List checkpoints of a run
    Checkpoints {
        #[arg(long)]
        run: Option<String>,
    },
    /// Resolve a checkpoint and continue the run
    Resume {
        #[arg(long)]
        run: Option<String>,
        #[arg(long)]
        checkpoint: Option<String>,
        /// Decide without prompting
        #[arg(long, value_enum)]
        decision: Option<DecisionArg>,
        /// Guidance (adjust), answer (needs input) or reason (reject)
        #[arg(long)]
        note: Option<String>,
        #[arg(long)]
        auto: bool,
    },
    /// Print the event log
    Events {
        /// Keep following the log
        #[arg(long)]
        tail: bool,
        /// Only events of this actor
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        run: Option<String>,
        /// Show only the last N events
        #[arg(short = 'n')]
        limit: Option<usize>,
    },
    /// Plan (and optionally run) the tracker's ready tasks in parallel
    Comb {
        #[arg(long)]
        execute: bool,
        #[arg(long)]
        max_parallel: Option<usize>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// List available workflows
    Workflows,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum DecisionArg {
    Continue,
    Adjust,
    Reject,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration file
    Validate,
    /// Write a default hive.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let log_dir = project_dir.join(hive::init::HIVE_DIR).join("logs");
    let _log_guard = hive::logging::init(Some(&log_dir), cli.verbose);

    let code = match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Run {
            objective,
            workflow,
            only,
            auto,
            context,
        } => {
            cmd::cmd_run(
                &cli,
                project_dir,
                cmd::RunArgs {
                    objective: objective.clone(),
                    workflow: workflow.clone(),
                    only: only.clone(),
                    autonomous: *auto,
                    attachments: context.clone(),
                },
            )
            .await?
        }
        Commands::Status { tui, run, all } => {
            cmd::cmd_status(&project_dir, run.as_deref(), *tui, *all).await?
        }
        Commands::Checkpoints { run } => cmd::cmd_checkpoints(&project_dir, run.as_deref())?,
        Commands::Resume {
            run,
            checkpoint,
            decision,
            note,
            auto,
        } => {
            cmd::cmd_resume(
                &cli,
                project_dir,
                cmd::ResumeArgs {
                    run: run.clone(),
                    checkpoint: checkpoint.clone(),
                    decision: *decision,
                    note: note.clone(),
                    autonomous: *auto,
                },
            )
            .await?
        }
        Commands::Events {
            tail,
            agent,
            run,
            limit,
        } => cmd::cmd_events(&project_dir, run.as_deref(), agent.as_deref(), *limit, *tail).await?,
        Commands::Comb {
            execute,
            max_parallel,
        } => cmd::cmd_comb(&cli, project_dir, *execute, *max_parallel).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
        Commands::Workflows => cmd::cmd_workflows(&project_dir)?,
    };

    if code != 0 {
        drop(_log_guard);
        std::process::exit(code);
    }
    Ok(())
}
