//! Running and resuming workflows (`hive run`, `hive resume`).

use anyhow::{Result, bail};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hive::checkpoint::{Checkpoint, CheckpointDecision, CheckpointManager, CheckpointReason};
use hive::config::Config;
use hive::errors::EngineError;
use hive::events::Event;
use hive::hive_config::HiveConfig;
use hive::orchestrator::{CliBackend, Engine, RunOutcome, RunRequest, RunStore};
use hive::ui::{RunUI, spawn_event_printer};

use super::super::{Cli, DecisionArg};

pub struct RunArgs {
    pub objective: String,
    pub workflow: String,
    pub only: Option<String>,
    pub autonomous: bool,
    pub attachments: Vec<PathBuf>,
}

pub struct ResumeArgs {
    pub run: Option<String>,
    pub checkpoint: Option<String>,
    pub decision: Option<DecisionArg>,
    pub note: Option<String>,
    pub autonomous: bool,
}

pub fn check_initialized(project_dir: &Path) -> Result<()> {
    if !hive::init::is_initialized(project_dir) {
        bail!("Project not initialized. Run 'hive init' first.");
    }
    Ok(())
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, aborting run...");
            token.cancel();
        }
    });
}

/// Drive `engine` with a live UI, returning once every event has been printed.
async fn with_ui<F, Fut>(
    engine: Engine,
    ui: Arc<RunUI>,
    rx: mpsc::UnboundedReceiver<Event>,
    f: F,
) -> Result<RunOutcome>
where
    F: FnOnce(Engine) -> Fut,
    Fut: std::future::Future<Output = Result<RunOutcome, EngineError>>,
{
    let printer = spawn_event_printer(Arc::clone(&ui), rx);
    let result = f(engine).await;
    let _ = printer.await;
    let outcome = result?;
    ui.finish(&outcome);
    Ok(outcome)
}

pub async fn cmd_run(cli: &Cli, project_dir: PathBuf, args: RunArgs) -> Result<i32> {
    check_initialized(&project_dir)?;
    let settings = HiveConfig::with_cli_args(project_dir, cli.verbose, args.autonomous, None)?;
    let autonomous = settings.autonomous();
    let config = Config::from_settings(settings)?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let backend = Arc::new(CliBackend::new(config.toml().clone(), cancel.clone()));
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = Engine::new(config, backend)
        .with_cancel(cancel)
        .with_listener(tx);

    let request = RunRequest {
        objective: args.objective,
        workflow: args.workflow,
        only: args.only,
        attachments: args.attachments,
        autonomous,
    };
    let ui = Arc::new(RunUI::new(0, 0, cli.verbose));
    let outcome = with_ui(engine, ui, rx, |engine| async move { engine.start(request).await }).await?;
    Ok(outcome.exit_code())
}

pub async fn cmd_resume(cli: &Cli, project_dir: PathBuf, args: ResumeArgs) -> Result<i32> {
    check_initialized(&project_dir)?;
    let settings = HiveConfig::with_cli_args(project_dir, cli.verbose, args.autonomous, None)?;
    let config = Config::from_settings(settings)?;
    let store = RunStore::new(&config);
    let run_id = store.resolve(args.run.as_deref())?;
    let state = store.load(&run_id)?;

    let manager = CheckpointManager::for_run(&store.run_dir(&run_id));
    let checkpoint_id = match args.checkpoint.clone().or(state.pending_checkpoint.clone()) {
        Some(id) => id,
        None => match manager.latest_open()? {
            Some(cp) => cp.id,
            None => bail!("Run {} has no open checkpoint (status: {}).", run_id, state.status),
        },
    };
    let checkpoint = manager.load(&checkpoint_id)?;

    println!();
    println!("Checkpoint {} at phase {}", checkpoint.id, checkpoint.phase_name);
    println!("{}", checkpoint.reason.describe());
    println!();

    let decision = match args.decision {
        Some(arg) => decision_from_args(arg, args.note)?,
        None => prompt_decision(&checkpoint)?,
    };

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let backend = Arc::new(CliBackend::new(config.toml().clone(), cancel.clone()));
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = Engine::new(config, backend)
        .with_cancel(cancel)
        .with_listener(tx);

    let ui = Arc::new(RunUI::new(
        state.workflow.phases.len() as u64,
        checkpoint.phase_index as u64,
        cli.verbose,
    ));
    let autonomous = args.autonomous;
    let outcome = with_ui(engine, ui, rx, |engine| async move {
        engine
            .resume(&run_id, Some(&checkpoint.id), decision, autonomous)
            .await
    })
    .await?;
    Ok(outcome.exit_code())
}

fn decision_from_args(arg: DecisionArg, note: Option<String>) -> Result<CheckpointDecision> {
    Ok(match arg {
        DecisionArg::Continue => CheckpointDecision::Continue,
        DecisionArg::Adjust => match note {
            Some(note) if !note.trim().is_empty() => CheckpointDecision::Adjust { note },
            _ => bail!("--decision adjust needs --note with the guidance or answer"),
        },
        DecisionArg::Reject => CheckpointDecision::Reject {
            reason: note.unwrap_or_else(|| "rejected by operator".to_string()),
        },
    })
}

fn prompt_decision(checkpoint: &Checkpoint) -> Result<CheckpointDecision> {
    use dialoguer::{Input, Select, theme::ColorfulTheme};

    if !console::Term::stdout().is_term() {
        bail!("No terminal to prompt on. Pass --decision continue|adjust|reject.");
    }

    let (continue_label, adjust_label, input_prompt) = match checkpoint.reason {
        CheckpointReason::NeedsInput { ref default, .. } => (
            match default {
                Some(d) => format!("Accept the default answer ({})", d),
                None => "Re-run the phase without an answer".to_string(),
            },
            "Answer the question".to_string(),
            "Answer",
        ),
        _ => (
            if checkpoint.reason.continue_reruns() {
                "Continue (re-run the phase)".to_string()
            } else {
                "Continue to the next phase".to_string()
            },
            "Adjust: re-run the phase with guidance".to_string(),
            "Guidance",
        ),
    };
    let options = [continue_label, adjust_label, "Reject and fail the run".to_string()];

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("How should the run proceed?")
        .items(&options)
        .default(0)
        .interact()?;

    match selection {
        0 => Ok(CheckpointDecision::Continue),
        1 => {
            let note: String = Input::with_theme(&ColorfulTheme::default())
                .with_prompt(input_prompt)
                .interact_text()?;
            Ok(CheckpointDecision::Adjust { note })
        }
        _ => {
            let reason: String = Input::with_theme(&ColorfulTheme::default())
                .with_prompt("Reason")
                .default("rejected by operator".to_string())
                .interact_text()?;
            Ok(CheckpointDecision::Reject { reason })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjust_requires_note() {
        assert!(decision_from_args(DecisionArg::Adjust, None).is_err());
        assert_eq!(
            decision_from_args(DecisionArg::Adjust, Some("use sqlite".to_string())).unwrap(),
            CheckpointDecision::Adjust {
                note: "use sqlite".to_string()
            }
        );
    }

    #[test]
    fn test_reject_has_default_reason() {
        match decision_from_args(DecisionArg::Reject, None).unwrap() {
            CheckpointDecision::Reject { reason } => assert!(!reason.is_empty()),
            other => panic!("unexpected decision: {:?}", other),
        }
    }
}
