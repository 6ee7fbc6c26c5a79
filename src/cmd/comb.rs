//! `hive comb`: plan the tracker's ready tasks and optionally run them.

use anyhow::{Context, Result};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hive::config::Config;
use hive::hive_config::HiveConfig;
use hive::orchestrator::{CliBackend, Engine, RunRequest};
use hive::parallel::{TaskScheduler, merge_order};
use hive::tracker::{CliTaskTracker, TaskTracker};
use hive::ui::{RunUI, spawn_event_printer};
use hive::workflow::{Phase, StepType, Workflow};

use super::super::Cli;
use super::run::check_initialized;

pub async fn cmd_comb(cli: &Cli, project_dir: PathBuf, execute: bool, max_parallel: Option<usize>) -> Result<i32> {
    check_initialized(&project_dir)?;
    let settings = HiveConfig::with_cli_args(project_dir, cli.verbose, false, max_parallel)?;
    let config = Config::from_settings(settings)?;
    let toml = config.toml().clone();

    let tracker = CliTaskTracker::new(toml.tracker.clone(), config.project_dir.clone());
    let ready = tracker
        .ready()
        .await
        .with_context(|| format!("Failed to query ready tasks with `{}`", toml.tracker.cmd))?;
    let blocked = match tracker.blocked().await {
        Ok(tasks) => tasks.len(),
        Err(e) => {
            tracing::warn!(error = %e, "could not query blocked tasks");
            0
        }
    };

    if ready.is_empty() {
        println!("No ready tasks ({} blocked).", blocked);
        return Ok(0);
    }

    let scheduler = TaskScheduler::new(ready.clone())?;
    println!(
        "{} ready, {} blocked, up to {} in parallel",
        style(ready.len()).cyan().bold(),
        blocked,
        config.settings().max_parallel()
    );
    println!();
    for (i, wave) in scheduler.waves().iter().enumerate() {
        println!("{} {}", style(format!("Wave {}:", i + 1)).bold(), wave.join(", "));
    }
    let order = merge_order(scheduler.graph(), &ready, &toml.parallel.shared_labels);
    println!();
    println!("{}", style("Merge order:").bold());
    for (i, task) in order.iter().enumerate() {
        let labels = if task.labels.is_empty() {
            String::new()
        } else {
            format!(" [{}]", task.labels.join(", "))
        };
        println!("  {}. {} {}{}", i + 1, style(&task.id).cyan(), task.title, style(labels).dim());
    }

    if !execute {
        println!();
        println!("{}", style("Dry run. Pass --execute to dispatch these tasks.").dim());
        return Ok(0);
    }
    println!();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nInterrupted, aborting tasks...");
                cancel.cancel();
            }
        });
    }
    let backend = Arc::new(CliBackend::new(toml, cancel.clone()));
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = Engine::new(config, backend)
        .with_cancel(cancel)
        .with_listener(tx);

    let workflow = Workflow::new("comb", vec![Phase::step(StepType::Parallel)]);
    let request = RunRequest {
        objective: format!("Complete {} ready tracker task(s)", ready.len()),
        workflow: workflow.name.clone(),
        only: None,
        attachments: Vec::new(),
        autonomous: true,
    };

    let ui = Arc::new(RunUI::new(1, 0, cli.verbose));
    let printer = spawn_event_printer(Arc::clone(&ui), rx);
    let result = engine.start_workflow(workflow, request).await;
    drop(engine);
    let _ = printer.await;
    let outcome = result?;
    ui.finish(&outcome);
    Ok(outcome.exit_code())
}
