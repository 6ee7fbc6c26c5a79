//! Read-only views of runs: `hive status`, `hive checkpoints`, `hive events`.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::time::Duration;

use hive::checkpoint::CheckpointManager;
use hive::config::Config;
use hive::events::{Event, read_events, read_events_after};
use hive::orchestrator::RunStore;
use hive::ui::{event_line, render_run_list, render_status, terminal_width};

use super::run::check_initialized;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const STATUS_EVENT_TAIL: usize = 10;

fn open_store(project_dir: &Path) -> Result<RunStore> {
    check_initialized(project_dir)?;
    let config = Config::new(project_dir.to_path_buf(), false)?;
    Ok(RunStore::new(&config))
}

pub async fn cmd_status(project_dir: &Path, run: Option<&str>, tui: bool, all: bool) -> Result<i32> {
    let store = open_store(project_dir)?;
    if all {
        let runs = store.list_runs()?;
        if runs.is_empty() {
            println!("No runs yet. Start one with `hive run \"<objective>\"`.");
        } else {
            print!("{}", render_run_list(&runs));
        }
        return Ok(0);
    }

    let run_id = store.resolve(run)?;
    if !tui {
        let state = store.load(&run_id)?;
        let events = read_events(&store.events_path(&run_id))?;
        print!("{}", render_status(&state, &events, STATUS_EVENT_TAIL, terminal_width()));
        return Ok(0);
    }

    let term = console::Term::stdout();
    loop {
        let state = store.load(&run_id)?;
        let events = read_events(&store.events_path(&run_id))?;
        let (_, rows) = term.size();
        let tail = (rows as usize).saturating_sub(state.workflow.phases.len() + 12).max(3);
        let frame = render_status(&state, &events, tail, terminal_width());
        term.clear_screen()?;
        term.write_str(&frame)?;
        if state.status != hive::orchestrator::RunStatus::Running {
            term.write_line(&format!("{}", style("(run is not active, exiting)").dim()))?;
            return Ok(0);
        }
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = tokio::signal::ctrl_c() => return Ok(0),
        }
    }
}

pub fn cmd_checkpoints(project_dir: &Path, run: Option<&str>) -> Result<i32> {
    let store = open_store(project_dir)?;
    let run_id = store.resolve(run)?;
    let checkpoints = CheckpointManager::for_run(&store.run_dir(&run_id)).list()?;

    if checkpoints.is_empty() {
        println!("Run {} has no checkpoints.", run_id);
        return Ok(0);
    }
    for cp in &checkpoints {
        let state = match cp.resolution {
            Some(ref r) => style(format!("resolved: {}", r.decision.label())).green().to_string(),
            None => style("open").yellow().bold().to_string(),
        };
        println!(
            "{}  {}  {:<14} {:<20} {}",
            cp.id,
            cp.created_at.format("%Y-%m-%d %H:%M:%S"),
            cp.phase_name,
            cp.reason.label(),
            state
        );
    }
    Ok(0)
}

fn matches_agent(event: &Event, agent: Option<&str>) -> bool {
    agent.is_none_or(|a| event.actor == a)
}

/// The events to print from one read of the log, plus the sequence number
/// following resumes from. The cursor covers every event read, shown or not.
fn select_events(all: Vec<Event>, agent: Option<&str>, limit: Option<usize>) -> (Vec<Event>, u64) {
    let last = all.last().map(|e| e.seq).unwrap_or(0);
    let mut shown: Vec<Event> = all.into_iter().filter(|e| matches_agent(e, agent)).collect();
    if let Some(n) = limit {
        let skip = shown.len().saturating_sub(n);
        shown = shown.split_off(skip);
    }
    (shown, last)
}

pub async fn cmd_events(
    project_dir: &Path,
    run: Option<&str>,
    agent: Option<&str>,
    limit: Option<usize>,
    tail: bool,
) -> Result<i32> {
    let store = open_store(project_dir)?;
    let run_id = store.resolve(run)?;
    let path = store.events_path(&run_id);

    let (events, mut last) = select_events(read_events(&path)?, agent, limit);
    for event in &events {
        println!("{}", event_line(event));
    }
    if !tail {
        return Ok(0);
    }

    loop {
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = tokio::signal::ctrl_c() => return Ok(0),
        }
        for event in read_events_after(&path, last)? {
            last = event.seq;
            if matches_agent(&event, agent) {
                println!("{}", event_line(&event));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hive::events::EventKind;
    use serde_json::json;

    fn event(seq: u64, actor: &str) -> Event {
        Event {
            seq,
            timestamp: Utc::now(),
            kind: EventKind::PhaseStarted,
            actor: actor.to_string(),
            detail: json!({}),
        }
    }

    #[test]
    fn test_cursor_covers_filtered_out_events() {
        let all = vec![event(1, "implementer"), event(2, "tester"), event(3, "engine")];
        let (shown, last) = select_events(all, Some("implementer"), None);
        assert_eq!(shown.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1]);
        assert_eq!(last, 3);
    }

    #[test]
    fn test_limit_keeps_newest() {
        let all = (1..=5).map(|seq| event(seq, "engine")).collect();
        let (shown, last) = select_events(all, None, Some(2));
        assert_eq!(shown.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(last, 5);

        let (shown, last) = select_events(Vec::new(), None, Some(2));
        assert!(shown.is_empty());
        assert_eq!(last, 0);
    }
}
