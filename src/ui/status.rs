//! Text rendering of a run for `hive status`.

use console::style;
use std::collections::HashSet;

use crate::events::{Event, EventKind};
use crate::orchestrator::{RunState, RunStatus};
use crate::ui::progress::event_line;

const DEFAULT_WIDTH: usize = 100;

/// Current terminal width, or a fixed fallback when not attached to one.
pub fn terminal_width() -> usize {
    terminal_size::terminal_size()
        .map(|(w, _)| w.0 as usize)
        .unwrap_or(DEFAULT_WIDTH)
        .max(40)
}

fn status_label(status: RunStatus) -> String {
    let text = status.to_string();
    match status {
        RunStatus::Complete => style(text).green().bold().to_string(),
        RunStatus::Running | RunStatus::Pending => style(text).cyan().bold().to_string(),
        RunStatus::Paused => style(text).yellow().bold().to_string(),
        RunStatus::Failed | RunStatus::Aborted => style(text).red().bold().to_string(),
    }
}

fn wrap_into(out: &mut String, text: &str, width: usize, indent: &str) {
    let options = textwrap::Options::new(width)
        .initial_indent(indent)
        .subsequent_indent(indent);
    for line in textwrap::wrap(text, options) {
        out.push_str(&line);
        out.push('\n');
    }
}

/// Full status view: header, phase list, scratchpad and the last `tail` events.
pub fn render_status(state: &RunState, events: &[Event], tail: usize, width: usize) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{} {}  {}\n",
        style("Run").bold(),
        style(&state.run_id).cyan(),
        status_label(state.status)
    ));
    wrap_into(&mut out, &state.objective, width.saturating_sub(2), "  ");
    out.push_str(&format!(
        "  workflow {}  phases {}/{}  cost ${:.2}{}\n",
        style(&state.workflow.name).yellow(),
        state.phases_completed(),
        state.workflow.phases.len(),
        state.cost_usd,
        if state.autonomous { "  autonomous" } else { "" }
    ));

    let skipped: HashSet<&str> = events
        .iter()
        .filter(|e| e.kind == EventKind::PhaseSkipped)
        .filter_map(|e| e.detail_str("phase"))
        .collect();

    out.push('\n');
    for (i, phase) in state.workflow.phases.iter().enumerate() {
        let marker = if i < state.current_phase || state.status == RunStatus::Complete {
            if skipped.contains(phase.name.as_str()) {
                style("-").dim().to_string()
            } else {
                style("✓").green().to_string()
            }
        } else if i == state.current_phase {
            match state.status {
                RunStatus::Paused => style("⏸").yellow().to_string(),
                RunStatus::Failed | RunStatus::Aborted => style("✗").red().to_string(),
                _ => style("▶").cyan().to_string(),
            }
        } else {
            style("·").dim().to_string()
        };
        let attempts = state.attempts.get(&phase.name).copied().unwrap_or(0);
        let mut line = format!("  {} {:<16} {}", marker, phase.name, style(phase.actor()).dim());
        if attempts > 1 {
            line.push_str(&format!(" ({} attempts)", attempts));
        }
        if i == state.current_phase
            && let Some(ref agent) = state.current_agent
            && state.status == RunStatus::Running
        {
            line.push_str(&format!(" {} {}", style("running").cyan(), agent));
        }
        out.push_str(&line);
        out.push('\n');
    }

    if let Some(ref checkpoint) = state.pending_checkpoint {
        out.push_str(&format!(
            "\n  {} checkpoint {} is waiting: run `hive resume`\n",
            style("⏸").yellow(),
            checkpoint
        ));
    }
    if let Some(ref failure) = state.failure {
        out.push('\n');
        wrap_into(&mut out, &format!("failure: {}", failure), width.saturating_sub(2), "  ");
    }

    let scratchpad = state.scratchpad();
    if !scratchpad.is_empty() {
        out.push_str(&format!("\n{}\n", style("Decisions").bold()));
        for (key, value) in &scratchpad {
            wrap_into(&mut out, &format!("{}: {}", key, value), width.saturating_sub(4), "    ");
        }
    }

    if tail > 0 && !events.is_empty() {
        out.push_str(&format!("\n{}\n", style("Recent events").bold()));
        let start = events.len().saturating_sub(tail);
        for event in &events[start..] {
            let line = event_line(event);
            out.push_str("  ");
            out.push_str(&crate::util::truncate_chars(&line, width.saturating_sub(2)));
            out.push('\n');
        }
    }
    out
}

/// Short one-line summary per run for `hive status --all`.
pub fn render_run_list(runs: &[RunState]) -> String {
    let mut out = String::new();
    for run in runs {
        out.push_str(&format!(
            "{}  {:<9} {:<10} {}/{}  {}\n",
            run.run_id,
            run.status.as_str(),
            run.workflow.name,
            run.phases_completed(),
            run.workflow.phases.len(),
            crate::util::truncate_chars(&run.objective, 60)
        ));
    }
    out
}
