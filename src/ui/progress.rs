use crate::events::{Event, EventKind};
use crate::orchestrator::{RunOutcome, RunStatus};
use crate::ui::icons::{
    CHALLENGE, CHECK, CROSS, GAUGE, MERGE, PAUSE, QUESTION, RETRY, SKIP, SPARKLE, WAVE, WRENCH,
};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Live terminal view of a run, fed by the engine's event stream.
///
/// Two bars are stacked vertically:
/// - Phase bar: phases finished out of the workflow's total
/// - Activity spinner: what the engine is waiting on right now
pub struct RunUI {
    multi: MultiProgress,
    phase_bar: ProgressBar,
    activity: ProgressBar,
    verbose: bool,
}

impl RunUI {
    /// `done` phases are already behind the run (non-zero when resuming).
    pub fn new(total_phases: u64, done: u64, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let phase_bar = multi.add(ProgressBar::new(total_phases));
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            phase_bar.set_style(style.progress_chars("█▓▒░"));
        }
        phase_bar.set_prefix("Phases");
        phase_bar.set_position(done);

        let activity = multi.add(ProgressBar::new_spinner());
        if let Ok(style) = ProgressStyle::default_spinner().template("{prefix:.bold.dim} {spinner} {msg}") {
            activity.set_style(style);
        }
        activity.set_prefix("   Now");

        Self {
            multi,
            phase_bar,
            activity,
            verbose,
        }
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    fn busy(&self, msg: String) {
        self.activity.set_message(msg);
        self.activity.enable_steady_tick(Duration::from_millis(100));
    }

    /// Render one event.
    pub fn handle(&self, event: &Event) {
        let phase = event.detail_str("phase").unwrap_or(&event.actor);
        match event.kind {
            EventKind::RunStarted => {
                if let Some(phases) = event.detail.get("phases").and_then(|v| v.as_array()) {
                    self.phase_bar.set_length(phases.len() as u64);
                }
                self.print_line(format!(
                    "{} {} {}",
                    style("▶").green().bold(),
                    style(event.detail_str("workflow").unwrap_or("workflow")).yellow().bold(),
                    style(event.detail_str("objective").unwrap_or_default()).dim()
                ));
            }
            EventKind::RunResumed => self.print_line(format!("{} resumed", style("▶").green().bold())),
            EventKind::PhaseStarted => {
                let attempt = event.detail.get("attempt").and_then(|v| v.as_u64()).unwrap_or(1);
                self.phase_bar.set_message(format!("{}", style(phase).yellow()));
                let label = if attempt > 1 {
                    format!("{} running {} (attempt {})", event.actor, phase, attempt)
                } else {
                    format!("{} running {}", event.actor, phase)
                };
                self.busy(label);
            }
            EventKind::PhaseCompleted => {
                self.phase_bar.inc(1);
                self.print_line(format!("{}Phase {} complete", CHECK, style(phase).green().bold()));
            }
            EventKind::PhaseSkipped => {
                self.phase_bar.inc(1);
                self.print_line(format!(
                    "{}Phase {} skipped: {}",
                    SKIP,
                    style(phase).yellow(),
                    event.detail_str("reason").unwrap_or_default()
                ));
            }
            EventKind::PhaseFailed => {
                let retry = event.detail.get("will_retry").and_then(|v| v.as_bool()).unwrap_or(false);
                let icon = if retry { RETRY } else { CROSS };
                self.print_line(format!(
                    "{}Phase {} failed{}: {}",
                    icon,
                    style(phase).red().bold(),
                    if retry { ", retrying" } else { "" },
                    event.detail_str("reason").unwrap_or_default()
                ));
            }
            EventKind::InvocationFailed => self.print_line(format!(
                "    {} {}",
                style("!").red(),
                event.detail_str("error").unwrap_or("invocation failed")
            )),
            EventKind::ReportInvalid => self.print_line(format!(
                "    {} no valid report from {}",
                style("!").red(),
                event.actor
            )),
            EventKind::ConfidenceEvaluated => {
                if self.verbose {
                    self.print_line(format!(
                        "    {}{}",
                        GAUGE,
                        style(event.detail_str("summary").unwrap_or_default()).dim()
                    ));
                }
            }
            EventKind::DecisionRecorded | EventKind::DefaultApplied => {
                if self.verbose || event.kind == EventKind::DefaultApplied {
                    self.print_line(format!(
                        "    {} {} = {}",
                        style("•").dim(),
                        event.detail_str("key").unwrap_or_default(),
                        style(event.detail_str("value").unwrap_or_default()).cyan()
                    ));
                }
            }
            EventKind::ChallengeRaised => self.print_line(format!(
                "{}{} challenges {}: {}",
                CHALLENGE,
                style(&event.actor).yellow(),
                event.detail_str("target").unwrap_or("the previous phase"),
                event.detail_str("issue").unwrap_or_default()
            )),
            EventKind::ChallengeResolved => {
                self.print_line(format!("    {} challenge addressed, re-running {}", CHECK, phase))
            }
            EventKind::ChallengeEscalated => {
                self.print_line(format!("{}challenge escalated to a checkpoint", CHALLENGE))
            }
            EventKind::CheckpointCreated => {
                self.activity.finish_and_clear();
                self.print_line(format!(
                    "\n{}Paused at {} ({})\n{}",
                    PAUSE,
                    style(phase).yellow().bold(),
                    event.detail_str("reason").unwrap_or_default(),
                    event.detail_str("detail").unwrap_or_default()
                ));
            }
            EventKind::CheckpointResolved => self.print_line(format!(
                "{}Checkpoint {}: {}",
                QUESTION,
                event.detail_str("checkpoint").unwrap_or_default(),
                event.detail_str("decision").unwrap_or_default()
            )),
            EventKind::RecoveryStarted => {
                self.print_line(format!(
                    "{}Build failed, {} attempting recovery",
                    WRENCH,
                    style(&event.actor).yellow()
                ));
                if self.verbose {
                    self.print_line(format!("{}", style(event.detail_str("output").unwrap_or_default()).dim()));
                }
            }
            EventKind::TaskDispatched => {
                let task = event.detail_str("task").unwrap_or_default();
                self.print_line(format!(
                    "    {}{} {}",
                    WAVE,
                    style(task).cyan(),
                    event.detail_str("title").unwrap_or_default()
                ));
                self.busy(format!("tasks running, latest {}", task));
            }
            EventKind::TaskCompleted => self.print_line(format!(
                "    {}task {}",
                CHECK,
                event.detail_str("task").unwrap_or_default()
            )),
            EventKind::TaskFailed => self.print_line(format!(
                "    {}task {}: {}",
                CROSS,
                event.detail_str("task").unwrap_or_default(),
                event.detail_str("error").unwrap_or("skipped")
            )),
            EventKind::MergeStarted => self.busy("merging task branches".to_string()),
            EventKind::MergeConflict => self.print_line(format!(
                "    {}conflict merging {}",
                MERGE,
                event.detail_str("task").unwrap_or_default()
            )),
            EventKind::MergeCompleted => self.print_line(format!("    {}merge finished", MERGE)),
            EventKind::RunPaused => {}
            EventKind::RunCompleted | EventKind::RunFailed | EventKind::RunAborted => {
                self.activity.finish_and_clear();
            }
        }
    }

    /// Final summary line.
    pub fn finish(&self, outcome: &RunOutcome) {
        self.activity.finish_and_clear();
        self.phase_bar.abandon();
        match outcome.status {
            RunStatus::Complete => self.print_line(format!(
                "\n{}Run {} complete (${:.2})",
                SPARKLE,
                style(&outcome.run_id).green().bold(),
                outcome.cost_usd
            )),
            RunStatus::Paused => self.print_line(format!(
                "\nRun {} is waiting at checkpoint {}. Resume with `hive resume`.",
                style(&outcome.run_id).yellow().bold(),
                outcome.checkpoint.as_deref().unwrap_or("?")
            )),
            status => self.print_line(format!(
                "\n{}Run {} {}: {}",
                CROSS,
                style(&outcome.run_id).red().bold(),
                status,
                outcome.failure.as_deref().unwrap_or("no reason recorded")
            )),
        }
    }
}

/// Render events from `rx` until the sender side closes.
pub fn spawn_event_printer(ui: std::sync::Arc<RunUI>, mut rx: mpsc::UnboundedReceiver<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            ui.handle(&event);
        }
    })
}

/// One plain-text line for `hive events`.
pub fn event_line(event: &Event) -> String {
    let detail = match event.kind {
        EventKind::PhaseFailed | EventKind::PhaseSkipped | EventKind::RunFailed => {
            event.detail_str("reason").map(String::from)
        }
        EventKind::InvocationFailed => event.detail_str("error").map(String::from),
        EventKind::ConfidenceEvaluated => event.detail_str("summary").map(String::from),
        EventKind::DecisionRecorded | EventKind::DefaultApplied => Some(format!(
            "{} = {}",
            event.detail_str("key").unwrap_or_default(),
            event.detail_str("value").unwrap_or_default()
        )),
        EventKind::ChallengeRaised => event.detail_str("issue").map(String::from),
        EventKind::CheckpointCreated => event.detail_str("reason").map(String::from),
        EventKind::CheckpointResolved => event.detail_str("decision").map(String::from),
        EventKind::TaskDispatched | EventKind::TaskCompleted | EventKind::TaskFailed | EventKind::MergeConflict => {
            event.detail_str("task").map(String::from)
        }
        _ => None,
    };
    let phase = event
        .detail_str("phase")
        .map(|p| format!(" [{}]", p))
        .unwrap_or_default();
    match detail {
        Some(d) => format!(
            "{:>4} {} {:<20} {}{} {}",
            event.seq,
            event.timestamp.format("%H:%M:%S"),
            event.kind,
            event.actor,
            phase,
            d
        ),
        None => format!(
            "{:>4} {} {:<20} {}{}",
            event.seq,
            event.timestamp.format("%H:%M:%S"),
            event.kind,
            event.actor,
            phase
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(kind: EventKind, detail: serde_json::Value) -> Event {
        Event {
            seq: 7,
            timestamp: Utc::now(),
            kind,
            actor: "architect".to_string(),
            detail,
        }
    }

    #[test]
    fn test_event_line_includes_reason() {
        let line = event_line(&event(
            EventKind::PhaseFailed,
            json!({"phase": "design", "reason": "timed out"}),
        ));
        assert!(line.contains("phase_failed"));
        assert!(line.contains("[design]"));
        assert!(line.ends_with("timed out"));
    }

    #[test]
    fn test_event_line_decision() {
        let line = event_line(&event(
            EventKind::DecisionRecorded,
            json!({"key": "db", "value": "sqlite"}),
        ));
        assert!(line.contains("db = sqlite"));
    }

    #[test]
    fn test_handle_every_kind_without_panicking() {
        let ui = RunUI::new(3, 0, true);
        for kind in [
            EventKind::RunStarted,
            EventKind::PhaseStarted,
            EventKind::PhaseCompleted,
            EventKind::CheckpointCreated,
            EventKind::TaskFailed,
            EventKind::RunCompleted,
        ] {
            ui.handle(&event(kind, json!({})));
        }
    }
}
