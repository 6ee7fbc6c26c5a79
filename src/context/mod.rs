//! Context assembly.
//!
//! Builds the input bundle for one phase invocation from run state alone:
//! the objective, captured attachments, the scratchpad, and the latest
//! handoff of each earlier phase filtered by the receiving phase's role.
//! Directives (a challenge to answer, a build failure to fix, human guidance)
//! are rendered as explicit instructions.
//!
//! Assembly reads nothing but its arguments, so the same state always yields
//! the same bundle and the same digest.
//!
//! ## Role filtering
//!
//! | Field      | Design | Execute | Test | Review | Document |
//! |------------|--------|---------|------|--------|----------|
//! | notes      | yes    | yes     | yes  | yes    | yes      |
//! | decisions  | yes    | yes     | yes  | yes    | yes      |
//! | rationale  | yes    | no      | no   | yes    | yes      |
//! | files      | no     | yes     | yes  | yes    | no       |

use std::path::Path;

use crate::challenge::Challenge;
use crate::orchestrator::state::{Attachment, RunState};
use crate::report::REPORT_INSTRUCTIONS;
use crate::tracker::Task;
use crate::util::sha256_hex;
use crate::workflow::{Phase, Role};

/// An explicit instruction injected into a phase's context.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// A later phase objected to this phase's output
    Challenge(Challenge),
    /// The build failed and this invocation must fix it
    BuildFailure { command: String, output: String },
    /// A human note from a checkpoint
    Guidance(String),
    /// One task of a parallel step
    Task(Task),
    /// Merge conflicts between task branches to reconcile
    MergeConflict {
        branch: String,
        files: Vec<String>,
        intents: Vec<String>,
    },
}

impl Directive {
    fn render(&self) -> String {
        match self {
            Directive::Challenge(challenge) => challenge.directive(),
            Directive::BuildFailure { command, output } => format!(
                "The build command `{}` failed. Fix the cause, not the symptom, \
                 and keep the change minimal.\n\n```\n{}\n```\n",
                command,
                output.trim_end()
            ),
            Directive::Guidance(note) => format!(
                "A human reviewed the previous result and asked for the following:\n\n{}\n",
                note
            ),
            Directive::Task(task) => {
                let mut out = format!("Implement task {}: {}\n", task.id, task.title);
                if let Some(ref description) = task.description {
                    out.push_str(&format!("\n{}\n", description));
                }
                out.push_str(
                    "\nWork only on this task. Other tasks run in parallel in separate \
                     worktrees; do not touch files unrelated to this task.\n",
                );
                out
            }
            Directive::MergeConflict {
                branch,
                files,
                intents,
            } => {
                let mut out = format!(
                    "Merging branch `{}` produced conflicts in:\n{}\n\n\
                     Resolve every conflict so that both sides' intent survives. \
                     Where the changes cannot be combined mechanically, re-implement \
                     the incoming change on top of the current code. Leave no conflict markers.\n",
                    branch,
                    files
                        .iter()
                        .map(|f| format!("- {}", f))
                        .collect::<Vec<_>>()
                        .join("\n")
                );
                if !intents.is_empty() {
                    out.push_str("\nIntent of each side:\n");
                    for intent in intents {
                        out.push_str(&format!("- {}\n", intent));
                    }
                }
                out
            }
        }
    }
}

/// A prior phase's handoff, already filtered for the receiving role.
#[derive(Debug, Clone, PartialEq)]
pub struct HandoffView {
    pub phase: String,
    pub notes: Option<String>,
    pub decisions: Vec<String>,
    pub rationale: Option<String>,
    pub files: Vec<String>,
}

/// Everything one invocation is told.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextBundle {
    pub objective: String,
    pub phase: String,
    pub agent: String,
    pub role: Role,
    pub attachments: Vec<Attachment>,
    pub decisions: Vec<(String, String)>,
    pub handoffs: Vec<HandoffView>,
    pub directives: Vec<Directive>,
}

/// Assemble the context for workflow phase `index`, adding any stored
/// human guidance for it.
pub fn assemble(state: &RunState, index: usize, mut directives: Vec<Directive>) -> Option<ContextBundle> {
    let phase = state.phase(index)?;
    if let Some(ref guidance) = state.guidance
        && guidance.phase_index == index
    {
        directives.push(Directive::Guidance(guidance.note.clone()));
    }
    Some(assemble_for(state, phase, index, directives))
}

/// Assemble for `phase` (which need not belong to the workflow) as if it ran
/// after the first `before` workflow phases.
pub fn assemble_for(
    state: &RunState,
    phase: &Phase,
    before: usize,
    directives: Vec<Directive>,
) -> ContextBundle {
    let role = phase.role();
    let earlier = &state.workflow.phases[..before.min(state.workflow.phases.len())];

    let handoffs = earlier
        .iter()
        .filter(|p| phase.depends_on.is_empty() || phase.depends_on.contains(&p.name))
        .filter_map(|p| state.latest_handoff(&p.name))
        .map(|h| HandoffView {
            phase: h.phase.clone(),
            notes: h.notes.clone(),
            decisions: h.decisions.clone(),
            rationale: if role.receives_rationale() {
                h.rationale.clone()
            } else {
                None
            },
            files: if role.receives_file_targets() {
                h.files.clone()
            } else {
                Vec::new()
            },
        })
        .collect();

    ContextBundle {
        objective: state.objective.clone(),
        phase: phase.name.clone(),
        agent: phase.actor().to_string(),
        role,
        attachments: state.attachments.clone(),
        decisions: state.scratchpad().into_iter().collect(),
        handoffs,
        directives,
    }
}

impl ContextBundle {
    /// Render as the prompt text, headed by the agent's brief.
    pub fn render(&self, agent_brief: &str) -> String {
        let mut out = String::new();
        out.push_str(agent_brief.trim_end());
        out.push_str("\n\n");

        out.push_str(&format!(
            "# Hive phase: {} (role: {})\n\n## Objective\n\n{}\n\n",
            self.phase, self.role, self.objective
        ));

        if !self.attachments.is_empty() {
            out.push_str("## Attached context\n\n");
            for a in &self.attachments {
                out.push_str(&format!("### {}\n\n```\n{}\n```\n\n", a.path, a.content.trim_end()));
            }
        }

        if !self.decisions.is_empty() {
            out.push_str("## Decisions so far\n\n");
            for (key, value) in &self.decisions {
                out.push_str(&format!("- {}: {}\n", key, value));
            }
            out.push('\n');
        }

        if !self.handoffs.is_empty() {
            out.push_str("## Handoffs from earlier phases\n\n");
            for h in &self.handoffs {
                out.push_str(&format!("### {}\n\n", h.phase));
                if let Some(ref notes) = h.notes {
                    out.push_str(&format!("{}\n\n", notes));
                }
                if let Some(ref rationale) = h.rationale {
                    out.push_str(&format!("Rationale: {}\n\n", rationale));
                }
                if !h.decisions.is_empty() {
                    out.push_str("Decisions:\n");
                    for d in &h.decisions {
                        out.push_str(&format!("- {}\n", d));
                    }
                    out.push('\n');
                }
                if !h.files.is_empty() {
                    out.push_str("Files:\n");
                    for f in &h.files {
                        out.push_str(&format!("- {}\n", f));
                    }
                    out.push('\n');
                }
            }
        }

        if !self.directives.is_empty() {
            out.push_str("## Instructions for this invocation\n\n");
            for d in &self.directives {
                out.push_str(&d.render());
                out.push('\n');
            }
        }

        out.push_str(REPORT_INSTRUCTIONS);
        out
    }

    /// Planned file targets from earlier phases, for the planned-files check.
    pub fn planned_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .handoffs
            .iter()
            .flat_map(|h| h.files.iter().cloned())
            .collect();
        files.sort();
        files.dedup();
        files
    }
}

/// SHA-256 of a rendered prompt.
pub fn digest(rendered: &str) -> String {
    sha256_hex(rendered.as_bytes())
}

/// The agent's prompt file (`.hive/agents/<agent>.md`), or a one-line brief.
pub fn load_agent_brief(agents_dir: &Path, agent: &str) -> String {
    match std::fs::read_to_string(agents_dir.join(format!("{}.md", agent))) {
        Ok(content) if !content.trim().is_empty() => content,
        _ => default_brief(agent, Role::for_agent(agent)),
    }
}

fn default_brief(agent: &str, role: Role) -> String {
    let task = match role {
        Role::Design => "Design the change: decide the approach, list the files to touch and record key decisions.",
        Role::Execute => "Implement the change in the working tree.",
        Role::Test => "Write and run tests for the change; fix what fails.",
        Role::Review => "Review the change for correctness and risk. Challenge earlier phases when their output is wrong.",
        Role::Document => "Document the change for users and maintainers.",
    };
    format!("You are the {} agent. {}", agent, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::Severity;
    use crate::orchestrator::state::{DecisionSource, Guidance, Handoff};
    use crate::report::parse_report;
    use crate::workflow::Workflow;

    fn state_with_design_handoff() -> RunState {
        let mut state = RunState::new(
            "r1".to_string(),
            "add a loading spinner".to_string(),
            Workflow::builtin("full").unwrap(),
            false,
            vec![Attachment {
                path: "notes.md".to_string(),
                content: "use the brand colour".to_string(),
            }],
        );
        let report = parse_report(
            r#"HIVE_REPORT {"status": "complete", "rationale": "CSS-only keeps bundle small",
            "files": ["src/spinner.tsx"], "notes": "spinner design", "decisions": ["style: css"]} END_HIVE_REPORT"#,
        )
        .unwrap();
        state.handoffs.push(Handoff::from_report(&state.workflow.phases[0].clone(), 1, &report));
        state.record_decision("style", "css", DecisionSource::Agent, "architect");
        state
    }

    #[test]
    fn test_execution_phase_gets_files_not_rationale() {
        let state = state_with_design_handoff();
        let bundle = assemble(&state, 1, Vec::new()).unwrap();
        assert_eq!(bundle.role, Role::Execute);
        assert_eq!(bundle.handoffs.len(), 1);
        assert_eq!(bundle.handoffs[0].files, vec!["src/spinner.tsx".to_string()]);
        assert_eq!(bundle.handoffs[0].rationale, None);
        let rendered = bundle.render("brief");
        assert!(!rendered.contains("CSS-only"));
        assert!(rendered.contains("src/spinner.tsx"));
    }

    #[test]
    fn test_document_phase_gets_rationale_not_files() {
        let state = state_with_design_handoff();
        let bundle = assemble(&state, 5, Vec::new()).unwrap();
        assert_eq!(bundle.role, Role::Document);
        assert_eq!(bundle.handoffs[0].rationale.as_deref(), Some("CSS-only keeps bundle small"));
        assert!(bundle.handoffs[0].files.is_empty());
    }

    #[test]
    fn test_review_phase_gets_both() {
        let state = state_with_design_handoff();
        let bundle = assemble(&state, 4, Vec::new()).unwrap();
        assert!(bundle.handoffs[0].rationale.is_some());
        assert!(!bundle.handoffs[0].files.is_empty());
    }

    #[test]
    fn test_only_earlier_phases_contribute() {
        let state = state_with_design_handoff();
        let bundle = assemble(&state, 0, Vec::new()).unwrap();
        assert!(bundle.handoffs.is_empty());
        assert!(assemble(&state, 99, Vec::new()).is_none());
    }

    #[test]
    fn test_depends_on_restricts_handoffs() {
        let mut state = state_with_design_handoff();
        state.workflow.phases[4].depends_on = vec!["tester".to_string()];
        let bundle = assemble(&state, 4, Vec::new()).unwrap();
        assert!(bundle.handoffs.is_empty());
    }

    #[test]
    fn test_assembly_is_deterministic() {
        let state = state_with_design_handoff();
        let a = assemble(&state, 1, Vec::new()).unwrap().render("brief");
        let b = assemble(&state, 1, Vec::new()).unwrap().render("brief");
        assert_eq!(digest(&a), digest(&b));
    }

    #[test]
    fn test_challenge_and_guidance_directives() {
        let mut state = state_with_design_handoff();
        state.guidance = Some(Guidance {
            phase_index: 0,
            note: "prefer an SVG spinner".to_string(),
        });
        let challenge = Challenge {
            challenger: "implementer".to_string(),
            target: Some("architect".to_string()),
            issue: "no reduced-motion support".to_string(),
            evidence: None,
            suggestion: None,
            severity: Severity::Medium,
            can_proceed_with_default: false,
        };
        let rendered = assemble(&state, 0, vec![Directive::Challenge(challenge)])
            .unwrap()
            .render("brief");
        assert!(rendered.contains("no reduced-motion support"));
        assert!(rendered.contains("prefer an SVG spinner"));
        assert!(rendered.contains("HIVE_REPORT"));

        // Guidance for another phase is not injected
        let other = assemble(&state, 1, Vec::new()).unwrap();
        assert!(other.directives.is_empty());
    }

    #[test]
    fn test_attachments_and_decisions_rendered() {
        let state = state_with_design_handoff();
        let rendered = assemble(&state, 1, Vec::new()).unwrap().render("brief");
        assert!(rendered.contains("use the brand colour"));
        assert!(rendered.contains("- style: css"));
        assert!(rendered.contains("add a loading spinner"));
    }

    #[test]
    fn test_agent_brief_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_agent_brief(dir.path(), "architect").contains("Design the change"));
        std::fs::write(dir.path().join("architect.md"), "Custom architect prompt").unwrap();
        assert_eq!(load_agent_brief(dir.path(), "architect"), "Custom architect prompt");
    }

    #[test]
    fn test_planned_files_dedup() {
        let state = state_with_design_handoff();
        let bundle = assemble(&state, 1, Vec::new()).unwrap();
        assert_eq!(bundle.planned_files(), vec!["src/spinner.tsx".to_string()]);
    }
}
