//! Challenge routing.
//!
//! A phase that disagrees with an earlier phase's output reports
//! `status: "challenge"`. The router decides whether the challenged phase gets
//! one replay with the objection injected, or whether the edge has used its
//! rounds and the disagreement goes to a human checkpoint.

use serde::{Deserialize, Serialize};

use crate::orchestrator::state::RunState;

/// How serious the challenger considers the problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Lenient parse; unknown values map to `Medium`.
    pub fn parse_lenient(s: &str) -> Severity {
        match s.trim().to_lowercase().as_str() {
            "low" | "minor" => Severity::Low,
            "high" | "major" => Severity::High,
            "critical" | "blocker" => Severity::Critical,
            _ => Severity::Medium,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A structured objection from one phase about an earlier phase's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    /// Phase raising the challenge
    pub challenger: String,
    /// Phase (or agent) being challenged; `None` means the previous phase
    #[serde(default)]
    pub target: Option<String>,
    pub issue: String,
    #[serde(default)]
    pub evidence: Option<String>,
    #[serde(default)]
    pub suggestion: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    /// The challenger could live with the original output if nobody acts
    #[serde(default)]
    pub can_proceed_with_default: bool,
}

impl Challenge {
    /// Render as an explicit instruction for the challenged phase.
    pub fn directive(&self) -> String {
        let mut out = format!(
            "Your previous output was challenged by the {} phase (severity: {}).\n\nIssue: {}\n",
            self.challenger, self.severity, self.issue
        );
        if let Some(ref evidence) = self.evidence {
            out.push_str(&format!("Evidence: {}\n", evidence));
        }
        if let Some(ref suggestion) = self.suggestion {
            out.push_str(&format!("Suggested change: {}\n", suggestion));
        }
        out.push_str(
            "\nAddress this issue directly. Revise your output and report the revised result. \
             If you believe the challenge is wrong, explain why in your notes.\n",
        );
        out
    }
}

/// Key identifying a challenger→target edge.
pub fn edge_key(challenger: &str, target: &str) -> String {
    format!("{}->{}", challenger, target)
}

/// A challenge as recorded in run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeRecord {
    pub challenge: Challenge,
    /// Resolved target phase name
    pub target_phase: String,
    /// 1-based round on this edge
    pub round: u32,
    pub resolved: bool,
}

/// What the engine should do with a challenge.
#[derive(Debug, Clone, PartialEq)]
pub enum ChallengeRoute {
    /// Re-invoke the target phase once with the challenge injected.
    Replay { target_index: usize, round: u32 },
    /// The edge has used its rounds: surface every challenge on it to a human.
    Escalate {
        target_index: usize,
        history: Vec<Challenge>,
    },
    /// The target is not an earlier phase of this workflow.
    InvalidTarget { reason: String },
}

/// Bounds challenge replays per edge.
#[derive(Debug, Clone)]
pub struct ChallengeRouter {
    max_rounds_per_edge: u32,
}

impl ChallengeRouter {
    pub fn new(max_rounds_per_edge: u32) -> Self {
        Self {
            max_rounds_per_edge,
        }
    }

    /// Decide how to handle `challenge` raised by the phase at `challenger_index`.
    pub fn route(
        &self,
        state: &RunState,
        challenger_index: usize,
        challenge: &Challenge,
    ) -> ChallengeRoute {
        let phases = &state.workflow.phases;
        let target_index = match challenge.target.as_deref() {
            Some(target) => match state.workflow.phase_index(target) {
                Some(idx) => idx,
                None => {
                    return ChallengeRoute::InvalidTarget {
                        reason: format!("no phase named '{}' in this workflow", target),
                    };
                }
            },
            None if challenger_index > 0 => challenger_index - 1,
            None => {
                return ChallengeRoute::InvalidTarget {
                    reason: "the first phase has no earlier phase to challenge".to_string(),
                };
            }
        };

        if target_index >= challenger_index {
            return ChallengeRoute::InvalidTarget {
                reason: format!(
                    "'{}' does not run before '{}'",
                    phases[target_index].name, phases[challenger_index].name
                ),
            };
        }

        let edge = edge_key(&phases[challenger_index].name, &phases[target_index].name);
        let rounds = state.challenge_rounds.get(&edge).copied().unwrap_or(0);
        if rounds >= self.max_rounds_per_edge {
            let mut history: Vec<Challenge> = state
                .challenges
                .iter()
                .filter(|r| {
                    r.challenge.challenger == phases[challenger_index].name
                        && r.target_phase == phases[target_index].name
                })
                .map(|r| r.challenge.clone())
                .collect();
            history.push(challenge.clone());
            ChallengeRoute::Escalate {
                target_index,
                history,
            }
        } else {
            ChallengeRoute::Replay {
                target_index,
                round: rounds + 1,
            }
        }
    }
}
