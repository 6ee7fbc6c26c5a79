//! Structured phase report types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::challenge::{Challenge, Severity};
use crate::tracker::Task;

/// Outcome an agent reports for its phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Complete,
    Partial,
    Blocked,
    Challenge,
    NeedsInput,
}

impl ReportStatus {
    /// Strict parse of the envelope's `status` field. Accepts `needs-input` as an alias.
    pub fn parse(s: &str) -> Option<ReportStatus> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "complete" => Some(ReportStatus::Complete),
            "partial" => Some(ReportStatus::Partial),
            "blocked" => Some(ReportStatus::Blocked),
            "challenge" => Some(ReportStatus::Challenge),
            "needs_input" => Some(ReportStatus::NeedsInput),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReportStatus::Complete => "complete",
            ReportStatus::Partial => "partial",
            ReportStatus::Blocked => "blocked",
            ReportStatus::Challenge => "challenge",
            ReportStatus::NeedsInput => "needs_input",
        }
    }

    /// Complete or partial: the phase produced usable output.
    pub fn is_success(self) -> bool {
        matches!(self, ReportStatus::Complete | ReportStatus::Partial)
    }
}

impl std::fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decision an agent asks to record in the run scratchpad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportDecision {
    pub key: Option<String>,
    pub value: String,
}

/// Envelope `{status, confidence, diagnostics}` plus the verbatim payload.
///
/// The payload is the whole reported JSON object; role-specific keys are read
/// leniently through the accessors below and never schema-checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiveReport {
    pub status: ReportStatus,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub diagnostics: Vec<String>,
    #[serde(default)]
    pub payload: Value,
    /// Produced by the parser because no valid report was found
    #[serde(default)]
    pub synthesized: bool,
}

impl HiveReport {
    /// A BLOCKED report standing in for a missing or invalid one.
    pub fn blocked(diagnostic: impl Into<String>) -> Self {
        Self {
            status: ReportStatus::Blocked,
            confidence: None,
            diagnostics: vec![diagnostic.into()],
            payload: Value::Null,
            synthesized: true,
        }
    }

    fn str_field(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .filter_map(|k| self.payload.get(*k))
            .find_map(value_to_text)
            .filter(|s| !s.trim().is_empty())
    }

    /// Files the agent says it touched or plans to touch.
    pub fn files(&self) -> Vec<String> {
        ["files_touched", "files", "files_changed", "file_targets"]
            .iter()
            .filter_map(|k| self.payload.get(*k))
            .filter_map(|v| v.as_array())
            .flat_map(|arr| arr.iter().filter_map(|f| f.as_str().map(String::from)))
            .collect()
    }

    pub fn notes(&self) -> Option<String> {
        self.str_field(&["notes", "summary"])
    }

    pub fn rationale(&self) -> Option<String> {
        self.str_field(&["rationale", "reasoning"])
    }

    /// Decisions as `{key, value}` objects, `"key: value"` strings, or bare strings.
    pub fn decisions(&self) -> Vec<ReportDecision> {
        let Some(items) = self.payload.get("decisions").and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(match s.split_once(':') {
                    Some((k, v)) if !k.trim().is_empty() && !k.contains(' ') => ReportDecision {
                        key: Some(k.trim().to_string()),
                        value: v.trim().to_string(),
                    },
                    _ => ReportDecision {
                        key: None,
                        value: s.trim().to_string(),
                    },
                }),
                Value::Object(map) => {
                    let value = map
                        .get("value")
                        .or_else(|| map.get("decision"))
                        .and_then(value_to_text)?;
                    let key = map.get("key").and_then(|k| k.as_str()).map(String::from);
                    Some(ReportDecision { key, value })
                }
                _ => None,
            })
            .collect()
    }

    /// The challenge carried by a `challenge` report, from a nested
    /// `challenge` object or top-level keys.
    pub fn challenge(&self, challenger: &str) -> Option<Challenge> {
        let source = match self.payload.get("challenge") {
            Some(obj @ Value::Object(_)) => obj,
            _ => &self.payload,
        };
        let text = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .filter_map(|k| source.get(*k))
                .find_map(value_to_text)
        };
        let issue = text(&["issue", "problem", "reason"])?;
        Some(Challenge {
            challenger: challenger.to_string(),
            target: text(&["target", "target_phase", "challenged_phase", "phase"]),
            issue,
            evidence: text(&["evidence"]),
            suggestion: text(&["suggestion", "proposed_fix"]),
            severity: text(&["severity"])
                .map(|s| Severity::parse_lenient(&s))
                .unwrap_or_default(),
            can_proceed_with_default: source
                .get("can_proceed_with_default")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })
    }

    pub fn question(&self) -> Option<String> {
        self.str_field(&["question", "input_needed"])
    }

    /// The answer the agent would use if nobody responds.
    pub fn default_answer(&self) -> Option<String> {
        self.str_field(&["default", "default_answer"])
    }

    /// Whether applying `default_answer` without a human is acceptable.
    pub fn default_allowed(&self) -> bool {
        let explicit = ["can_proceed_with_default", "default_allowed"]
            .iter()
            .find_map(|k| self.payload.get(*k).and_then(|v| v.as_bool()));
        explicit.unwrap_or(true) && self.default_answer().is_some()
    }

    /// Scratchpad key for a needs_input answer.
    pub fn input_key(&self) -> Option<String> {
        self.str_field(&["key", "decision_key"])
    }

    /// Independent tasks proposed for a parallel step.
    pub fn tasks(&self) -> Vec<Task> {
        self.payload
            .get("tasks")
            .and_then(|v| serde_json::from_value::<Vec<Task>>(v.clone()).ok())
            .unwrap_or_default()
    }
}

fn value_to_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(value_to_text).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        other => Some(other.to_string()),
    }
}
