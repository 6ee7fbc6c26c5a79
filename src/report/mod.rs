//! Structured phase reports.
//!
//! Agents finish every invocation with a machine-readable report block. The
//! envelope (`status`, `confidence`, `diagnostics`) is validated strictly;
//! everything else is role-specific payload read leniently.

mod parser;
mod types;

pub use parser::{ParseError, ReportParser, parse_envelope, parse_report};
pub use types::{HiveReport, ReportDecision, ReportStatus};

/// Instructions appended to every prompt describing the report format.
pub const REPORT_INSTRUCTIONS: &str = r#"## Reporting

When you are finished, end your response with exactly one report block:

HIVE_REPORT
{"status": "complete", "confidence": 0.9, "diagnostics": [], "notes": "..."}
END_HIVE_REPORT

- status: one of complete, partial, blocked, challenge, needs_input
- confidence: your confidence in the result, a number from 0 to 1
- diagnostics: problems worth surfacing, as strings
- Optional keys: notes, rationale, decisions (["key: value", ...]),
  files_touched (paths), tasks ([{"id", "title", "description", "blocked_by", "labels"}])
- To dispute an earlier phase, use status "challenge" with
  "challenge": {"target": "<phase>", "issue": "...", "evidence": "...", "suggestion": "...", "severity": "low|medium|high|critical"}
- To ask a question, use status "needs_input" with "question", "default" and
  "can_proceed_with_default"

Only the last report block counts.
"#;
