//! Report extraction from agent transcripts.
//!
//! Two equivalent delimiter conventions are accepted anywhere in free-form
//! output:
//! - labelled block: `HIVE_REPORT {json} END_HIVE_REPORT` (JSON may be fenced)
//! - comment-wrapped block: `<!-- HIVE_REPORT {json} -->`
//!
//! The last well-formed block wins; earlier drafts and malformed blocks are
//! skipped. When nothing valid is found the caller gets a `ParseError`, which
//! `parse_or_blocked` turns into a synthesized BLOCKED report.

use super::types::{HiveReport, ReportStatus};
use crate::util::find_json_object;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use thiserror::Error;

static MARKER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(<!--\s*)?\bHIVE_REPORT\b:?").unwrap());

const END_MARKER: &str = "END_HIVE_REPORT";
const COMMENT_END: &str = "-->";

/// Why a transcript did not yield a valid report.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("no HIVE_REPORT block found in output")]
    NoReportBlock,

    #[error("HIVE_REPORT block is not followed by a JSON object")]
    MissingJson,

    #[error("HIVE_REPORT block is missing its closing {expected}")]
    Unterminated { expected: &'static str },

    #[error("HIVE_REPORT JSON is malformed: {0}")]
    MalformedJson(String),

    #[error("HIVE_REPORT must be a JSON object")]
    NotAnObject,

    #[error("HIVE_REPORT is missing the required 'status' field")]
    MissingStatus,

    #[error("HIVE_REPORT status '{0}' is not one of complete, partial, blocked, challenge, needs_input")]
    UnknownStatus(String),

    #[error("HIVE_REPORT confidence must be a number in [0, 1], got {0}")]
    ConfidenceOutOfRange(String),
}

/// Delimiter convention of a candidate block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delimiter {
    Labelled,
    Comment,
}

/// Parser for structured reports.
pub struct ReportParser {
    verbose: bool,
}

impl ReportParser {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Extract the last well-formed report block.
    pub fn parse(&self, text: &str) -> Result<HiveReport, ParseError> {
        let candidates: Vec<Result<HiveReport, ParseError>> = MARKER_REGEX
            .captures_iter(text)
            .filter_map(|cap| {
                let whole = cap.get(0)?;
                let delimiter = if cap.get(1).is_some() {
                    Delimiter::Comment
                } else {
                    Delimiter::Labelled
                };
                Some(parse_block(&text[whole.end()..], delimiter))
            })
            .collect();

        let mut last_error = None;
        for candidate in candidates.into_iter().rev() {
            match candidate {
                Ok(report) => return Ok(report),
                Err(e) => {
                    if self.verbose {
                        tracing::debug!(error = %e, "skipping malformed report block");
                    }
                    last_error.get_or_insert(e);
                }
            }
        }
        Err(last_error.unwrap_or(ParseError::NoReportBlock))
    }

    /// Parse, or synthesize a BLOCKED report carrying the parser diagnostic.
    pub fn parse_or_blocked(&self, text: &str) -> HiveReport {
        match self.parse(text) {
            Ok(report) => report,
            Err(e) => HiveReport::blocked(format!("report parse error: {}", e)),
        }
    }
}

fn strip_fence(s: &str) -> &str {
    let s = s.trim_start();
    match s.strip_prefix("```") {
        Some(rest) => rest
            .strip_prefix("json")
            .unwrap_or(rest)
            .trim_start(),
        None => s,
    }
}

fn parse_block(after_marker: &str, delimiter: Delimiter) -> Result<HiveReport, ParseError> {
    let body = strip_fence(after_marker);
    if !body.starts_with('{') {
        return Err(ParseError::MissingJson);
    }
    let (start, end) = find_json_object(body).ok_or(ParseError::MissingJson)?;
    let json = &body[start..end];

    let rest = body[end..].trim_start();
    let rest = rest.strip_prefix("```").unwrap_or(rest).trim_start();
    let expected = match delimiter {
        Delimiter::Labelled => END_MARKER,
        Delimiter::Comment => COMMENT_END,
    };
    if !rest.starts_with(expected) {
        return Err(ParseError::Unterminated { expected });
    }

    parse_envelope(json)
}

/// Validate the envelope of a report JSON object. The object is kept verbatim as payload.
pub fn parse_envelope(json: &str) -> Result<HiveReport, ParseError> {
    let value: Value =
        serde_json::from_str(json).map_err(|e| ParseError::MalformedJson(e.to_string()))?;
    let obj = value.as_object().ok_or(ParseError::NotAnObject)?;

    let status = match obj.get("status") {
        None | Some(Value::Null) => return Err(ParseError::MissingStatus),
        Some(Value::String(s)) => {
            ReportStatus::parse(s).ok_or_else(|| ParseError::UnknownStatus(s.clone()))?
        }
        Some(other) => return Err(ParseError::UnknownStatus(other.to_string())),
    };

    let confidence = match obj.get("confidence") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => match n.as_f64() {
            Some(c) if (0.0..=1.0).contains(&c) => Some(c),
            _ => return Err(ParseError::ConfidenceOutOfRange(n.to_string())),
        },
        Some(other) => return Err(ParseError::ConfidenceOutOfRange(other.to_string())),
    };

    let diagnostics = match obj.get("diagnostics") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|d| d.as_str().map(String::from))
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    };

    Ok(HiveReport {
        status,
        confidence,
        diagnostics,
        payload: value,
        synthesized: false,
    })
}

/// Convenience function to parse without creating a parser.
pub fn parse_report(text: &str) -> Result<HiveReport, ParseError> {
    ReportParser::new(false).parse(text)
}
