//! Composite confidence scoring.
//!
//! A phase's routing score combines three signals, each weighted by
//! `[confidence]` in hive.toml:
//! - the agent's self-reported confidence (0.5 when it gives none)
//! - the fraction of automated checks that passed
//! - the mean of any independent evaluation passes
//!
//! Weights are renormalised over the signals actually present, so a phase
//! with no checks and no evaluations is scored on its self-report alone.
//! `score` is a pure function of its inputs.

pub mod checks;
pub mod evaluation;

pub use checks::CheckResult;
pub use evaluation::{EvaluationResult, EvaluationRound, run_evaluation_passes};

use serde::{Deserialize, Serialize};

use crate::hive_config::ConfidenceConfig;
use crate::report::{HiveReport, ReportStatus};

/// Self-report used when the agent omits `confidence`.
const NEUTRAL_SELF_REPORT: f64 = 0.5;

/// Routing bucket consumed by the workflow engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceCategory {
    ClearPass,
    NeedsReview,
    Fail,
}

impl std::fmt::Display for ConfidenceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfidenceCategory::ClearPass => write!(f, "clear-pass"),
            ConfidenceCategory::NeedsReview => write!(f, "needs-review"),
            ConfidenceCategory::Fail => write!(f, "fail"),
        }
    }
}

/// A computed routing score with the evidence behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceScore {
    pub score: f64,
    pub category: ConfidenceCategory,
    #[serde(default)]
    pub self_reported: Option<f64>,
    #[serde(default)]
    pub checks: Vec<CheckResult>,
    #[serde(default)]
    pub evaluations: Vec<EvaluationResult>,
    /// Why the category differs from what the score alone implies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl ConfidenceScore {
    /// Failed checks, for diagnostics.
    pub fn failed_checks(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }

    /// One-line summary for logs and checkpoint prompts.
    pub fn summary(&self) -> String {
        let mut out = format!("{:.2} ({})", self.score, self.category);
        let failed: Vec<String> = self
            .failed_checks()
            .iter()
            .map(|c| match c.detail {
                Some(ref d) => format!("{}: {}", c.name, d),
                None => c.name.clone(),
            })
            .collect();
        if !failed.is_empty() {
            out.push_str(&format!("; failed checks: {}", failed.join("; ")));
        }
        out
    }
}

/// Combine a report, its automated checks and evaluation results into a score.
pub fn score(
    config: &ConfidenceConfig,
    report: &HiveReport,
    checks: &[CheckResult],
    evaluations: &[EvaluationResult],
) -> ConfidenceScore {
    let self_value = report.confidence.unwrap_or(NEUTRAL_SELF_REPORT);

    let mut weighted = vec![(config.self_weight, self_value)];
    if !checks.is_empty() {
        let passed = checks.iter().filter(|c| c.passed).count() as f64;
        weighted.push((config.checks_weight, passed / checks.len() as f64));
    }
    if !evaluations.is_empty() {
        let mean = evaluations.iter().map(|e| e.score).sum::<f64>() / evaluations.len() as f64;
        weighted.push((config.eval_weight, mean));
    }

    let total_weight: f64 = weighted.iter().map(|(w, _)| w.max(0.0)).sum();
    let value = if total_weight > 0.0 {
        weighted.iter().map(|(w, v)| w.max(0.0) * v).sum::<f64>() / total_weight
    } else {
        self_value
    };
    let value = value.clamp(0.0, 1.0);

    let mut notes = Vec::new();
    let mut category = if value >= config.clear_pass {
        ConfidenceCategory::ClearPass
    } else if value < config.fail_below {
        ConfidenceCategory::Fail
    } else {
        ConfidenceCategory::NeedsReview
    };

    if let Some(hard) = checks.iter().find(|c| c.hard && !c.passed) {
        category = ConfidenceCategory::Fail;
        notes.push(format!("hard check '{}' failed", hard.name));
    } else if report.status == ReportStatus::Partial && category == ConfidenceCategory::ClearPass {
        category = ConfidenceCategory::NeedsReview;
        notes.push("partial report capped at needs-review".to_string());
    }

    ConfidenceScore {
        score: value,
        category,
        self_reported: report.confidence,
        checks: checks.to_vec(),
        evaluations: evaluations.to_vec(),
        notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report(status: ReportStatus, confidence: Option<f64>) -> HiveReport {
        HiveReport {
            status,
            confidence,
            diagnostics: Vec::new(),
            payload: json!({"status": status.as_str()}),
            synthesized: false,
        }
    }

    fn eval(pass: &str, score: f64) -> EvaluationResult {
        EvaluationResult {
            pass: pass.to_string(),
            score,
            reason: None,
        }
    }

    #[test]
    fn test_self_report_only() {
        let config = ConfidenceConfig::default();
        let s = score(&config, &report(ReportStatus::Complete, Some(0.9)), &[], &[]);
        assert!((s.score - 0.9).abs() < 1e-9);
        assert_eq!(s.category, ConfidenceCategory::ClearPass);

        let s = score(&config, &report(ReportStatus::Complete, Some(0.6)), &[], &[]);
        assert_eq!(s.category, ConfidenceCategory::NeedsReview);

        let s = score(&config, &report(ReportStatus::Complete, Some(0.2)), &[], &[]);
        assert_eq!(s.category, ConfidenceCategory::Fail);
    }

    #[test]
    fn test_missing_self_report_is_neutral() {
        let config = ConfidenceConfig::default();
        let s = score(&config, &report(ReportStatus::Complete, None), &[], &[]);
        assert!((s.score - 0.5).abs() < 1e-9);
        assert_eq!(s.category, ConfidenceCategory::NeedsReview);
        assert_eq!(s.self_reported, None);
    }

    #[test]
    fn test_weights_renormalise_over_present_signals() {
        let config = ConfidenceConfig::default();
        let checks = vec![CheckResult::pass("a"), CheckResult::soft_fail("b", "missing")];
        // (0.4 * 1.0 + 0.4 * 0.5) / 0.8 = 0.75
        let s = score(&config, &report(ReportStatus::Complete, Some(1.0)), &checks, &[]);
        assert!((s.score - 0.75).abs() < 1e-9);

        // (0.4 * 1.0 + 0.4 * 0.5 + 0.2 * 0.0) / 1.0 = 0.6
        let s = score(
            &config,
            &report(ReportStatus::Complete, Some(1.0)),
            &checks,
            &[eval("risk", 0.0)],
        );
        assert!((s.score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_hard_failure_forces_fail() {
        let config = ConfidenceConfig::default();
        let checks = vec![CheckResult::hard_fail("build_passed", "exit 1")];
        let s = score(&config, &report(ReportStatus::Complete, Some(1.0)), &checks, &[]);
        assert_eq!(s.category, ConfidenceCategory::Fail);
        assert!(s.summary().contains("build_passed: exit 1"));
    }

    #[test]
    fn test_partial_capped_at_needs_review() {
        let config = ConfidenceConfig::default();
        let s = score(&config, &report(ReportStatus::Partial, Some(0.95)), &[], &[]);
        assert_eq!(s.category, ConfidenceCategory::NeedsReview);
        assert_eq!(s.notes.len(), 1);
    }

    #[test]
    fn test_deterministic_for_identical_inputs() {
        let config = ConfidenceConfig::default();
        let r = report(ReportStatus::Complete, Some(0.73));
        let checks = vec![CheckResult::pass("a"), CheckResult::soft_fail("b", "x")];
        let evals = vec![eval("completeness", 0.8), eval("coherence", 0.65)];
        let a = score(&config, &r, &checks, &evals);
        let b = score(&config, &r, &checks, &evals);
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_weights_fall_back_to_self_report() {
        let config = ConfidenceConfig {
            self_weight: 0.0,
            checks_weight: 0.0,
            eval_weight: 0.0,
            ..Default::default()
        };
        let s = score(&config, &report(ReportStatus::Complete, Some(0.85)), &[], &[]);
        assert!((s.score - 0.85).abs() < 1e-9);
    }
}
