//! Independent evaluation passes.
//!
//! Each pass asks a separate agent invocation to rate one aspect of a phase's
//! output (completeness, coherence, risk) on a 0..1 scale. Passes that fail or
//! return no parseable score are dropped rather than guessed.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::orchestrator::runner::{AgentBackend, InvocationRequest};
use crate::util::{extract_json_object, truncate_chars};

/// Transcript chars shown to an evaluation pass.
const MAX_EVAL_INPUT: usize = 12_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub pass: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Scores from one round of passes and what the invocations cost.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationRound {
    pub results: Vec<EvaluationResult>,
    pub cost_usd: f64,
}

fn pass_question(pass: &str) -> String {
    match pass {
        "completeness" => "Does the output fully accomplish the objective, with nothing left unfinished?".to_string(),
        "coherence" => "Is the output internally consistent and consistent with the objective?".to_string(),
        "risk" => "Is the output free of risky changes (data loss, security holes, broken interfaces)? Higher is safer.".to_string(),
        other => format!("How well does the output do on '{}'?", other),
    }
}

/// Prompt for one evaluation pass.
pub fn evaluation_prompt(pass: &str, objective: &str, phase: &str, output: &str) -> String {
    format!(
        "You are an independent evaluator. Do not modify any files.\n\n\
         Objective: {objective}\n\
         Phase: {phase}\n\n\
         {question}\n\n\
         --- OUTPUT ---\n{output}\n--- END OUTPUT ---\n\n\
         Respond with only a JSON object: {{\"score\": <number from 0 to 1>, \"reason\": \"<one sentence>\"}}\n",
        objective = objective,
        phase = phase,
        question = pass_question(pass),
        output = truncate_chars(output, MAX_EVAL_INPUT),
    )
}

/// Pull `{"score": n}` out of an evaluator's reply. Scores outside 0..1 are rejected.
pub fn parse_evaluation(pass: &str, text: &str) -> Option<EvaluationResult> {
    let json = extract_json_object(text)?;
    let value: serde_json::Value = serde_json::from_str(&json).ok()?;
    let score = value.get("score")?.as_f64()?;
    if !(0.0..=1.0).contains(&score) {
        return None;
    }
    Some(EvaluationResult {
        pass: pass.to_string(),
        score,
        reason: value
            .get("reason")
            .and_then(|r| r.as_str())
            .map(String::from),
    })
}

/// Run each configured pass in order. Cost is counted for every pass that
/// ran, scored or not.
#[allow(clippy::too_many_arguments)]
pub async fn run_evaluation_passes(
    backend: &dyn AgentBackend,
    agent: &str,
    passes: &[String],
    objective: &str,
    phase: &str,
    output: &str,
    workdir: &Path,
    timeout: Duration,
) -> EvaluationRound {
    let mut round = EvaluationRound::default();
    for pass in passes {
        let request = InvocationRequest {
            agent: agent.to_string(),
            prompt: evaluation_prompt(pass, objective, phase, output),
            model: None,
            workdir: workdir.to_path_buf(),
            artifact: None,
            timeout,
        };
        match backend.invoke(request).await {
            Ok(out) => {
                round.cost_usd += out.cost_usd.unwrap_or(0.0);
                match parse_evaluation(pass, &out.text) {
                    Some(result) => round.results.push(result),
                    None => tracing::warn!(pass = %pass, phase = %phase, "evaluation pass returned no score"),
                }
            }
            Err(e) => tracing::warn!(pass = %pass, phase = %phase, error = %e, "evaluation pass failed"),
        }
    }
    round
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::InvocationError;
    use crate::orchestrator::runner::InvocationOutput;
    use async_trait::async_trait;

    /// Answers every pass with a fixed reply and price.
    struct PricedEvaluator {
        text: &'static str,
        cost_usd: Option<f64>,
    }

    #[async_trait]
    impl AgentBackend for PricedEvaluator {
        async fn invoke(&self, _request: InvocationRequest) -> Result<InvocationOutput, InvocationError> {
            Ok(InvocationOutput {
                text: self.text.to_string(),
                exit_code: 0,
                duration: Duration::from_millis(1),
                cost_usd: self.cost_usd,
            })
        }
    }

    fn passes() -> Vec<String> {
        vec!["completeness".to_string(), "risk".to_string()]
    }

    #[tokio::test]
    async fn test_round_sums_cost_of_every_pass() {
        let backend = PricedEvaluator {
            text: r#"{"score": 0.8, "reason": "fine"}"#,
            cost_usd: Some(0.1),
        };
        let round = run_evaluation_passes(
            &backend,
            "evaluator",
            &passes(),
            "add a spinner",
            "implementer",
            "did it",
            Path::new("."),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(round.results.len(), 2);
        assert!((round.cost_usd - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unscored_pass_still_costs() {
        let backend = PricedEvaluator {
            text: "I would rather not say.",
            cost_usd: Some(0.05),
        };
        let round = run_evaluation_passes(
            &backend,
            "evaluator",
            &passes(),
            "add a spinner",
            "implementer",
            "did it",
            Path::new("."),
            Duration::from_secs(5),
        )
        .await;
        assert!(round.results.is_empty());
        assert!((round.cost_usd - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_parse_evaluation() {
        let r = parse_evaluation("risk", r#"Sure. {"score": 0.7, "reason": "touches auth"} ok"#).unwrap();
        assert_eq!(r.pass, "risk");
        assert!((r.score - 0.7).abs() < 1e-9);
        assert_eq!(r.reason.as_deref(), Some("touches auth"));

        assert!(parse_evaluation("risk", r#"{"score": 7}"#).is_none());
        assert!(parse_evaluation("risk", r#"{"score": "high"}"#).is_none());
        assert!(parse_evaluation("risk", "no json").is_none());
    }

    #[test]
    fn test_prompt_names_pass_and_objective() {
        let p = evaluation_prompt("completeness", "add a spinner", "implementer", "did it");
        assert!(p.contains("add a spinner"));
        assert!(p.contains("fully accomplish"));
        assert!(p.contains("did it"));
    }
}
