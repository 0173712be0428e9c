//! Single-step planner: asks the LLM for exactly one next instruction

use crate::llm::util::truncate_preview;
use crate::llm::{GenerationConfig, LlmClient, PromptContext, PromptTemplates};
use crate::utils::errors::MaestroError;
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Failure language matched (case-insensitively) against recent step results
/// when deciding whether the workflow is stalling on a dead-end approach
const FAILURE_PHRASES: [&str; 5] = ["wasn't able to", "unfortunately", "failed", "error", "couldn't"];

/// Token-overlap ratio above which two step descriptions count as the same attempt
const SIMILARITY_THRESHOLD: f64 = 0.5;

/// Everything the planner needs to know about a workflow's progress
#[derive(Debug, Clone)]
pub struct PlanningContext {
    pub original_request: String,
    /// 1-based index of the step about to be planned
    pub current_step: usize,
    pub max_steps: usize,
    /// Descriptions of completed steps, in execution order
    pub completed_steps: Vec<String>,
    /// Textual results of those steps, parallel to `completed_steps`
    pub step_results: Vec<String>,
}

/// The planner's verdict: one instruction, or a completion signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedStep {
    pub next_step: String,
    pub is_complete: bool,
    pub reasoning: Option<String>,
}

/// Plans the next natural-language instruction for a workflow
///
/// The planner deliberately has no fallback: a malformed model response is a
/// hard [`MaestroError::PlanningResponseInvalid`], because fabricating a next
/// action is riskier than halting.
pub struct StepPlanner {
    llm: Arc<dyn LlmClient>,
    result_preview_chars: usize,
}

impl StepPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, result_preview_chars: usize) -> Self {
        Self {
            llm,
            result_preview_chars,
        }
    }

    /// Plan the next step, or signal completion
    pub async fn plan_next_step(&self, context: &PlanningContext) -> Result<PlannedStep> {
        let history = self.render_history(context);
        let stall_notice = if Self::looks_stalled(context) {
            tracing::warn!(
                "workflow appears stalled after {} steps; biasing planner toward completion",
                context.completed_steps.len()
            );
            "\n## Important\nThe recent steps repeat the same failing approach. Strongly \
             prefer declaring the request complete with a best-effort answer over \
             planning another similar attempt.\n"
                .to_string()
        } else {
            String::new()
        };

        let prompt_context = PromptContext::new()
            .with_variable("current_time", Utc::now().format("%Y-%m-%d %H:%M UTC").to_string())
            .with_variable("original_request", &context.original_request)
            .with_variable("current_step", context.current_step.to_string())
            .with_variable("max_steps", context.max_steps.to_string())
            .with_variable("history", history)
            .with_variable("stall_notice", stall_notice);

        let (system, user) = PromptTemplates::step_planning()
            .fill(&prompt_context)
            .map_err(MaestroError::planning)?;

        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "nextStep": {"type": "string"},
                "isComplete": {"type": "boolean"},
                "reasoning": {"type": "string"}
            },
            "required": ["nextStep", "isComplete"]
        });

        let raw = self
            .llm
            .generate_structured(&user, &system, &schema, &GenerationConfig::deterministic(512))
            .await?;

        let is_complete = raw
            .get("isComplete")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let reasoning = raw
            .get("reasoning")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        if is_complete {
            tracing::info!(
                step = context.current_step,
                reasoning = reasoning.as_deref().unwrap_or(""),
                "planner declared workflow complete"
            );
            return Ok(PlannedStep {
                next_step: String::new(),
                is_complete: true,
                reasoning,
            });
        }

        let next_step = raw
            .get("nextStep")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or("");

        if next_step.is_empty() {
            return Err(MaestroError::planning_response_invalid(
                "model returned neither a next step nor a completion signal",
            ));
        }

        tracing::info!(
            step = context.current_step,
            instruction = next_step,
            reasoning = reasoning.as_deref().unwrap_or(""),
            "planned next step"
        );

        Ok(PlannedStep {
            next_step: next_step.to_string(),
            is_complete: false,
            reasoning,
        })
    }

    /// Render (step, result) history with bounded result previews
    fn render_history(&self, context: &PlanningContext) -> String {
        if context.completed_steps.is_empty() {
            return "(no steps executed yet)".to_string();
        }

        context
            .completed_steps
            .iter()
            .zip(context.step_results.iter())
            .enumerate()
            .map(|(index, (step, result))| {
                format!(
                    "{}. {} -> {}",
                    index + 1,
                    step,
                    truncate_preview(result, self.result_preview_chars)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Heuristic stall signal: the trailing >=2 steps are textually similar
    /// and every one of their results reads as a failure
    fn looks_stalled(context: &PlanningContext) -> bool {
        let steps = &context.completed_steps;
        let results = &context.step_results;
        if steps.len() < 2 || results.len() < 2 {
            return false;
        }

        let last = &steps[steps.len() - 1];
        let prev = &steps[steps.len() - 2];
        if Self::description_similarity(last, prev) < SIMILARITY_THRESHOLD {
            return false;
        }

        results[results.len() - 2..]
            .iter()
            .all(|result| Self::reads_as_failure(result))
    }

    /// Case-insensitive substring match against the fixed failure phrase set
    fn reads_as_failure(result: &str) -> bool {
        let lower = result.to_lowercase();
        FAILURE_PHRASES.iter().any(|phrase| lower.contains(phrase))
    }

    /// Token-overlap coefficient between two step descriptions
    ///
    /// Overlap against the smaller token set, not the union: "find John's
    /// contact info" and "search contacts for John again" concern the same
    /// action even though most surrounding words differ.
    fn description_similarity(a: &str, b: &str) -> f64 {
        let tokens_a = Self::tokens(a);
        let tokens_b = Self::tokens(b);
        if tokens_a.is_empty() || tokens_b.is_empty() {
            return 0.0;
        }

        let intersection = tokens_a.intersection(&tokens_b).count() as f64;
        let smaller = tokens_a.len().min(tokens_b.len()) as f64;
        intersection / smaller
    }

    fn tokens(text: &str) -> std::collections::HashSet<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| token.len() > 2)
            .map(|token| {
                // Fold trivial plurals so "contacts" matches "contact"
                let token = token.strip_suffix('s').filter(|_| token.len() > 3).unwrap_or(token);
                token.to_string()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockLlm;
    use serde_json::json;

    fn context_with_history(steps: &[&str], results: &[&str]) -> PlanningContext {
        PlanningContext {
            original_request: "schedule a meeting with John tomorrow".to_string(),
            current_step: steps.len() + 1,
            max_steps: 10,
            completed_steps: steps.iter().map(|s| s.to_string()).collect(),
            step_results: results.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_plans_next_step() {
        let llm = Arc::new(MockLlm::new().with_structured(json!({
            "nextStep": "find John's contact info",
            "isComplete": false,
            "reasoning": "need his email before inviting"
        })));
        let planner = StepPlanner::new(llm, 500);

        let planned = planner
            .plan_next_step(&context_with_history(&[], &[]))
            .await
            .unwrap();
        assert_eq!(planned.next_step, "find John's contact info");
        assert!(!planned.is_complete);
    }

    #[tokio::test]
    async fn test_completion_signal_short_circuits() {
        let llm = Arc::new(MockLlm::new().with_structured(json!({
            "nextStep": "this text must be ignored",
            "isComplete": true
        })));
        let planner = StepPlanner::new(llm, 500);

        let planned = planner
            .plan_next_step(&context_with_history(
                &["send the invite"],
                &["invite sent for 10am"],
            ))
            .await
            .unwrap();
        assert!(planned.is_complete);
        assert!(planned.next_step.is_empty());
    }

    #[tokio::test]
    async fn test_empty_next_step_is_hard_error() {
        let llm = Arc::new(MockLlm::new().with_structured(json!({
            "nextStep": "  ",
            "isComplete": false
        })));
        let planner = StepPlanner::new(llm, 500);

        let err = planner
            .plan_next_step(&context_with_history(&[], &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::PlanningResponseInvalid { .. }));
    }

    #[tokio::test]
    async fn test_llm_failure_propagates() {
        let llm = Arc::new(MockLlm::failing());
        let planner = StepPlanner::new(llm, 500);

        let err = planner
            .plan_next_step(&context_with_history(&[], &[]))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "llm");
    }

    #[tokio::test]
    async fn test_stall_heuristic_biases_prompt() {
        let llm = Arc::new(MockLlm::new().with_structured(json!({
            "nextStep": "",
            "isComplete": true
        })));
        let planner = StepPlanner::new(llm.clone(), 500);

        planner
            .plan_next_step(&context_with_history(
                &["find John's contact info", "search contacts for John again"],
                &[
                    "unfortunately no contact named John was found",
                    "the search failed with no results",
                ],
            ))
            .await
            .unwrap();

        let prompts = llm.recorded_prompts();
        assert!(prompts[0].contains("repeat the same failing approach"));
    }

    #[tokio::test]
    async fn test_no_stall_notice_for_distinct_steps() {
        let llm = Arc::new(MockLlm::new().with_structured(json!({
            "nextStep": "send the invite",
            "isComplete": false
        })));
        let planner = StepPlanner::new(llm.clone(), 500);

        planner
            .plan_next_step(&context_with_history(
                &["find John's contact info", "check tomorrow's calendar availability"],
                &["found john@acme.test", "free at 10am"],
            ))
            .await
            .unwrap();

        let prompts = llm.recorded_prompts();
        assert!(!prompts[0].contains("repeat the same failing approach"));
    }

    #[test]
    fn test_failure_language_matching() {
        assert!(StepPlanner::reads_as_failure("Unfortunately that didn't work"));
        assert!(StepPlanner::reads_as_failure("the lookup FAILED"));
        assert!(StepPlanner::reads_as_failure("I wasn't able to reach the calendar"));
        assert!(!StepPlanner::reads_as_failure("meeting booked for 10am"));
    }

    #[test]
    fn test_result_previews_are_truncated() {
        let planner = StepPlanner::new(Arc::new(MockLlm::new()), 20);
        let long_result = "x".repeat(200);
        let context = context_with_history(&["step one"], &[&long_result]);

        let history = planner.render_history(&context);
        assert!(history.len() < 60);
        assert!(history.contains("..."));
    }
}
