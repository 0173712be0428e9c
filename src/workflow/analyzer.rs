//! Post-execution step analysis: success, fulfillment, and loop detection

use super::planner::PlanningContext;
use crate::llm::util::truncate_preview;
use crate::llm::{GenerationConfig, LlmClient, PromptContext, PromptTemplates};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Analyzer verdict for one executed step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAnalysis {
    /// One-sentence account of what the step accomplished
    pub summary: String,
    /// Whether the driving loop should keep iterating
    pub should_continue: bool,
    /// Recent steps semantically repeat the same failing attempt
    pub loop_detected: bool,
    /// 0..1 confidence that the original request is satisfied
    pub fulfillment_score: Option<f64>,
}

/// Judges each executed step's outcome against the original request
///
/// This component is advisory: if the LLM is unavailable it degrades to a
/// conservative verdict instead of halting the workflow.
pub struct StepResultAnalyzer {
    llm: Arc<dyn LlmClient>,
    result_preview_chars: usize,
}

impl StepResultAnalyzer {
    pub fn new(llm: Arc<dyn LlmClient>, result_preview_chars: usize) -> Self {
        Self {
            llm,
            result_preview_chars,
        }
    }

    /// Analyze one step's textual result
    ///
    /// `loop_detected` overrides the model's raw continue signal: a detected
    /// loop always stops the workflow.
    pub async fn analyze_step_result(
        &self,
        step_description: &str,
        step_result: &str,
        context: &PlanningContext,
    ) -> StepAnalysis {
        match self
            .analyze_with_llm(step_description, step_result, context)
            .await
        {
            Ok(analysis) => analysis,
            Err(e) => {
                tracing::warn!(
                    "step analysis unavailable ({}); using conservative fallback",
                    e
                );
                StepAnalysis {
                    summary: truncate_preview(step_result, self.result_preview_chars),
                    should_continue: context.current_step < context.max_steps,
                    loop_detected: false,
                    fulfillment_score: None,
                }
            }
        }
    }

    async fn analyze_with_llm(
        &self,
        step_description: &str,
        step_result: &str,
        context: &PlanningContext,
    ) -> Result<StepAnalysis, crate::MaestroError> {
        let history = if context.completed_steps.is_empty() {
            "(this was the first step)".to_string()
        } else {
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
        };

        let prompt_context = PromptContext::new()
            .with_variable("original_request", &context.original_request)
            .with_variable("history", history)
            .with_variable("step_description", step_description)
            .with_variable("step_result", step_result);

        let (system, user) = PromptTemplates::step_result_analysis()
            .fill(&prompt_context)
            .map_err(crate::MaestroError::planning)?;

        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "summary": {"type": "string"},
                "stepSucceeded": {"type": "boolean"},
                "requestFulfilled": {"type": "boolean"},
                "fulfillmentScore": {"type": "number"},
                "loopDetected": {"type": "boolean"},
                "shouldContinue": {"type": "boolean"}
            },
            "required": ["summary", "shouldContinue"]
        });

        let raw = self
            .llm
            .generate_structured(&user, &system, &schema, &GenerationConfig::deterministic(512))
            .await?;

        let summary = raw
            .get("summary")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(|| truncate_preview(step_result, self.result_preview_chars));

        let loop_detected = raw
            .get("loopDetected")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let raw_should_continue = raw
            .get("shouldContinue")
            .and_then(|v| v.as_bool())
            .unwrap_or(context.current_step < context.max_steps);

        // A detected loop is an override, not a suggestion
        let should_continue = if loop_detected {
            if raw_should_continue {
                tracing::warn!("model reported a loop but asked to continue; forcing stop");
            }
            false
        } else {
            raw_should_continue
        };

        let fulfillment_score = raw
            .get("fulfillmentScore")
            .and_then(|v| v.as_f64())
            .map(|score| score.clamp(0.0, 1.0));

        tracing::debug!(
            step = context.current_step,
            should_continue,
            loop_detected,
            fulfillment = fulfillment_score.unwrap_or(-1.0),
            "step result analyzed"
        );

        Ok(StepAnalysis {
            summary,
            should_continue,
            loop_detected,
            fulfillment_score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockLlm;
    use serde_json::json;

    fn context(steps: &[&str], results: &[&str]) -> PlanningContext {
        PlanningContext {
            original_request: "schedule a meeting with John tomorrow".to_string(),
            current_step: steps.len() + 1,
            max_steps: 10,
            completed_steps: steps.iter().map(|s| s.to_string()).collect(),
            step_results: results.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_successful_analysis() {
        let llm = Arc::new(MockLlm::new().with_structured(json!({
            "summary": "found John's email address",
            "stepSucceeded": true,
            "requestFulfilled": false,
            "fulfillmentScore": 0.4,
            "loopDetected": false,
            "shouldContinue": true
        })));
        let analyzer = StepResultAnalyzer::new(llm, 500);

        let analysis = analyzer
            .analyze_step_result(
                "find John's contact info",
                "found john@acme.test",
                &context(&[], &[]),
            )
            .await;

        assert!(analysis.should_continue);
        assert!(!analysis.loop_detected);
        assert_eq!(analysis.fulfillment_score, Some(0.4));
    }

    #[tokio::test]
    async fn test_loop_detection_overrides_continue() {
        // Contradictory raw output: loop detected, yet shouldContinue true
        let llm = Arc::new(MockLlm::new().with_structured(json!({
            "summary": "another contact lookup failed the same way",
            "loopDetected": true,
            "shouldContinue": true
        })));
        let analyzer = StepResultAnalyzer::new(llm, 500);

        let analysis = analyzer
            .analyze_step_result(
                "search contacts for John again",
                "contact not found",
                &context(
                    &["find John's contact info"],
                    &["unfortunately, contact not found"],
                ),
            )
            .await;

        assert!(analysis.loop_detected);
        assert!(!analysis.should_continue);
    }

    #[tokio::test]
    async fn test_fulfillment_score_is_clamped() {
        let llm = Arc::new(MockLlm::new().with_structured(json!({
            "summary": "done",
            "shouldContinue": false,
            "fulfillmentScore": 1.7
        })));
        let analyzer = StepResultAnalyzer::new(llm, 500);

        let analysis = analyzer
            .analyze_step_result("send invite", "invite sent", &context(&[], &[]))
            .await;
        assert_eq!(analysis.fulfillment_score, Some(1.0));
    }

    #[tokio::test]
    async fn test_llm_failure_degrades_gracefully() {
        let analyzer = StepResultAnalyzer::new(Arc::new(MockLlm::failing()), 30);

        let long_result = "the calendar service reported an internal error and gave up".repeat(3);
        let analysis = analyzer
            .analyze_step_result("check calendar", &long_result, &context(&[], &[]))
            .await;

        // Fallback: truncated raw result, continue while under the ceiling
        assert!(analysis.summary.ends_with("..."));
        assert!(analysis.should_continue);
        assert!(!analysis.loop_detected);
        assert_eq!(analysis.fulfillment_score, None);
    }

    #[tokio::test]
    async fn test_fallback_stops_at_step_ceiling() {
        let analyzer = StepResultAnalyzer::new(Arc::new(MockLlm::failing()), 500);
        let mut ctx = context(&[], &[]);
        ctx.current_step = 10;
        ctx.max_steps = 10;

        let analysis = analyzer
            .analyze_step_result("check calendar", "error", &ctx)
            .await;
        assert!(!analysis.should_continue);
    }
}
