//! Prompt templates for the orchestration core's LLM interactions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Template for different types of LLM interactions
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub system_message: String,
    pub user_template: String,
    pub variables: Vec<String>,
}

/// Context for filling prompt templates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptContext {
    pub variables: HashMap<String, String>,
}

impl PromptContext {
    pub fn new() -> Self {
        Self {
            variables: HashMap::new(),
        }
    }

    pub fn with_variable<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn set_variable<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.variables.insert(key.into(), value.into());
    }

    pub fn get_variable(&self, key: &str) -> Option<&String> {
        self.variables.get(key)
    }
}

impl Default for PromptContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptTemplate {
    /// Fill the template with context variables
    pub fn fill(&self, context: &PromptContext) -> Result<(String, String), String> {
        let mut system_message = self.system_message.clone();
        let mut user_message = self.user_template.clone();

        for (key, value) in &context.variables {
            let placeholder = format!("{{{{{}}}}}", key);
            system_message = system_message.replace(&placeholder, value);
            user_message = user_message.replace(&placeholder, value);
        }

        for variable in &self.variables {
            let placeholder = format!("{{{{{}}}}}", variable);
            if (system_message.contains(&placeholder) || user_message.contains(&placeholder))
                && !context.variables.contains_key(variable)
            {
                return Err(format!("Missing required variable: {}", variable));
            }
        }

        Ok((system_message, user_message))
    }
}

/// Collection of predefined prompt templates for the orchestration core
pub struct PromptTemplates;

impl PromptTemplates {
    /// Template for planning the single next workflow step
    pub fn step_planning() -> PromptTemplate {
        PromptTemplate {
            system_message: r#"
You are the planning brain of a personal assistant that fulfills user requests
through domain sub-agents (email, calendar, contacts, messaging). You plan ONE
step at a time: given the original request and everything already attempted,
decide the single next instruction, or declare the request complete.

## Output Format
Always respond with a JSON object following this exact structure:

```json
{
    "nextStep": "one clear natural-language instruction for a sub-agent, or empty string when complete",
    "isComplete": false,
    "reasoning": "one or two sentences on why this is the right next step"
}
```

## Planning Guidelines
1. **One step only** - never describe a multi-step sequence
2. **Be concrete** - name the person, time, or resource the sub-agent should act on
3. **Use prior results** - never re-request information already obtained in earlier steps
4. **Declare completion** - set isComplete true as soon as the original request is satisfied
5. **Stop on dead ends** - if the same kind of attempt keeps failing, completion with a
   best-effort answer beats another doomed retry
"#
            .to_string(),
            user_template: "## Current Time\n{{current_time}}\n\n## Original Request\n{{original_request}}\n\n## Progress\nStep {{current_step}} of at most {{max_steps}}.\n\n## Completed Steps\n{{history}}\n{{stall_notice}}\nPlan the next step.".to_string(),
            variables: vec![
                "current_time".to_string(),
                "original_request".to_string(),
                "current_step".to_string(),
                "max_steps".to_string(),
                "history".to_string(),
                "stall_notice".to_string(),
            ],
        }
    }

    /// Template for judging one executed step's result
    pub fn step_result_analysis() -> PromptTemplate {
        PromptTemplate {
            system_message: r#"
You evaluate the outcome of one workflow step executed by a sub-agent on behalf
of a user request. Judge what actually happened, not what was intended.

## Output Format
Always respond with a JSON object following this exact structure:

```json
{
    "summary": "one-sentence account of what this step accomplished or why it failed",
    "stepSucceeded": true,
    "requestFulfilled": false,
    "fulfillmentScore": 0.4,
    "loopDetected": false,
    "shouldContinue": true
}
```

## Judging Guidelines
1. **stepSucceeded** - did THIS step achieve its own instruction
2. **requestFulfilled** - is the ORIGINAL request now fully answered
3. **fulfillmentScore** - 0.0 to 1.0 confidence that the original request is satisfied
4. **loopDetected** - true when recent steps semantically repeat the same attempt,
   even with different wording ("check calendar" and "list calendar events" are the
   same attempt); repeated failures of the same approach are a loop
5. **shouldContinue** - false when the request is fulfilled, when further attempts
   cannot help, or when a loop is detected
"#
            .to_string(),
            user_template: "## Original Request\n{{original_request}}\n\n## Prior Steps\n{{history}}\n\n## Step Just Executed\n{{step_description}}\n\n## Its Result\n{{step_result}}\n\nEvaluate this result.".to_string(),
            variables: vec![
                "original_request".to_string(),
                "history".to_string(),
                "step_description".to_string(),
                "step_result".to_string(),
            ],
        }
    }

    /// Shared output contract for every plan-modification prompt
    fn modification_output_contract() -> &'static str {
        r#"
## Output Format
Respond with a JSON array of zero to three modification proposals, most
important first:

```json
[
    {
        "type": "add_step | remove_step | modify_step | reorder_steps | skip_step | replace_plan | merge_steps | split_step",
        "changes": {
            // shape depends on type:
            // add_step:      {"newSteps": [{"description": "...", "toolName": "...", "parameters": {}}], "stepNumber": 2}
            // remove_step:   {"stepsToRemove": [3, 4]}
            // modify_step:   {"stepNumber": 2, "modifications": {"description": "...", "maxRetries": 2}}
            // reorder_steps: {"newOrder": [2, 1, 3]}  // must list EVERY current step number exactly once
            // skip_step:     {"stepNumber": 3}
            // replace_plan:  {"replacementPlan": [{"description": "...", "toolName": "...", "parameters": {}}]}
            // merge_steps:   {"mergePairs": [[2, 3]]}
            // split_step:    {"splitDetails": {"stepNumber": 2, "replacementSteps": [{"description": "...", "toolName": "...", "parameters": {}}]}}
        },
        "reasoning": "why this change helps",
        "confidence": 0.8,
        "priority": "low | medium | high | critical",
        "estimatedImpact": {"timeChange": -30, "successProbability": 0.9, "riskLevel": "low | medium | high"}
    }
]
```

Return an empty array when the remaining plan is already the best course.
"#
    }

    /// Template for telemetry-driven plan analysis
    pub fn plan_analysis() -> PromptTemplate {
        PromptTemplate {
            system_message: format!(
                r#"
You review the remaining plan of an in-flight assistant workflow against its
execution telemetry and propose structured modifications when the plan no
longer fits reality.

## When To Propose Changes
- A completed step already produced what a pending step would fetch: remove it
- A failed step blocks everything after it: insert a recovery step or replace the approach
- Steps are ordered so that a later step's input is produced after it runs: reorder
- Two adjacent steps hit the same sub-agent for the same data: merge them
- One step secretly does two things and half of it keeps failing: split it
{}"#,
                Self::modification_output_contract()
            ),
            user_template: "## Original Request\n{{original_request}}\n\n## Execution Telemetry\n{{telemetry}}\n\n## Remaining Plan\n{{remaining_plan}}\n\nPropose modifications.".to_string(),
            variables: vec![
                "original_request".to_string(),
                "telemetry".to_string(),
                "remaining_plan".to_string(),
            ],
        }
    }

    /// Template for recovering from a failed step
    pub fn failure_recovery() -> PromptTemplate {
        PromptTemplate {
            system_message: format!(
                r#"
A workflow step just failed. Propose plan modifications that route around the
failure or rephrase the attempt, considering how many retries were already
spent.

## Recovery Guidance
- Prefer a different approach over a verbatim retry of the failed step
- If the failure makes dependent steps pointless, remove or replace them
- If retries remain and the error looks transient, a modify_step that tightens
  the instruction is acceptable
- If nothing can recover the failure, return an empty array and let the
  workflow conclude with what it has
{}"#,
                Self::modification_output_contract()
            ),
            user_template: "## Original Request\n{{original_request}}\n\n## Failed Step (number {{failed_step}})\n{{step_description}}\n\n## Error\n{{error}}\n\n## Retries Used\n{{retry_count}} of {{max_retries}}\n\n## Remaining Plan\n{{remaining_plan}}\n\nPropose recovery modifications.".to_string(),
            variables: vec![
                "original_request".to_string(),
                "failed_step".to_string(),
                "step_description".to_string(),
                "error".to_string(),
                "retry_count".to_string(),
                "max_retries".to_string(),
                "remaining_plan".to_string(),
            ],
        }
    }

    /// Template for optimizing a healthy plan
    pub fn plan_optimization() -> PromptTemplate {
        PromptTemplate {
            system_message: format!(
                r#"
You look for efficiency improvements in the remaining plan of a healthy
assistant workflow: redundant fetches, mergeable sub-agent calls, steps made
unnecessary by results already in hand. Only propose a change when it clearly
reduces time or failure risk; a working plan left alone is a fine outcome.
{}"#,
                Self::modification_output_contract()
            ),
            user_template: "## Original Request\n{{original_request}}\n\n## Completed Steps\n{{completed_steps}}\n\n## Remaining Plan\n{{remaining_plan}}\n\nPropose optimizations, or an empty array.".to_string(),
            variables: vec![
                "original_request".to_string(),
                "completed_steps".to_string(),
                "remaining_plan".to_string(),
            ],
        }
    }

    /// Template for classifying a user message against an active workflow
    pub fn intent_classification() -> PromptTemplate {
        PromptTemplate {
            system_message: r#"
A user message has arrived while the assistant may have a workflow in flight.
Classify the message's relationship to that workflow and the impact it should
have on it.

## Output Format
Always respond with a JSON object following this exact structure:

```json
{
    "userIntent": "what the user actually wants, in one sentence",
    "intentType": "continuation | interruption | clarification | correction | new_request | workflow_control",
    "confidence": 0.85,
    "workflowImpact": {
        "type": "none | pause | modify | abort | branch | priority_change",
        "severity": "low | medium | high | critical",
        "affectedSteps": [2, 3],
        "reasoning": "why the workflow is or is not affected",
        "preserveState": true
    },
    "suggestedAction": {
        "action": "continue_workflow | pause_workflow | modify_workflow | abort_workflow | respond_directly | defer",
        "reasoning": "why this action",
        "parameters": {},
        "estimatedTime": "seconds | minutes",
        "successProbability": 0.9
    },
    "contextualResponse": "what the assistant should say to the user right now",
    "extractedEntities": {"person": "John", "date": "tomorrow"},
    "urgency": "low | medium | high | critical"
}
```

## Classification Guidelines
1. **continuation** - supplies input the running workflow was waiting for
2. **interruption** - an unrelated need that should take over or run beside the workflow
3. **clarification** - asks about what the assistant is doing; workflow impact is none
4. **correction** - changes a detail of the running request; usually impact modify
5. **new_request** - unrelated work with no bearing on the current workflow
6. **workflow_control** - explicit stop/pause/resume/cancel phrasing; map to the matching impact
"#
            .to_string(),
            user_template: "## User Message\n{{user_input}}\n\n## Active Workflow\n{{workflow_snapshot}}\n\n## Recent Conversation\n{{conversation_window}}\n\nClassify this message.".to_string(),
            variables: vec![
                "user_input".to_string(),
                "workflow_snapshot".to_string(),
                "conversation_window".to_string(),
            ],
        }
    }

    /// Template for detecting a topic/context change between two inputs
    pub fn context_change_detection() -> PromptTemplate {
        PromptTemplate {
            system_message: r#"
Compare a new user message against the previous conversational context and
decide whether the user has changed topic, refined the same topic, or stayed
on course.

## Output Format
Always respond with a JSON object following this exact structure:

```json
{
    "contextChanged": true,
    "changeType": "topic_shift | refinement | abandonment | no_change",
    "confidence": 0.8,
    "reasoning": "one sentence on the relationship between the two inputs"
}
```
"#
            .to_string(),
            user_template: "## Previous Context\n{{previous_context}}\n\n## Active Workflow\n{{workflow_snapshot}}\n\n## New Message\n{{new_input}}\n\nAssess the change.".to_string(),
            variables: vec![
                "previous_context".to_string(),
                "workflow_snapshot".to_string(),
                "new_input".to_string(),
            ],
        }
    }

    /// Template for phrasing the assistant's reply after classification
    pub fn contextual_response() -> PromptTemplate {
        PromptTemplate {
            system_message: r#"
Write the assistant's next reply to the user. You are given the user's message,
how it was classified, and the state of any running workflow. Be brief, concrete
about what happens next, and never mention internal machinery (workflows,
steps, classification).
"#
            .to_string(),
            user_template: "## User Message\n{{user_input}}\n\n## Classification\n{{analysis_summary}}\n\n## Workflow State\n{{workflow_snapshot}}\n\nWrite the reply.".to_string(),
            variables: vec![
                "user_input".to_string(),
                "analysis_summary".to_string(),
                "workflow_snapshot".to_string(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_replaces_variables() {
        let template = PromptTemplates::step_planning();
        let context = PromptContext::new()
            .with_variable("current_time", "2026-08-07 10:00 UTC")
            .with_variable("original_request", "schedule a meeting with John tomorrow")
            .with_variable("current_step", "2")
            .with_variable("max_steps", "10")
            .with_variable("history", "1. find John's contact info -> found john@acme.test")
            .with_variable("stall_notice", "");

        let (system, user) = template.fill(&context).unwrap();
        assert!(system.contains("ONE"));
        assert!(user.contains("schedule a meeting with John tomorrow"));
        assert!(!user.contains("{{"));
    }

    #[test]
    fn test_fill_reports_missing_variable() {
        let template = PromptTemplates::intent_classification();
        let context = PromptContext::new().with_variable("user_input", "stop that");

        let err = template.fill(&context).unwrap_err();
        assert!(err.contains("Missing required variable"));
    }

    #[test]
    fn test_modification_templates_share_contract() {
        for template in [
            PromptTemplates::plan_analysis(),
            PromptTemplates::failure_recovery(),
            PromptTemplates::plan_optimization(),
        ] {
            assert!(template.system_message.contains("zero to three"));
            assert!(template.system_message.contains("replace_plan"));
        }
    }
}
