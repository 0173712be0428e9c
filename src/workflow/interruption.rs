//! Interruption handling: classifying user messages against active workflows
//!
//! Every public classification entry point here is infallible by design: a
//! broken LLM collaborator, malformed JSON, or a missing workflow produces a
//! conservative fallback analysis, never an error. The conversation must keep
//! moving even when the machinery behind it stumbles.

use super::state::{StepStatus, WorkflowState, WorkflowStatus};
use super::store::{WorkflowLocks, WorkflowStore};
use crate::llm::util::truncate_preview;
use crate::llm::{GenerationConfig, LlmClient, PromptContext, PromptTemplates};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Confidence attached to every fallback analysis
const FALLBACK_CONFIDENCE: f64 = 0.3;

/// How a user message relates to the active workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    Continuation,
    Interruption,
    Clarification,
    Correction,
    NewRequest,
    WorkflowControl,
}

impl IntentType {
    fn parse(value: Option<&str>, default: Self) -> Self {
        match value {
            Some("continuation") => Self::Continuation,
            Some("interruption") => Self::Interruption,
            Some("clarification") => Self::Clarification,
            Some("correction") => Self::Correction,
            Some("new_request") => Self::NewRequest,
            Some("workflow_control") => Self::WorkflowControl,
            _ => default,
        }
    }
}

/// The state transition a message demands of the workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactType {
    None,
    Pause,
    Modify,
    Abort,
    Branch,
    PriorityChange,
}

impl ImpactType {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("pause") => Self::Pause,
            Some("modify") => Self::Modify,
            Some("abort") => Self::Abort,
            Some("branch") => Self::Branch,
            Some("priority_change") => Self::PriorityChange,
            _ => Self::None,
        }
    }
}

/// Shared four-level scale for severity and urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Low,
    Medium,
    High,
    Critical,
}

impl Level {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("low") => Self::Low,
            Some("high") => Self::High,
            Some("critical") => Self::Critical,
            _ => Self::Medium,
        }
    }
}

/// What the assistant should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedActionKind {
    ContinueWorkflow,
    PauseWorkflow,
    ModifyWorkflow,
    AbortWorkflow,
    RespondDirectly,
    Defer,
}

impl SuggestedActionKind {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("continue_workflow") => Self::ContinueWorkflow,
            Some("pause_workflow") => Self::PauseWorkflow,
            Some("modify_workflow") => Self::ModifyWorkflow,
            Some("abort_workflow") => Self::AbortWorkflow,
            Some("defer") => Self::Defer,
            _ => Self::RespondDirectly,
        }
    }
}

/// Required workflow impact, as classified
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowImpact {
    pub impact_type: ImpactType,
    pub severity: Level,
    /// Step numbers a `modify` impact resets to pending
    pub affected_steps: Vec<usize>,
    pub reasoning: String,
    pub preserve_state: bool,
}

impl WorkflowImpact {
    fn none() -> Self {
        Self {
            impact_type: ImpactType::None,
            severity: Level::Low,
            affected_steps: Vec::new(),
            reasoning: String::new(),
            preserve_state: true,
        }
    }
}

/// Recommended next action with its expected payoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub action: SuggestedActionKind,
    pub reasoning: String,
    pub parameters: serde_json::Value,
    pub estimated_time: Option<String>,
    /// Clamped to [0, 1]
    pub success_probability: f64,
}

/// Ephemeral classification of one user message
///
/// Produced fresh per message, never persisted, consumed immediately to
/// decide whether and how to mutate the associated workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextAnalysis {
    pub user_intent: String,
    pub intent_type: IntentType,
    /// Clamped to [0, 1]
    pub confidence: f64,
    pub workflow_impact: WorkflowImpact,
    pub suggested_action: SuggestedAction,
    pub contextual_response: String,
    pub extracted_entities: HashMap<String, serde_json::Value>,
    pub urgency: Level,
}

/// Result of comparing a new input against the prior conversational context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextChangeDetection {
    pub context_changed: bool,
    pub change_type: ChangeType,
    pub confidence: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    TopicShift,
    Refinement,
    Abandonment,
    NoChange,
}

impl ChangeType {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("topic_shift") => Self::TopicShift,
            Some("refinement") => Self::Refinement,
            Some("abandonment") => Self::Abandonment,
            _ => Self::NoChange,
        }
    }
}

/// One turn of recent conversation fed to the classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

/// Classifies mid-flight user messages and applies immediate workflow impacts
pub struct InterruptionHandler {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn WorkflowStore>,
    locks: WorkflowLocks,
    conversation_window: usize,
}

impl InterruptionHandler {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn WorkflowStore>,
        locks: WorkflowLocks,
        conversation_window: usize,
    ) -> Self {
        Self {
            llm,
            store,
            locks,
            conversation_window,
        }
    }

    /// Classify a user message against the session's active workflow
    ///
    /// Never fails: any pipeline error yields the fixed fallback analysis.
    pub async fn analyze_user_intent(
        &self,
        user_input: &str,
        session_id: &str,
        history: &[ConversationTurn],
    ) -> ContextAnalysis {
        match self.classify(user_input, session_id, history, None).await {
            Ok(analysis) => analysis,
            Err(e) => {
                tracing::warn!(
                    session_id,
                    "intent classification unavailable ({}); using fallback",
                    e
                );
                self.fallback_analysis(user_input, IntentType::NewRequest)
            }
        }
    }

    /// Classify an explicit interruption and apply its workflow impact now
    ///
    /// `interruption_hint` is the caller's description of why this message
    /// counts as an interruption (e.g. "user typed during execution"); it is
    /// passed to the model as extra context. The fallback analysis from this
    /// path defaults the intent to `Interruption`.
    pub async fn handle_interruption(
        &self,
        user_input: &str,
        session_id: &str,
        interruption_hint: &str,
        workflow_id: Option<&str>,
    ) -> ContextAnalysis {
        let analysis = match self
            .classify(user_input, session_id, &[], Some(interruption_hint))
            .await
        {
            Ok(analysis) => analysis,
            Err(e) => {
                tracing::warn!(
                    session_id,
                    "interruption classification unavailable ({}); using fallback",
                    e
                );
                self.fallback_analysis(user_input, IntentType::Interruption)
            }
        };

        if analysis.workflow_impact.impact_type != ImpactType::None {
            let target = match workflow_id {
                Some(id) => Some(id.to_string()),
                None => self
                    .first_active_workflow(session_id)
                    .await
                    .map(|w| w.workflow_id),
            };

            match target {
                Some(id) => {
                    if let Err(e) = self.apply_impact(&id, &analysis.workflow_impact).await {
                        tracing::error!(
                            workflow_id = id.as_str(),
                            "failed to apply workflow impact: {}",
                            e
                        );
                    }
                }
                None => tracing::debug!(session_id, "interruption impact with no active workflow"),
            }
        }

        analysis
    }

    /// Compare a new input against the previous context
    pub async fn detect_context_change(
        &self,
        new_input: &str,
        previous_context: &str,
        workflow: Option<&WorkflowState>,
    ) -> ContextChangeDetection {
        let snapshot = workflow
            .map(Self::workflow_snapshot)
            .unwrap_or_else(|| "(no active workflow)".to_string());

        let prompt_context = PromptContext::new()
            .with_variable("previous_context", previous_context)
            .with_variable("workflow_snapshot", snapshot)
            .with_variable("new_input", new_input);

        let result: Result<ContextChangeDetection> = async {
            let (system, user) = PromptTemplates::context_change_detection()
                .fill(&prompt_context)
                .map_err(crate::MaestroError::planning)?;

            let schema = serde_json::json!({
                "type": "object",
                "properties": {
                    "contextChanged": {"type": "boolean"},
                    "changeType": {"type": "string"},
                    "confidence": {"type": "number"},
                    "reasoning": {"type": "string"}
                },
                "required": ["contextChanged", "changeType"]
            });

            let raw = self
                .llm
                .generate_structured(&user, &system, &schema, &GenerationConfig::deterministic(256))
                .await?;

            Ok(ContextChangeDetection {
                context_changed: raw
                    .get("contextChanged")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                change_type: ChangeType::parse(raw.get("changeType").and_then(|v| v.as_str())),
                confidence: raw
                    .get("confidence")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.5)
                    .clamp(0.0, 1.0),
                reasoning: raw
                    .get("reasoning")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            })
        }
        .await;

        result.unwrap_or_else(|e| {
            tracing::warn!("context change detection unavailable ({}); assuming no change", e);
            ContextChangeDetection {
                context_changed: false,
                change_type: ChangeType::NoChange,
                confidence: FALLBACK_CONFIDENCE,
                reasoning: "detection unavailable".to_string(),
            }
        })
    }

    /// Phrase the assistant's reply for an already-classified message
    pub async fn generate_contextual_response(
        &self,
        user_input: &str,
        analysis: &ContextAnalysis,
        workflow: Option<&WorkflowState>,
    ) -> String {
        let snapshot = workflow
            .map(Self::workflow_snapshot)
            .unwrap_or_else(|| "(no active workflow)".to_string());
        let summary = format!(
            "intent: {:?}, impact: {:?}, urgency: {:?}",
            analysis.intent_type, analysis.workflow_impact.impact_type, analysis.urgency
        );

        let prompt_context = PromptContext::new()
            .with_variable("user_input", user_input)
            .with_variable("analysis_summary", summary)
            .with_variable("workflow_snapshot", snapshot);

        let generated: Result<String> = async {
            let (system, user) = PromptTemplates::contextual_response()
                .fill(&prompt_context)
                .map_err(crate::MaestroError::planning)?;
            let text = self
                .llm
                .generate_text(&user, &system, &GenerationConfig::default())
                .await?;
            Ok(text)
        }
        .await;

        match generated {
            Ok(text) if !text.trim().is_empty() => text,
            _ if !analysis.contextual_response.is_empty() => analysis.contextual_response.clone(),
            _ => Self::generic_acknowledgement().to_string(),
        }
    }

    async fn classify(
        &self,
        user_input: &str,
        session_id: &str,
        history: &[ConversationTurn],
        interruption_hint: Option<&str>,
    ) -> Result<ContextAnalysis> {
        let workflow = self.first_active_workflow(session_id).await;
        let snapshot = workflow
            .as_ref()
            .map(Self::workflow_snapshot)
            .unwrap_or_else(|| "(no active workflow)".to_string());
        let snapshot = match interruption_hint {
            Some(hint) => format!("{}\nInterruption context: {}", snapshot, hint),
            None => snapshot,
        };

        let window_start = history.len().saturating_sub(self.conversation_window);
        let conversation = if history.is_empty() {
            "(no prior conversation)".to_string()
        } else {
            history[window_start..]
                .iter()
                .map(|turn| format!("{}: {}", turn.role, truncate_preview(&turn.content, 200)))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let prompt_context = PromptContext::new()
            .with_variable("user_input", user_input)
            .with_variable("workflow_snapshot", snapshot)
            .with_variable("conversation_window", conversation);

        let (system, user) = PromptTemplates::intent_classification()
            .fill(&prompt_context)
            .map_err(crate::MaestroError::planning)?;

        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "userIntent": {"type": "string"},
                "intentType": {"type": "string"},
                "confidence": {"type": "number"},
                "workflowImpact": {"type": "object"},
                "suggestedAction": {"type": "object"},
                "contextualResponse": {"type": "string"},
                "extractedEntities": {"type": "object"},
                "urgency": {"type": "string"}
            },
            "required": ["userIntent", "intentType"]
        });

        let raw = self
            .llm
            .generate_structured(&user, &system, &schema, &GenerationConfig::deterministic(768))
            .await?;

        let analysis = self.parse_analysis(&raw, user_input);
        tracing::info!(
            session_id,
            intent = ?analysis.intent_type,
            impact = ?analysis.workflow_impact.impact_type,
            confidence = analysis.confidence,
            "user intent classified"
        );
        Ok(analysis)
    }

    /// Field-by-field validation of the raw classification
    ///
    /// Nothing from the model is trusted verbatim: every enum goes through
    /// its closed-set parser and every number is clamped.
    fn parse_analysis(&self, raw: &serde_json::Value, user_input: &str) -> ContextAnalysis {
        let impact = raw.get("workflowImpact");
        let workflow_impact = WorkflowImpact {
            impact_type: ImpactType::parse(
                impact.and_then(|i| i.get("type")).and_then(|v| v.as_str()),
            ),
            severity: Level::parse(
                impact.and_then(|i| i.get("severity")).and_then(|v| v.as_str()),
            ),
            affected_steps: impact
                .and_then(|i| i.get("affectedSteps"))
                .and_then(|v| v.as_array())
                .map(|steps| {
                    steps
                        .iter()
                        .filter_map(|s| s.as_u64().map(|n| n as usize))
                        .collect()
                })
                .unwrap_or_default(),
            reasoning: impact
                .and_then(|i| i.get("reasoning"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            preserve_state: impact
                .and_then(|i| i.get("preserveState"))
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
        };

        let action = raw.get("suggestedAction");
        let suggested_action = SuggestedAction {
            action: SuggestedActionKind::parse(
                action.and_then(|a| a.get("action")).and_then(|v| v.as_str()),
            ),
            reasoning: action
                .and_then(|a| a.get("reasoning"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            parameters: action
                .and_then(|a| a.get("parameters"))
                .cloned()
                .unwrap_or_else(|| serde_json::json!({})),
            estimated_time: action
                .and_then(|a| a.get("estimatedTime"))
                .and_then(|v| v.as_str())
                .map(String::from),
            success_probability: action
                .and_then(|a| a.get("successProbability"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5)
                .clamp(0.0, 1.0),
        };

        ContextAnalysis {
            user_intent: raw
                .get("userIntent")
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(user_input)
                .to_string(),
            intent_type: IntentType::parse(
                raw.get("intentType").and_then(|v| v.as_str()),
                IntentType::NewRequest,
            ),
            confidence: raw
                .get("confidence")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5)
                .clamp(0.0, 1.0),
            workflow_impact,
            suggested_action,
            contextual_response: raw
                .get("contextualResponse")
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| Self::generic_acknowledgement())
                .to_string(),
            extracted_entities: raw
                .get("extractedEntities")
                .and_then(|v| v.as_object())
                .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
            urgency: Level::parse(raw.get("urgency").and_then(|v| v.as_str())),
        }
    }

    /// Apply a classified impact to the workflow immediately
    async fn apply_impact(&self, workflow_id: &str, impact: &WorkflowImpact) -> Result<()> {
        let _guard = self.locks.acquire(workflow_id).await;

        match impact.impact_type {
            ImpactType::Pause => {
                let Some(mut workflow) = self.store.get_workflow(workflow_id).await? else {
                    return Ok(());
                };
                if !workflow.is_terminal() {
                    workflow.status = WorkflowStatus::Paused;
                    workflow.touch();
                    self.store.put_workflow(&workflow).await?;
                    tracing::info!(workflow_id, "workflow paused by interruption");
                }
            }
            ImpactType::Abort => {
                self.store.cancel_workflow(workflow_id).await?;
                tracing::info!(workflow_id, "workflow cancelled by interruption");
            }
            ImpactType::Modify => {
                let Some(mut workflow) = self.store.get_workflow(workflow_id).await? else {
                    return Ok(());
                };
                if workflow.is_terminal() {
                    return Ok(());
                }
                for step_number in &impact.affected_steps {
                    if let Some(step) = workflow.step_by_number_mut(*step_number) {
                        step.status = StepStatus::Pending;
                        step.result = None;
                    }
                }
                workflow.touch();
                self.store.put_workflow(&workflow).await?;
                tracing::info!(
                    workflow_id,
                    steps = ?impact.affected_steps,
                    "workflow steps reset by interruption"
                );
            }
            ImpactType::Branch | ImpactType::PriorityChange => {
                // No immediate state transition; the driver picks these up
                tracing::debug!(workflow_id, impact = ?impact.impact_type, "deferred impact");
            }
            ImpactType::None => {}
        }
        Ok(())
    }

    async fn first_active_workflow(&self, session_id: &str) -> Option<WorkflowState> {
        match self.store.active_workflows(session_id).await {
            Ok(workflows) => workflows.into_iter().next(),
            Err(e) => {
                tracing::warn!(session_id, "active workflow lookup failed: {}", e);
                None
            }
        }
    }

    fn workflow_snapshot(workflow: &WorkflowState) -> String {
        let current = workflow
            .step_by_number(workflow.current_step)
            .map(|s| s.description.as_str())
            .unwrap_or("(between steps)");
        format!(
            "request: {}\nprogress: {}\ncurrent step: {}",
            workflow.context.original_request,
            workflow.progress_summary(),
            current
        )
    }

    /// The well-formed fallback analysis used whenever classification fails
    fn fallback_analysis(&self, user_input: &str, intent_type: IntentType) -> ContextAnalysis {
        ContextAnalysis {
            user_intent: user_input.to_string(),
            intent_type,
            confidence: FALLBACK_CONFIDENCE,
            workflow_impact: WorkflowImpact::none(),
            suggested_action: SuggestedAction {
                action: SuggestedActionKind::RespondDirectly,
                reasoning: "classification unavailable; responding conservatively".to_string(),
                parameters: serde_json::json!({}),
                estimated_time: None,
                success_probability: 0.5,
            },
            contextual_response: Self::generic_acknowledgement().to_string(),
            extracted_entities: HashMap::new(),
            urgency: Level::Medium,
        }
    }

    fn generic_acknowledgement() -> &'static str {
        "Got it - let me look into that for you."
    }
}
