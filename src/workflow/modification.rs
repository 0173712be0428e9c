//! Plan mutation engine: LLM-proposed structured edits to a live plan
//!
//! Proposals come back from the model as loosely-shaped JSON; nothing is
//! trusted until it passes the clamp/validate pass, and every mutation is
//! all-or-nothing against the persisted plan.

use super::state::{StepStatus, ToolCall, WorkflowState, WorkflowStep};
use super::store::{WorkflowLocks, WorkflowStore};
use crate::llm::util::truncate_preview;
use crate::llm::{GenerationConfig, LlmClient, PromptContext, PromptTemplate, PromptTemplates};
use crate::utils::errors::MaestroError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Upper bound on proposals accepted from one analysis call
const MAX_PROPOSALS: usize = 3;

/// The eight supported plan edits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationKind {
    AddStep,
    RemoveStep,
    ModifyStep,
    ReorderSteps,
    SkipStep,
    ReplacePlan,
    MergeSteps,
    SplitStep,
}

impl ModificationKind {
    /// Parse the wire name; unknown kinds are rejected, not defaulted
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "add_step" => Some(Self::AddStep),
            "remove_step" => Some(Self::RemoveStep),
            "modify_step" => Some(Self::ModifyStep),
            "reorder_steps" => Some(Self::ReorderSteps),
            "skip_step" => Some(Self::SkipStep),
            "replace_plan" => Some(Self::ReplacePlan),
            "merge_steps" => Some(Self::MergeSteps),
            "split_step" => Some(Self::SplitStep),
            _ => None,
        }
    }
}

/// Proposal priority; unrecognized wire values default to `Medium`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl ModificationPriority {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("low") => Self::Low,
            Some("high") => Self::High,
            Some("critical") => Self::Critical,
            _ => Self::Medium,
        }
    }
}

/// Risk assessment; unrecognized wire values default to `Medium`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("low") => Self::Low,
            Some("high") => Self::High,
            _ => Self::Medium,
        }
    }
}

/// Predicted effect of applying a proposal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatedImpact {
    /// Predicted change in completion time (seconds; negative is faster)
    pub time_change: f64,
    /// 0..1 probability the modified plan succeeds
    pub success_probability: f64,
    pub risk_level: RiskLevel,
}

/// Shallow patch merged into an existing step by `modify_step`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepPatch {
    pub description: Option<String>,
    pub tool_name: Option<String>,
    pub parameters: Option<serde_json::Value>,
    pub max_retries: Option<u32>,
}

/// Typed payload for each modification kind, validated field-by-field
#[derive(Debug, Clone)]
pub enum ModificationChanges {
    AddStep {
        new_steps: Vec<WorkflowStep>,
        /// 1-based insertion position; `None` inserts at the current step
        step_number: Option<usize>,
    },
    RemoveStep {
        steps_to_remove: Vec<usize>,
    },
    ModifyStep {
        step_number: usize,
        modifications: StepPatch,
    },
    ReorderSteps {
        new_order: Vec<usize>,
    },
    SkipStep {
        step_number: usize,
    },
    ReplacePlan {
        replacement_plan: Vec<WorkflowStep>,
    },
    MergeSteps {
        merge_pairs: Vec<(usize, usize)>,
    },
    SplitStep {
        step_number: usize,
        replacement_steps: Vec<WorkflowStep>,
    },
}

/// One clamped, ranked plan-edit proposal
///
/// `changes` keeps the raw payload; [`PlanModification::typed_changes`] is
/// the field-by-field validation gate every apply goes through. A proposal
/// whose payload fails that gate applies as `false`, never partially.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanModification {
    pub kind: ModificationKind,
    pub changes: serde_json::Value,
    pub reasoning: Option<String>,
    /// Clamped to [0, 1]
    pub confidence: f64,
    pub priority: ModificationPriority,
    pub estimated_impact: EstimatedImpact,
}

impl PlanModification {
    /// Parse and clamp one raw proposal; `None` for unrecognized kinds
    pub fn from_value(raw: &serde_json::Value) -> Option<Self> {
        let kind = raw.get("type").and_then(|v| v.as_str()).and_then(ModificationKind::parse)?;

        let changes = raw.get("changes").cloned().unwrap_or_else(|| serde_json::json!({}));
        let confidence = raw
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        let priority = ModificationPriority::parse(raw.get("priority").and_then(|v| v.as_str()));

        let impact = raw.get("estimatedImpact");
        let estimated_impact = EstimatedImpact {
            time_change: impact
                .and_then(|i| i.get("timeChange"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0),
            success_probability: impact
                .and_then(|i| i.get("successProbability"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5)
                .clamp(0.0, 1.0),
            risk_level: RiskLevel::parse(
                impact
                    .and_then(|i| i.get("riskLevel"))
                    .and_then(|v| v.as_str()),
            ),
        };

        Some(Self {
            kind,
            changes,
            reasoning: raw.get("reasoning").and_then(|v| v.as_str()).map(String::from),
            confidence,
            priority,
            estimated_impact,
        })
    }

    /// Validate the raw payload into its typed form
    ///
    /// Returns `None` when a required field is missing or ill-typed; the
    /// caller treats that as a failed (not-applied) modification.
    pub fn typed_changes(&self, default_max_retries: u32) -> Option<ModificationChanges> {
        let changes = &self.changes;
        match self.kind {
            ModificationKind::AddStep => {
                let new_steps = parse_step_specs(changes.get("newSteps")?, default_max_retries)?;
                if new_steps.is_empty() {
                    return None;
                }
                let step_number = changes
                    .get("stepNumber")
                    .and_then(|v| v.as_u64())
                    .map(|n| n as usize);
                Some(ModificationChanges::AddStep {
                    new_steps,
                    step_number,
                })
            }
            ModificationKind::RemoveStep => {
                let steps_to_remove = parse_step_numbers(changes.get("stepsToRemove")?)?;
                if steps_to_remove.is_empty() {
                    return None;
                }
                Some(ModificationChanges::RemoveStep { steps_to_remove })
            }
            ModificationKind::ModifyStep => {
                let step_number = changes.get("stepNumber").and_then(|v| v.as_u64())? as usize;
                let raw_patch = changes.get("modifications")?;
                let modifications = StepPatch {
                    description: raw_patch
                        .get("description")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    tool_name: raw_patch
                        .get("toolName")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    parameters: raw_patch.get("parameters").cloned(),
                    max_retries: raw_patch
                        .get("maxRetries")
                        .and_then(|v| v.as_u64())
                        .map(|n| n as u32),
                };
                Some(ModificationChanges::ModifyStep {
                    step_number,
                    modifications,
                })
            }
            ModificationKind::ReorderSteps => {
                let new_order = parse_step_numbers(changes.get("newOrder")?)?;
                if new_order.is_empty() {
                    return None;
                }
                Some(ModificationChanges::ReorderSteps { new_order })
            }
            ModificationKind::SkipStep => {
                let step_number = changes.get("stepNumber").and_then(|v| v.as_u64())? as usize;
                Some(ModificationChanges::SkipStep { step_number })
            }
            ModificationKind::ReplacePlan => {
                let replacement_plan =
                    parse_step_specs(changes.get("replacementPlan")?, default_max_retries)?;
                if replacement_plan.is_empty() {
                    return None;
                }
                Some(ModificationChanges::ReplacePlan { replacement_plan })
            }
            ModificationKind::MergeSteps => {
                let raw_pairs = changes.get("mergePairs")?.as_array()?;
                let mut merge_pairs = Vec::with_capacity(raw_pairs.len());
                for pair in raw_pairs {
                    let pair = pair.as_array()?;
                    if pair.len() != 2 {
                        return None;
                    }
                    let a = pair[0].as_u64()? as usize;
                    let b = pair[1].as_u64()? as usize;
                    merge_pairs.push((a, b));
                }
                if merge_pairs.is_empty() {
                    return None;
                }
                Some(ModificationChanges::MergeSteps { merge_pairs })
            }
            ModificationKind::SplitStep => {
                let details = changes.get("splitDetails")?;
                let step_number = details.get("stepNumber").and_then(|v| v.as_u64())? as usize;
                let replacement_steps =
                    parse_step_specs(details.get("replacementSteps")?, default_max_retries)?;
                if replacement_steps.len() < 2 {
                    return None;
                }
                Some(ModificationChanges::SplitStep {
                    step_number,
                    replacement_steps,
                })
            }
        }
    }
}

/// Parse `[{"description", "toolName", "parameters"}]` into pending steps
fn parse_step_specs(raw: &serde_json::Value, default_max_retries: u32) -> Option<Vec<WorkflowStep>> {
    let specs = raw.as_array()?;
    let mut steps = Vec::with_capacity(specs.len());
    for spec in specs {
        let description = spec.get("description").and_then(|v| v.as_str())?;
        if description.trim().is_empty() {
            return None;
        }
        let tool_name = spec
            .get("toolName")
            .and_then(|v| v.as_str())
            .unwrap_or("dispatch");
        let parameters = spec
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        steps.push(WorkflowStep::new(
            description,
            ToolCall::new(tool_name, parameters),
            default_max_retries,
        ));
    }
    Some(steps)
}

fn parse_step_numbers(raw: &serde_json::Value) -> Option<Vec<usize>> {
    raw.as_array()?
        .iter()
        .map(|v| v.as_u64().map(|n| n as usize))
        .collect()
}

/// Applies LLM-proposed structured edits to persisted workflow plans
pub struct PlanModificationEngine {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn WorkflowStore>,
    locks: WorkflowLocks,
    default_max_retries: u32,
    result_preview_chars: usize,
}

impl PlanModificationEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn WorkflowStore>,
        locks: WorkflowLocks,
        default_max_retries: u32,
        result_preview_chars: usize,
    ) -> Self {
        Self {
            llm,
            store,
            locks,
            default_max_retries,
            result_preview_chars,
        }
    }

    /// Telemetry-driven review of the remaining plan
    ///
    /// `analysis_context` carries the caller's extra observations (e.g. a
    /// failure streak) verbatim into the prompt.
    pub async fn analyze_plan(
        &self,
        workflow_id: &str,
        analysis_context: &str,
    ) -> Result<Vec<PlanModification>> {
        let workflow = self.require_workflow(workflow_id).await?;
        let telemetry = format!(
            "{}\n\nCaller notes: {}",
            self.render_telemetry(&workflow),
            if analysis_context.is_empty() {
                "(none)"
            } else {
                analysis_context
            }
        );

        let prompt_context = PromptContext::new()
            .with_variable("original_request", &workflow.context.original_request)
            .with_variable("telemetry", telemetry)
            .with_variable("remaining_plan", render_plan(&workflow));

        self.propose(PromptTemplates::plan_analysis(), prompt_context)
            .await
    }

    /// Recovery proposals after a failed step
    pub async fn failure_recovery_modifications(
        &self,
        workflow_id: &str,
        failed_step_number: usize,
        error: &str,
        retry_count: u32,
    ) -> Result<Vec<PlanModification>> {
        let workflow = self.require_workflow(workflow_id).await?;
        let (description, max_retries) = workflow
            .step_by_number(failed_step_number)
            .map(|s| (s.description.clone(), s.max_retries))
            .unwrap_or_else(|| ("(step no longer in plan)".to_string(), 0));

        let prompt_context = PromptContext::new()
            .with_variable("original_request", &workflow.context.original_request)
            .with_variable("failed_step", failed_step_number.to_string())
            .with_variable("step_description", description)
            .with_variable("error", error)
            .with_variable("retry_count", retry_count.to_string())
            .with_variable("max_retries", max_retries.to_string())
            .with_variable("remaining_plan", render_plan(&workflow));

        self.propose(PromptTemplates::failure_recovery(), prompt_context)
            .await
    }

    /// Efficiency review of a healthy plan
    pub async fn optimize_plan(&self, workflow_id: &str) -> Result<Vec<PlanModification>> {
        let workflow = self.require_workflow(workflow_id).await?;

        let completed = workflow
            .completed_history()
            .iter()
            .map(|(step, result)| {
                format!("- {} -> {}", step, truncate_preview(result, self.result_preview_chars))
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt_context = PromptContext::new()
            .with_variable("original_request", &workflow.context.original_request)
            .with_variable(
                "completed_steps",
                if completed.is_empty() {
                    "(none yet)".to_string()
                } else {
                    completed
                },
            )
            .with_variable("remaining_plan", render_plan(&workflow));

        self.propose(PromptTemplates::plan_optimization(), prompt_context)
            .await
    }

    /// Apply one proposal to the persisted plan
    ///
    /// Returns `Ok(false)` without mutating anything when the workflow is
    /// missing or terminal, or when the payload fails validation.
    pub async fn apply_modification(
        &self,
        workflow_id: &str,
        modification: &PlanModification,
    ) -> Result<bool> {
        let _guard = self.locks.acquire(workflow_id).await;

        let Some(mut workflow) = self.store.get_workflow(workflow_id).await? else {
            tracing::warn!(workflow_id, "cannot modify: workflow not found");
            return Ok(false);
        };
        if workflow.is_terminal() {
            tracing::warn!(
                workflow_id,
                status = ?workflow.status,
                "cannot modify: plan is frozen by terminal status"
            );
            return Ok(false);
        }

        let Some(changes) = modification.typed_changes(self.default_max_retries) else {
            tracing::warn!(
                workflow_id,
                kind = ?modification.kind,
                "modification payload failed validation; not applied"
            );
            return Ok(false);
        };

        let applied = match changes {
            ModificationChanges::AddStep {
                new_steps,
                step_number,
            } => Self::apply_add_step(&mut workflow, new_steps, step_number),
            ModificationChanges::RemoveStep { steps_to_remove } => {
                Self::apply_remove_step(&mut workflow, &steps_to_remove)
            }
            ModificationChanges::ModifyStep {
                step_number,
                modifications,
            } => Self::apply_modify_step(&mut workflow, step_number, modifications),
            ModificationChanges::ReorderSteps { new_order } => {
                Self::apply_reorder_steps(&mut workflow, &new_order)
            }
            ModificationChanges::SkipStep { step_number } => {
                Self::apply_skip_step(&mut workflow, step_number)
            }
            ModificationChanges::ReplacePlan { replacement_plan } => {
                Self::apply_replace_plan(&mut workflow, replacement_plan)
            }
            ModificationChanges::MergeSteps { merge_pairs } => {
                Self::apply_merge_steps(&mut workflow, &merge_pairs)
            }
            ModificationChanges::SplitStep {
                step_number,
                replacement_steps,
            } => Self::apply_split_step(&mut workflow, step_number, replacement_steps),
        };

        if !applied {
            return Ok(false);
        }

        workflow.renumber();
        self.store.put_workflow(&workflow).await?;
        tracing::info!(
            workflow_id,
            kind = ?modification.kind,
            total_steps = workflow.total_steps,
            "plan modification applied"
        );
        Ok(true)
    }

    /// Apply a batch, continuing past individual failures
    pub async fn apply_modifications(
        &self,
        workflow_id: &str,
        modifications: &[PlanModification],
    ) -> Result<usize> {
        let mut applied = 0;
        for modification in modifications {
            match self.apply_modification(workflow_id, modification).await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        workflow_id,
                        kind = ?modification.kind,
                        "modification errored: {}",
                        e
                    );
                }
            }
        }
        Ok(applied)
    }

    async fn require_workflow(&self, workflow_id: &str) -> Result<WorkflowState> {
        self.store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| MaestroError::not_found(format!("workflow {}", workflow_id)))
    }

    async fn propose(
        &self,
        template: PromptTemplate,
        prompt_context: PromptContext,
    ) -> Result<Vec<PlanModification>> {
        let (system, user) = template.fill(&prompt_context).map_err(MaestroError::planning)?;

        let schema = serde_json::json!({
            "type": "array",
            "maxItems": MAX_PROPOSALS,
            "items": {
                "type": "object",
                "properties": {
                    "type": {"type": "string"},
                    "changes": {"type": "object"},
                    "reasoning": {"type": "string"},
                    "confidence": {"type": "number"},
                    "priority": {"type": "string"},
                    "estimatedImpact": {"type": "object"}
                },
                "required": ["type"]
            }
        });

        let raw = self
            .llm
            .generate_structured(&user, &system, &schema, &GenerationConfig::deterministic(1024))
            .await?;

        // Tolerate a bare object or an object wrapping the array
        let proposals = match &raw {
            serde_json::Value::Array(items) => items.clone(),
            serde_json::Value::Object(map) => map
                .get("modifications")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_else(|| vec![raw.clone()]),
            _ => Vec::new(),
        };

        let mut modifications: Vec<PlanModification> = proposals
            .iter()
            .filter_map(PlanModification::from_value)
            .take(MAX_PROPOSALS)
            .collect();
        modifications.sort_by(|a, b| b.priority.cmp(&a.priority));

        tracing::debug!("parsed {} plan modification proposals", modifications.len());
        Ok(modifications)
    }

    fn render_telemetry(&self, workflow: &WorkflowState) -> String {
        if workflow.plan.is_empty() {
            return "(no steps executed yet)".to_string();
        }
        workflow
            .plan
            .iter()
            .map(|step| {
                let outcome = match step.status {
                    StepStatus::Completed => "ok",
                    StepStatus::Failed => "FAILED",
                    StepStatus::Skipped => "skipped",
                    StepStatus::InProgress => "running",
                    StepStatus::Pending => "pending",
                };
                format!(
                    "step {} [{}] {} ({}ms, {} retries){}",
                    step.step_number,
                    outcome,
                    step.description,
                    step.duration_ms.unwrap_or(0),
                    step.retry_count,
                    step.result
                        .as_deref()
                        .map(|r| format!(" -> {}", truncate_preview(r, self.result_preview_chars)))
                        .unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    // --- mutation algorithms; each returns false without touching state when
    // --- its precondition fails

    fn apply_add_step(
        workflow: &mut WorkflowState,
        new_steps: Vec<WorkflowStep>,
        step_number: Option<usize>,
    ) -> bool {
        let position = step_number.unwrap_or(workflow.current_step);
        let index = position.saturating_sub(1).min(workflow.plan.len());
        for (offset, step) in new_steps.into_iter().enumerate() {
            workflow.plan.insert(index + offset, step);
        }
        true
    }

    fn apply_remove_step(workflow: &mut WorkflowState, steps_to_remove: &[usize]) -> bool {
        let before = workflow.plan.len();
        workflow
            .plan
            .retain(|step| !steps_to_remove.contains(&step.step_number));
        workflow.plan.len() < before
    }

    fn apply_modify_step(
        workflow: &mut WorkflowState,
        step_number: usize,
        patch: StepPatch,
    ) -> bool {
        let Some(step) = workflow.step_by_number_mut(step_number) else {
            return false;
        };
        if let Some(description) = patch.description {
            step.description = description;
        }
        if let Some(tool_name) = patch.tool_name {
            step.tool_call.name = tool_name;
        }
        if let Some(parameters) = patch.parameters {
            step.tool_call.parameters = parameters;
        }
        if let Some(max_retries) = patch.max_retries {
            step.max_retries = max_retries;
        }
        true
    }

    /// Reorder the whole plan; `new_order` must be a permutation of every
    /// current step number, otherwise the proposal is rejected outright
    fn apply_reorder_steps(workflow: &mut WorkflowState, new_order: &[usize]) -> bool {
        let mut expected: Vec<usize> = workflow.plan.iter().map(|s| s.step_number).collect();
        let mut provided = new_order.to_vec();
        expected.sort_unstable();
        provided.sort_unstable();
        if expected != provided {
            tracing::warn!(
                "reorder rejected: new order {:?} is not a permutation of current steps",
                new_order
            );
            return false;
        }

        let mut reordered = Vec::with_capacity(workflow.plan.len());
        for number in new_order {
            let index = workflow
                .plan
                .iter()
                .position(|s| s.step_number == *number)
                .expect("permutation check guarantees presence");
            reordered.push(workflow.plan[index].clone());
        }
        workflow.plan = reordered;
        true
    }

    fn apply_skip_step(workflow: &mut WorkflowState, step_number: usize) -> bool {
        let Some(step) = workflow.step_by_number_mut(step_number) else {
            return false;
        };
        step.status = StepStatus::Skipped;
        true
    }

    fn apply_replace_plan(
        workflow: &mut WorkflowState,
        replacement_plan: Vec<WorkflowStep>,
    ) -> bool {
        workflow.plan = replacement_plan;
        true
    }

    /// Merge each (a, b) pair into a single step at a's position
    fn apply_merge_steps(workflow: &mut WorkflowState, merge_pairs: &[(usize, usize)]) -> bool {
        // Validate everything before mutating: members must exist and no
        // step may appear in two pairs
        let mut seen = std::collections::HashSet::new();
        for (a, b) in merge_pairs {
            if a == b
                || workflow.step_by_number(*a).is_none()
                || workflow.step_by_number(*b).is_none()
                || !seen.insert(*a)
                || !seen.insert(*b)
            {
                return false;
            }
        }

        for (a, b) in merge_pairs {
            let absorbed_index = workflow
                .plan
                .iter()
                .position(|s| s.step_number == *b)
                .expect("validated above");
            let absorbed = workflow.plan.remove(absorbed_index);
            let target = workflow
                .step_by_number_mut(*a)
                .expect("validated above");
            target.description = format!("{}; then {}", target.description, absorbed.description);
            target.max_retries = target.max_retries.max(absorbed.max_retries);
        }
        true
    }

    /// Replace one step with an ordered expansion at the same position
    fn apply_split_step(
        workflow: &mut WorkflowState,
        step_number: usize,
        replacement_steps: Vec<WorkflowStep>,
    ) -> bool {
        let Some(index) = workflow.plan.iter().position(|s| s.step_number == step_number) else {
            return false;
        };
        workflow.plan.remove(index);
        for (offset, step) in replacement_steps.into_iter().enumerate() {
            workflow.plan.insert(index + offset, step);
        }
        true
    }
}

fn render_plan(workflow: &WorkflowState) -> String {
    let remaining = workflow.remaining_steps();
    if remaining.is_empty() {
        return "(no remaining steps)".to_string();
    }
    remaining
        .iter()
        .map(|step| format!("{}. {} (tool: {})", step.step_number, step.description, step.tool_call.name))
        .collect::<Vec<_>>()
        .join("\n")
}
