//! Persisted workflow state: the plan, its steps, and their invariants

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a whole workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl WorkflowStatus {
    /// Terminal statuses freeze the plan permanently
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Execution status of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// The sub-agent invocation a step dispatches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub parameters: serde_json::Value,
}

impl ToolCall {
    pub fn new<S: Into<String>>(name: S, parameters: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            parameters,
        }
    }
}

/// One unit of planned work
///
/// Steps are owned exclusively by their workflow's `plan` vector and are
/// addressed by `step_number`, which must be re-resolved after any mutation
/// since positions shift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step_id: String,
    /// 1-based position in the plan; dense after every mutation
    pub step_number: usize,
    pub description: String,
    pub tool_call: ToolCall,
    pub status: StepStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Textual result captured after dispatch
    pub result: Option<String>,
    /// Wall-clock execution time captured after dispatch
    pub duration_ms: Option<u64>,
}

impl WorkflowStep {
    /// Create a pending step; `step_number` is assigned by `renumber`
    pub fn new<S: Into<String>>(description: S, tool_call: ToolCall, max_retries: u32) -> Self {
        Self {
            step_id: Uuid::new_v4().to_string(),
            step_number: 0,
            description: description.into(),
            tool_call,
            status: StepStatus::Pending,
            retry_count: 0,
            max_retries,
            result: None,
            duration_ms: None,
        }
    }

    /// Whether the step may be retried after a failure
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Immutable request context captured at workflow creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub original_request: String,
}

/// The unit of persisted orchestration state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub session_id: String,
    pub status: WorkflowStatus,
    pub context: WorkflowContext,
    pub plan: Vec<WorkflowStep>,
    /// 1-based index of conceptual progress through the plan
    pub current_step: usize,
    /// Always equals `plan.len()`; recomputed on every mutation
    pub total_steps: usize,
    pub created_at: DateTime<Utc>,
    /// Updated on any mutation; drives external expiry/cleanup
    pub last_activity: DateTime<Utc>,
}

impl WorkflowState {
    /// Create a fresh active workflow for a session's request
    pub fn new<S1: Into<String>, S2: Into<String>>(session_id: S1, original_request: S2) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            status: WorkflowStatus::Active,
            context: WorkflowContext {
                original_request: original_request.into(),
            },
            plan: Vec::new(),
            current_step: 1,
            total_steps: 0,
            created_at: now,
            last_activity: now,
        }
    }

    /// Whether the workflow has reached a terminal status
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Restore the plan invariants after any mutation
    ///
    /// Invariant: `plan[i].step_number == i + 1` for all i, `total_steps`
    /// equals the plan length, and `last_activity` reflects the mutation.
    pub fn renumber(&mut self) {
        for (index, step) in self.plan.iter_mut().enumerate() {
            step.step_number = index + 1;
        }
        self.total_steps = self.plan.len();
        self.touch();
    }

    /// Refresh the activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Find a step by its current step number
    pub fn step_by_number(&self, step_number: usize) -> Option<&WorkflowStep> {
        self.plan.iter().find(|s| s.step_number == step_number)
    }

    /// Find a step mutably by its current step number
    pub fn step_by_number_mut(&mut self, step_number: usize) -> Option<&mut WorkflowStep> {
        self.plan.iter_mut().find(|s| s.step_number == step_number)
    }

    /// Steps not yet executed or skipped
    pub fn remaining_steps(&self) -> Vec<&WorkflowStep> {
        self.plan
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Pending | StepStatus::InProgress))
            .collect()
    }

    /// Completed (step description, result) pairs in plan order
    pub fn completed_history(&self) -> Vec<(&str, &str)> {
        self.plan
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Completed | StepStatus::Failed))
            .map(|s| {
                (
                    s.description.as_str(),
                    s.result.as_deref().unwrap_or("(no result recorded)"),
                )
            })
            .collect()
    }

    /// One-line progress summary for prompts and logs
    pub fn progress_summary(&self) -> String {
        format!(
            "step {}/{} ({:?})",
            self.current_step.min(self.total_steps.max(1)),
            self.total_steps,
            self.status
        )
    }
}
