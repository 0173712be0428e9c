//! Workflow orchestration: state, planning, analysis, mutation, interruption

pub mod analyzer;
pub mod driver;
pub mod interruption;
pub mod modification;
pub mod planner;
pub mod state;
pub mod store;

pub use analyzer::{StepAnalysis, StepResultAnalyzer};
pub use driver::{AgentDispatcher, DispatchOutcome, WorkflowDriver, WorkflowOutcome};
pub use interruption::{
    ChangeType, ContextAnalysis, ContextChangeDetection, ConversationTurn, ImpactType,
    IntentType, InterruptionHandler, Level, SuggestedAction, SuggestedActionKind, WorkflowImpact,
};
pub use modification::{
    EstimatedImpact, ModificationChanges, ModificationKind, ModificationPriority,
    PlanModification, PlanModificationEngine, RiskLevel, StepPatch,
};
pub use planner::{PlannedStep, PlanningContext, StepPlanner};
pub use state::{
    StepStatus, ToolCall, WorkflowContext, WorkflowState, WorkflowStatus, WorkflowStep,
};
pub use store::{InMemoryWorkflowStore, WorkflowLocks, WorkflowStore};
