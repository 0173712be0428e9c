//! Maestro - workflow orchestration core for an LLM-driven conversational assistant
//!
//! This library provides the orchestration machinery that turns a user's
//! natural-language request into a multi-step workflow: step-by-step planning,
//! dispatch to domain sub-agents, result analysis with loop detection, dynamic
//! plan mutation, and mid-flight interruption handling. A dependency-ordered
//! service lifecycle system bootstraps and tears down the collaborators.

pub mod config;
pub mod llm;
pub mod services;
pub mod utils;
pub mod workflow;

// Re-export commonly used types and traits
pub use config::{LlmConfig, MaestroConfig, OrchestrationConfig, ServicesConfig};
pub use llm::{GenerationConfig, LlmClient, LlmError};
pub use services::{DependencyInjector, Service, ServiceHealth, ServiceRegistry, ServiceState};
pub use utils::errors::{ConfigError, MaestroError};
pub use utils::retry::RetryPolicy;
pub use workflow::{
    AgentDispatcher, ContextAnalysis, InterruptionHandler, PlanModification,
    PlanModificationEngine, StepPlanner, StepResultAnalyzer, ToolCall, WorkflowDriver,
    WorkflowState, WorkflowStatus, WorkflowStep, WorkflowStore,
};

/// The main result type used throughout the application
pub type Result<T> = std::result::Result<T, MaestroError>;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "maestro";
