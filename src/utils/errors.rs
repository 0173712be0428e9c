//! Error types used throughout the application

use thiserror::Error;

/// Main error type for the maestro orchestration core
#[derive(Error, Debug)]
pub enum MaestroError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("LLM provider error: {0}")]
    Llm(#[from] crate::llm::LlmError),

    #[error("Planning error: {message}")]
    Planning { message: String },

    #[error("Planning response invalid: {message}")]
    PlanningResponseInvalid { message: String },

    #[error("Workflow error: {workflow_id}: {message}")]
    Workflow { workflow_id: String, message: String },

    #[error("Service error: {service}: {message}")]
    Service { service: String, message: String },

    #[error("Circular service dependency: {path}")]
    DependencyCycle { path: String },

    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Resource already exists: {resource}")]
    AlreadyExists { resource: String },

    #[error("Timeout error: operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialization/deserialization error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown error: {message}")]
    Unknown { message: String },
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing configuration key: {key}")]
    MissingKey { key: String },

    #[error("Invalid configuration value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Configuration file not found: {path}")]
    FileNotFound { path: std::path::PathBuf },

    #[error("Failed to read configuration: {source}")]
    ReadError {
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write configuration: {source}")]
    WriteError {
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {source}")]
    ParseError {
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize configuration: {source}")]
    SerializeError {
        #[source]
        source: toml::ser::Error,
    },
}

impl MaestroError {
    /// Add context to an existing error
    pub fn with_context<S: Into<String>>(mut self, context: S) -> Self {
        match &mut self {
            Self::Planning { message }
            | Self::PlanningResponseInvalid { message }
            | Self::Unknown { message } => {
                *message = format!("{}: {}", context.into(), message);
            }
            Self::Workflow { message, .. }
            | Self::Service { message, .. }
            | Self::Validation { message, .. } => {
                *message = format!("{}: {}", context.into(), message);
            }
            Self::NotFound { resource } | Self::AlreadyExists { resource } => {
                *resource = format!("{}: {}", context.into(), resource);
            }
            Self::Cancelled { operation } => {
                *operation = format!("{}: {}", context.into(), operation);
            }
            _ => {
                let original = format!("{}", self);
                return Self::unknown(format!("{}: {}", context.into(), original));
            }
        }
        self
    }

    /// Create a new planning error
    pub fn planning<S: Into<String>>(message: S) -> Self {
        Self::Planning {
            message: message.into(),
        }
    }

    /// Create a new invalid-planning-response error
    pub fn planning_response_invalid<S: Into<String>>(message: S) -> Self {
        Self::PlanningResponseInvalid {
            message: message.into(),
        }
    }

    /// Create a new workflow error
    pub fn workflow<S1: Into<String>, S2: Into<String>>(workflow_id: S1, message: S2) -> Self {
        Self::Workflow {
            workflow_id: workflow_id.into(),
            message: message.into(),
        }
    }

    /// Create a new service error
    pub fn service<S1: Into<String>, S2: Into<String>>(service: S1, message: S2) -> Self {
        Self::Service {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Create a new circular-dependency error from the cycle path
    pub fn dependency_cycle<S: Into<String>>(path: S) -> Self {
        Self::DependencyCycle { path: path.into() }
    }

    /// Create a new validation error
    pub fn validation<S1: Into<String>, S2: Into<String>>(field: S1, message: S2) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new not found error
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a new already exists error
    pub fn already_exists<S: Into<String>>(resource: S) -> Self {
        Self::AlreadyExists {
            resource: resource.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Create a new cancelled error
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a new unknown error
    pub fn unknown<S: Into<String>>(message: S) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Llm(_) => true,
            Self::Config(_) | Self::DependencyCycle { .. } => false,
            Self::Validation { .. } | Self::PlanningResponseInvalid { .. } => false,
            Self::Cancelled { .. } => false,
            _ => true,
        }
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Llm(_) => "llm",
            Self::Planning { .. } => "planning",
            Self::PlanningResponseInvalid { .. } => "planning_response_invalid",
            Self::Workflow { .. } => "workflow",
            Self::Service { .. } => "service",
            Self::DependencyCycle { .. } => "dependency_cycle",
            Self::Validation { .. } => "validation",
            Self::NotFound { .. } => "notfound",
            Self::AlreadyExists { .. } => "exists",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Json(_) => "json",
            Self::Toml(_) => "toml",
            Self::Io(_) => "io",
            Self::Unknown { .. } => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_context_prepends_message() {
        let err = MaestroError::planning("no next step").with_context("workflow wf-1");
        assert_eq!(err.to_string(), "Planning error: workflow wf-1: no next step");
    }

    #[test]
    fn test_categories_are_stable() {
        assert_eq!(MaestroError::planning("x").category(), "planning");
        assert_eq!(
            MaestroError::planning_response_invalid("x").category(),
            "planning_response_invalid"
        );
        assert_eq!(MaestroError::dependency_cycle("a -> b -> a").category(), "dependency_cycle");
    }

    #[test]
    fn test_recoverability() {
        assert!(!MaestroError::dependency_cycle("a -> a").is_recoverable());
        assert!(!MaestroError::validation("confidence", "out of range").is_recoverable());
        assert!(MaestroError::timeout(30_000).is_recoverable());
    }
}
