//! LLM collaborator abstraction and implementations
//!
//! The orchestration core only ever talks to a language model through the
//! narrow [`LlmClient`] contract: plain text generation and schema-guided
//! structured generation. Everything above this layer treats a malformed
//! model response as the collaborator's fault and applies its own
//! validation, never assuming well-formedness.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod openai;
pub mod prompts;
pub mod util;

#[cfg(test)]
pub mod mock;

pub use prompts::{PromptContext, PromptTemplate, PromptTemplates};

/// Error types for LLM operations
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Rate limit exceeded: {retry_after:?}")]
    RateLimit { retry_after: Option<u64> },

    #[error("Invalid model: {model}")]
    InvalidModel { model: String },

    #[error("Request failed: {status}: {message}")]
    RequestFailed { status: u16, message: String },

    #[error("Invalid response format: {message}")]
    InvalidResponse { message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {message}")]
    Unknown { message: String },
}

impl LlmError {
    /// Whether a retry has any chance of succeeding
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit { .. }
                | Self::Network(_)
                | Self::RequestFailed { status: 500..=599, .. }
        )
    }
}

/// Configuration for LLM generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub stop_sequences: Option<Vec<String>>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: Some(0.7),
            max_tokens: Some(2048),
            top_p: Some(0.9),
            stop_sequences: None,
        }
    }
}

impl GenerationConfig {
    /// Near-deterministic settings for planning and classification calls
    pub fn deterministic(max_tokens: u32) -> Self {
        Self {
            temperature: Some(0.1),
            max_tokens: Some(max_tokens),
            top_p: Some(1.0),
            stop_sequences: None,
        }
    }
}

/// Token usage information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The LLM collaborator contract used by every orchestration component
///
/// Implementations abstract away provider-specific details (wire format,
/// authentication, retries). `generate_structured` must return parseable
/// JSON when a schema is requested; callers still validate field-by-field.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Get the provider name (e.g., "openai")
    fn provider_name(&self) -> &str;

    /// Generate free-form text from a prompt and system prompt
    async fn generate_text(
        &self,
        prompt: &str,
        system_prompt: &str,
        config: &GenerationConfig,
    ) -> Result<String, LlmError>;

    /// Generate a JSON value shaped by the given schema description
    ///
    /// The schema is advisory — providers pass it to the model as guidance.
    /// Callers must treat the returned value as untrusted and validate it.
    async fn generate_structured(
        &self,
        prompt: &str,
        system_prompt: &str,
        schema: &serde_json::Value,
        config: &GenerationConfig,
    ) -> Result<serde_json::Value, LlmError>;
}
