//! Configuration management for maestro

use crate::utils::errors::ConfigError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaestroConfig {
    /// LLM collaborator settings
    pub llm: LlmConfig,
    /// Orchestration loop settings
    pub orchestration: OrchestrationConfig,
    /// Service lifecycle settings
    pub services: ServicesConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Configuration for the LLM collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name ("openai" or a compatible gateway)
    pub provider: String,
    /// Model identifier
    pub model: String,
    /// Base URL override for compatible gateways
    pub base_url: Option<String>,
    /// Environment variable holding the API key (never the key itself)
    pub api_key_env: String,
    /// Default sampling temperature
    pub temperature: f32,
    /// Default completion token bound
    pub max_tokens: u32,
}

/// Orchestration loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Hard ceiling on steps per workflow
    pub max_steps_per_workflow: usize,
    /// Per-result preview length embedded in prompts (chars)
    pub result_preview_chars: usize,
    /// Conversation turns included in classification prompts
    pub conversation_window: usize,
    /// Minimum confidence for a plan modification to be applied by the driver
    pub modification_confidence_threshold: f64,
    /// Default per-step retry allowance
    pub default_max_retries: u32,
}

/// Deployment environment, gating graceful degradation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Production,
}

/// Service lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Deployment environment
    pub environment: Environment,
    /// Services allowed to fail initialization outside production
    pub optional_services: Vec<String>,
    /// Initialization retry attempts per service
    pub init_retry_attempts: usize,
    /// Base backoff delay between initialization attempts (ms)
    pub init_retry_base_delay_ms: u64,
    /// How long to wait for a concurrently-initializing service (ms)
    pub init_poll_timeout_ms: u64,
    /// Upper bound on registered services
    pub max_registered_services: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level directive (trace, debug, info, warn, error)
    pub level: String,
    /// Whether spans include timestamps
    pub include_timestamps: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.1,
            max_tokens: 1024,
        }
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_steps_per_workflow: 10,
            result_preview_chars: 500,
            conversation_window: 10,
            modification_confidence_threshold: 0.6,
            default_max_retries: 2,
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::Development
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            optional_services: vec!["database".to_string()],
            init_retry_attempts: 3,
            init_retry_base_delay_ms: 500,
            init_poll_timeout_ms: 10_000,
            max_registered_services: 64,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            include_timestamps: true,
        }
    }
}

impl MaestroConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }

        let content =
            fs::read_to_string(path).map_err(|source| ConfigError::ReadError { source })?;
        let config: Self =
            toml::from_str(&content).map_err(|source| ConfigError::ParseError { source })?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|source| ConfigError::SerializeError { source })?;
        fs::write(path.as_ref(), content).map_err(|source| ConfigError::WriteError { source })?;
        Ok(())
    }

    /// Resolve the LLM API key from the configured environment variable
    pub fn resolve_api_key(&self) -> Result<String> {
        std::env::var(&self.llm.api_key_env).map_err(|_| {
            ConfigError::MissingKey {
                key: self.llm.api_key_env.clone(),
            }
            .into()
        })
    }
}
