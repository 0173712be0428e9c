//! OpenAI-compatible chat-completions provider

use super::util::extract_json_block;
use super::{GenerationConfig, LlmClient, LlmError, TokenUsage};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// OpenAI-compatible API provider
///
/// Works against the official endpoint or any compatible gateway via
/// `with_config`. Structured calls request JSON mode and fall back to
/// extracting a fenced JSON block from the raw completion.
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    retry_attempts: usize,
    retry_delay: Duration,
}

impl OpenAiClient {
    /// Create a new provider against the default OpenAI endpoint
    pub fn new(api_key: String) -> Self {
        Self::with_config(api_key, None, None, None)
    }

    /// Create a new provider with custom endpoint, model, and retry settings
    pub fn with_config(
        api_key: String,
        base_url: Option<String>,
        model: Option<String>,
        retry_attempts: Option<usize>,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            retry_attempts: retry_attempts.unwrap_or(3),
            retry_delay: Duration::from_millis(1000),
        }
    }

    /// Execute a request with retry logic for transient failures
    async fn execute_with_retry<F, Fut, T>(&self, operation: F) -> Result<T, LlmError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, LlmError>> + Send,
    {
        let mut last_error = None;

        for attempt in 0..=self.retry_attempts {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let retryable = e.is_retryable();
                    let delay = match &e {
                        LlmError::RateLimit {
                            retry_after: Some(seconds),
                        } => Duration::from_secs(*seconds),
                        _ => self.retry_delay * (attempt as u32 + 1),
                    };
                    last_error = Some(e);

                    if !retryable || attempt >= self.retry_attempts {
                        break;
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LlmError::Unknown {
            message: "Retry operation failed with no error".to_string(),
        }))
    }

    /// Parse error response and return appropriate LlmError
    fn parse_error_response(status: u16, body: &str) -> LlmError {
        match status {
            429 => {
                let retry_after = serde_json::from_str::<serde_json::Value>(body)
                    .ok()
                    .and_then(|json| {
                        json.get("retry_after").and_then(|v| v.as_u64()).or_else(|| {
                            json.get("error")
                                .and_then(|e| e.get("retry_after"))
                                .and_then(|v| v.as_u64())
                        })
                    });
                LlmError::RateLimit { retry_after }
            }
            401 | 403 => LlmError::Authentication {
                message: "Invalid API key or insufficient permissions".to_string(),
            },
            404 if body.contains("model") => LlmError::InvalidModel {
                model: "unknown".to_string(),
            },
            _ => LlmError::RequestFailed {
                status,
                message: body.to_string(),
            },
        }
    }

    async fn chat_completion(
        &self,
        prompt: &str,
        system_prompt: &str,
        config: &GenerationConfig,
        json_mode: bool,
    ) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            top_p: config.top_p,
            stop: config.stop_sequences.clone(),
            response_format: json_mode.then(|| ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::parse_error_response(status, &body));
        }

        let body: ChatResponse = response.json().await.map_err(|e| LlmError::InvalidResponse {
            message: format!("Failed to parse completion response: {}", e),
        })?;

        if let Some(usage) = &body.usage {
            tracing::debug!(
                "chat completion used {} prompt + {} completion tokens",
                usage.prompt_tokens,
                usage.completion_tokens
            );
        }

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.map(|m| m.content))
            .filter(|content| !content.is_empty())
            .ok_or_else(|| LlmError::InvalidResponse {
                message: "Completion contained no content".to_string(),
            })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn provider_name(&self) -> &str {
        "openai"
    }

    async fn generate_text(
        &self,
        prompt: &str,
        system_prompt: &str,
        config: &GenerationConfig,
    ) -> Result<String, LlmError> {
        self.execute_with_retry(|| self.chat_completion(prompt, system_prompt, config, false))
            .await
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        system_prompt: &str,
        schema: &serde_json::Value,
        config: &GenerationConfig,
    ) -> Result<serde_json::Value, LlmError> {
        // JSON mode keeps the model on-format; the schema rides along in the
        // system prompt since chat completions take no schema parameter.
        let system = format!(
            "{}\n\nRespond with a single JSON value matching this schema:\n{}",
            system_prompt,
            serde_json::to_string_pretty(schema)?
        );

        let raw = self
            .execute_with_retry(|| self.chat_completion(prompt, &system, config, true))
            .await?;

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(value),
            Err(_) => {
                let candidate =
                    extract_json_block(&raw).ok_or_else(|| LlmError::InvalidResponse {
                        message: format!("No JSON found in completion: {}", raw),
                    })?;
                serde_json::from_str(candidate).map_err(|e| LlmError::InvalidResponse {
                    message: format!("Malformed JSON in completion: {}", e),
                })
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}
