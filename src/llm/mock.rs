//! Scriptable LLM client for tests

use super::{GenerationConfig, LlmClient, LlmError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// A canned response served by [`MockLlm`]
pub enum MockResponse {
    Text(String),
    Structured(serde_json::Value),
    Failure(String),
}

/// FIFO-scripted LLM client
///
/// Responses are consumed in order regardless of which trait method pulls
/// them; a `Structured` entry serves `generate_text` as serialized JSON and a
/// `Text` entry serves `generate_structured` only if it parses. An exhausted
/// script fails the call, which surfaces missing expectations immediately.
pub struct MockLlm {
    script: Mutex<VecDeque<MockResponse>>,
    pub calls: Mutex<Vec<String>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Client whose every call fails, for fallback-path tests
    ///
    /// An empty script means every call errors with "script exhausted".
    pub fn failing() -> Self {
        Self::new()
    }

    pub fn with_text<S: Into<String>>(self, text: S) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(MockResponse::Text(text.into()));
        self
    }

    pub fn with_structured(self, value: serde_json::Value) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(MockResponse::Structured(value));
        self
    }

    pub fn with_failure<S: Into<String>>(self, message: S) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(MockResponse::Failure(message.into()));
        self
    }

    /// Prompts seen so far, in call order
    pub fn recorded_prompts(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn next_response(&self, prompt: &str) -> Result<MockResponse, LlmError> {
        self.calls.lock().unwrap().push(prompt.to_string());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::Unknown {
                message: "MockLlm script exhausted".to_string(),
            })
    }
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    fn provider_name(&self) -> &str {
        "mock"
    }

    async fn generate_text(
        &self,
        prompt: &str,
        _system_prompt: &str,
        _config: &GenerationConfig,
    ) -> Result<String, LlmError> {
        match self.next_response(prompt)? {
            MockResponse::Text(text) => Ok(text),
            MockResponse::Structured(value) => Ok(value.to_string()),
            MockResponse::Failure(message) => Err(LlmError::Unknown { message }),
        }
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        _system_prompt: &str,
        _schema: &serde_json::Value,
        _config: &GenerationConfig,
    ) -> Result<serde_json::Value, LlmError> {
        match self.next_response(prompt)? {
            MockResponse::Structured(value) => Ok(value),
            MockResponse::Text(text) => {
                serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
                    message: format!("Mock text response is not JSON: {}", e),
                })
            }
            MockResponse::Failure(message) => Err(LlmError::Unknown { message }),
        }
    }
}
