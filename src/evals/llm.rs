// LLM adapter used by LLM-as-judge evaluators. The trait is the seam;
// production wires the chat-completions client, tests substitute a stub.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::LlmConfig;
use crate::domain::{AgentTraceError, Result};

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one completion and return the raw text response.
    async fn complete(&self, prompt: &str) -> Result<String>;
}

pub struct HttpLlmClient {
    http: reqwest::Client,
    config: LlmConfig,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": 1024,
        });

        let response = self
            .http
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(AgentTraceError::transient(format!(
                "LLM endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(AgentTraceError::permanent(format!(
                "LLM endpoint returned {status}"
            )));
        }

        let parsed: ChatResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| AgentTraceError::permanent("LLM response had no choices"))?;

        debug!(chars = content.len(), "LLM completion received");
        Ok(content)
    }
}

/// Placeholder wired when no LLM credentials are configured; LLM evaluators
/// fail permanently instead of hanging.
pub struct DisabledLlmClient;

#[async_trait]
impl LlmClient for DisabledLlmClient {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Err(AgentTraceError::permanent(
            "no LLM adapter configured for this deployment",
        ))
    }
}
