//! Completion providers

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use tracing::debug;

use crate::error::{AgentError, Result};

/// The LLM seam for the agent loop and summarization
#[async_trait]
pub trait CompletionModel: Send + Sync {
    /// Send one prompt, get the raw completion text back
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Model identifier for logging
    fn model_id(&self) -> &str;
}

/// OpenAI-compatible chat completion provider
pub struct OpenAiChatModel {
    model: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiChatModel {
    /// Create a provider reading the API key from `api_key_env`
    ///
    /// # Errors
    ///
    /// Fails if the environment variable is unset.
    pub fn new(model: &str, api_key_env: &str, base_url: Option<&str>) -> Result<Self> {
        let api_key = std::env::var(api_key_env).map_err(|_| {
            AgentError::Provider(format!("API key environment variable {api_key_env} not set"))
        })?;
        Ok(Self {
            model: model.to_string(),
            api_key,
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl CompletionModel for OpenAiChatModel {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&ChatRequest {
                model: &self.model,
                messages: vec![json!({"role": "user", "content": prompt})],
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Provider(format!(
                "completion API returned {status}: {body}"
            )));
        }

        let parsed: ChatResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AgentError::Provider("empty completion".to_string()))?;
        debug!(model = %self.model, chars = content.len(), "Completion received");
        Ok(content)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Scripted provider for tests: pops responses in order
pub struct ScriptedCompletion {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedCompletion {
    /// Create with a fixed response sequence
    #[must_use]
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts seen so far
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl CompletionModel for ScriptedCompletion {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().push(prompt.to_string());
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| AgentError::Provider("scripted responses exhausted".to_string()))
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}
