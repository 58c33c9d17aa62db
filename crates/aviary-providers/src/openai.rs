//! OpenAI-compatible API client.
//!
//! Works with OpenAI's API and any compatible endpoint.

use async_trait::async_trait;
use aviary_core::{
    config::ProviderConfig,
    error::AviaryError,
    traits::Completion,
    turn::{CompletionRequest, Turn},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Generous per-call cap so a stuck completion never pins a worker.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(45);

/// OpenAI-compatible completion backend.
pub struct OpenAiCompletion {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompletion {
    /// Create from config values.
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        }
    }
}

/// Build wire-format messages: system instruction first, then history.
pub(crate) fn build_messages(system: &str, turns: &[Turn]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(turns.len() + 1);
    if !system.is_empty() {
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: system.to_string(),
        });
    }
    for turn in turns {
        messages.push(ChatMessage {
            role: turn.role.as_str().to_string(),
            content: turn.content.clone(),
        });
    }
    messages
}

#[derive(Serialize, Deserialize, Clone)]
pub(crate) struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Serialize)]
pub(crate) struct ChatCompletionBody {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Deserialize)]
pub(crate) struct ChatCompletionResponse {
    pub choices: Option<Vec<ChatChoice>>,
}

#[derive(Deserialize)]
pub(crate) struct ChatChoice {
    pub message: Option<ChatMessage>,
}

#[async_trait]
impl Completion for OpenAiCompletion {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, AviaryError> {
        let body = ChatCompletionBody {
            model: self.model.clone(),
            messages: build_messages(&request.system, &request.turns),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        debug!(
            "openai: POST {url} model={} temp={} max_tokens={}",
            self.model, request.temperature, request.max_tokens
        );

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| AviaryError::Completion(format!("openai request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(AviaryError::Completion(format!(
                "openai returned {status}: {text}"
            )));
        }

        let parsed: ChatCompletionResponse = resp.json().await.map_err(|e| {
            AviaryError::Completion(format!("openai: failed to parse response: {e}"))
        })?;

        parsed
            .choices
            .and_then(|mut c| c.drain(..).next())
            .and_then(|c| c.message)
            .map(|m| m.content)
            .ok_or_else(|| AviaryError::Completion("openai returned no choices".to_string()))
    }

    async fn is_available(&self) -> bool {
        if self.api_key.is_empty() {
            warn!("openai: no API key configured");
            return false;
        }
        // Basic check: try to list models.
        let url = format!("{}/models", self.base_url.trim_end_matches('/'));
        match self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("openai not available: {e}");
                false
            }
        }
    }
}
