//! Adapter for a local Ollama inference server.
//!
//! Speaks Ollama's native API: `GET /api/tags` for discovery and
//! `POST /api/chat` for generation, which streams newline-delimited JSON
//! objects rather than SSE.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::chatgate::error::{GatewayError, Result};
use crate::chatgate::models::{ChatMessage, ChatParams, ChatReply, ModelDescriptor, TokenUsage};
use crate::chatgate::provider::{
    estimate_tokens, ChunkStream, ProviderAdapter, ProviderType, StreamChunk,
};
use crate::chatgate::providers::common::{
    error_from_response, ndjson_lines, send_with_retries, shared_http_client,
};
use crate::chatgate::settings::ProviderSettings;

const MAX_RETRIES: u32 = 3;

pub struct OllamaAdapter {
    base_url: String,
    enabled: bool,
    /// Applied to non-streaming requests; streamed bodies are unbounded.
    timeout: std::time::Duration,
}

impl OllamaAdapter {
    pub fn new(base_url: impl Into<String>, enabled: bool) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            enabled,
            timeout: std::time::Duration::from_secs(120),
        }
    }

    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let mut adapter = Self::new(
            settings
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            settings.enabled,
        );
        adapter.timeout = std::time::Duration::from_secs(settings.timeout_seconds);
        adapter
    }

    fn refuse_when_disabled(&self) -> Result<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(GatewayError::ProviderDisabled("ollama".into()))
        }
    }

    fn build_request(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &ChatParams,
        stream: bool,
    ) -> Value {
        let mut options = serde_json::Map::new();
        if let Some(t) = params.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(n) = params.max_tokens {
            options.insert("num_predict".into(), json!(n));
        }
        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": stream,
            "options": Value::Object(options),
        });
        if let Some(tools) = &params.tools {
            body["tools"] = json!(tools);
        }
        body
    }
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    details: TagDetails,
}

#[derive(Default, Deserialize)]
struct TagDetails {
    #[serde(default)]
    parameter_size: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ChatResponseMessage>,
    #[serde(default)]
    prompt_eval_count: Option<usize>,
    #[serde(default)]
    eval_count: Option<usize>,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

/// Context windows for common local model families; anything unknown gets
/// a conservative default.
fn context_length_for(name: &str) -> u32 {
    let lowered = name.to_lowercase();
    if lowered.contains("llama3") || lowered.contains("llama-3") {
        8192
    } else if lowered.contains("mistral") || lowered.contains("mixtral") {
        8192
    } else if lowered.contains("qwen") {
        32768
    } else if lowered.contains("phi") {
        2048
    } else {
        4096
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn provider_name(&self) -> &str {
        "ollama"
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Local
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        self.refuse_when_disabled()?;
        let url = format!("{}/api/tags", self.base_url);
        let response = send_with_retries(
            "ollama",
            shared_http_client().get(&url).timeout(self.timeout),
            MAX_RETRIES,
        )
        .await?;
        if !response.status().is_success() {
            return Err(error_from_response("ollama", "", response).await);
        }
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderUnavailable(format!("ollama: {e}")))?;
        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelDescriptor {
                context_length: context_length_for(&m.name),
                parameter_size: m.details.parameter_size,
                cost_per_1k_tokens: None,
                capabilities: vec!["chat".into(), "streaming".into()],
                provider: "ollama".into(),
                model_type: "local".into(),
                name: m.name,
            })
            .collect())
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatReply> {
        self.refuse_when_disabled()?;
        let url = format!("{}/api/chat", self.base_url);
        let body = self.build_request(model, messages, params, false);
        let response = send_with_retries(
            "ollama",
            shared_http_client()
                .post(&url)
                .timeout(self.timeout)
                .json(&body),
            MAX_RETRIES,
        )
        .await?;
        if !response.status().is_success() {
            return Err(error_from_response("ollama", model, response).await);
        }
        let decoded: ChatResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderUnavailable(format!("ollama: {e}")))?;
        let content = decoded.message.map(|m| m.content).unwrap_or_default();
        let input = decoded
            .prompt_eval_count
            .unwrap_or_else(|| messages.iter().map(|m| estimate_tokens(&m.content)).sum());
        let output = decoded.eval_count.unwrap_or_else(|| estimate_tokens(&content));
        Ok(ChatReply {
            content,
            model: model.to_string(),
            usage: TokenUsage::new(input, output),
        })
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChunkStream> {
        self.refuse_when_disabled()?;
        let url = format!("{}/api/chat", self.base_url);
        let body = self.build_request(model, messages, params, true);
        let response = send_with_retries(
            "ollama",
            shared_http_client().post(&url).json(&body),
            MAX_RETRIES,
        )
        .await?;
        if !response.status().is_success() {
            return Err(error_from_response("ollama", model, response).await);
        }
        let chunks = ndjson_lines(response).filter_map(|line| async move {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(e)),
            };
            match serde_json::from_str::<ChatResponse>(&line) {
                Ok(part) => {
                    let content = part.message.map(|m| m.content).unwrap_or_default();
                    if content.is_empty() && !part.done {
                        None
                    } else {
                        Some(Ok(StreamChunk {
                            content,
                            finish_reason: part.done.then(|| "stop".to_string()),
                        }))
                    }
                }
                Err(e) => Some(Err(GatewayError::ProviderUnavailable(format!(
                    "ollama: malformed stream line: {e}"
                )))),
            }
        });
        Ok(Box::pin(chunks))
    }

    async fn health_check(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let url = format!("{}/api/tags", self.base_url);
        match shared_http_client().get(&url).send().await {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }
}
