//! Adapter for the Anthropic Messages API.
//!
//! Differs from the OpenAI-compatible surface in three ways the adapter
//! normalises: the system prompt travels as a top-level `system` field,
//! `max_tokens` is mandatory, and streaming uses typed SSE events
//! (`content_block_delta`, `message_delta`, `message_stop`).

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::chatgate::error::{GatewayError, Result};
use crate::chatgate::models::{
    role, ChatMessage, ChatParams, ChatReply, ModelDescriptor, TokenUsage,
};
use crate::chatgate::provider::{
    estimate_tokens, ChunkStream, ProviderAdapter, ProviderType, StreamChunk,
};
use crate::chatgate::providers::common::{
    error_from_response, send_with_retries, shared_http_client,
};
use crate::chatgate::settings::ProviderSettings;

const MAX_RETRIES: u32 = 3;
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicAdapter {
    base_url: String,
    api_key: Option<String>,
    enabled: bool,
    /// Applied to non-streaming requests; streamed bodies are unbounded.
    timeout: std::time::Duration,
}

impl AnthropicAdapter {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, enabled: bool) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            enabled: enabled && api_key.is_some(),
            api_key,
            timeout: std::time::Duration::from_secs(120),
        }
    }

    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let mut adapter = Self::new(
            settings
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            settings.api_key.clone(),
            settings.enabled,
        );
        adapter.timeout = std::time::Duration::from_secs(settings.timeout_seconds);
        adapter
    }

    fn refuse_when_disabled(&self) -> Result<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(GatewayError::ProviderDisabled("anthropic".into()))
        }
    }

    fn headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("anthropic-version", API_VERSION);
        match &self.api_key {
            Some(key) => builder.header("x-api-key", key),
            None => builder,
        }
    }

    /// Split the gateway's uniform message list into Anthropic's shape:
    /// system prompts are concatenated into the `system` field, tool
    /// results are folded into user turns.
    fn build_request(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &ChatParams,
        stream: bool,
    ) -> Value {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut turns: Vec<Value> = Vec::new();
        for message in messages {
            match message.role.as_str() {
                role::SYSTEM => system_parts.push(&message.content),
                role::ASSISTANT => turns.push(json!({
                    "role": "assistant",
                    "content": message.content,
                })),
                _ => turns.push(json!({
                    "role": "user",
                    "content": message.content,
                })),
            }
        }
        let mut body = json!({
            "model": model,
            "messages": turns,
            "max_tokens": params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": stream,
        });
        if !system_parts.is_empty() {
            body["system"] = json!(system_parts.join("\n\n"));
        }
        if let Some(t) = params.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(tools) = &params.tools {
            body["tools"] = json!(tools);
        }
        body
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Default, Deserialize)]
struct UsagePayload {
    #[serde(default)]
    input_tokens: usize,
    #[serde(default)]
    output_tokens: usize,
}

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

/// The hosted models and their shared 200k context window. The Messages
/// API has no discovery endpoint worth trusting for capability data, so
/// the catalogue is static.
fn catalogue() -> Vec<(&'static str, Option<f64>)> {
    vec![
        ("claude-3-5-sonnet-20241022", Some(0.003)),
        ("claude-3-5-haiku-20241022", Some(0.000_8)),
        ("claude-3-opus-20240229", Some(0.015)),
    ]
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Api
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        self.refuse_when_disabled()?;
        Ok(catalogue()
            .into_iter()
            .map(|(name, cost)| ModelDescriptor {
                name: name.to_string(),
                provider: "anthropic".into(),
                model_type: "api".into(),
                context_length: 200_000,
                parameter_size: None,
                cost_per_1k_tokens: cost,
                capabilities: vec!["chat".into(), "streaming".into(), "tools".into()],
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
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request(model, messages, params, false);
        let response = send_with_retries(
            "anthropic",
            self.headers(shared_http_client().post(&url))
                .timeout(self.timeout)
                .json(&body),
            MAX_RETRIES,
        )
        .await?;
        if !response.status().is_success() {
            return Err(error_from_response("anthropic", model, response).await);
        }
        let decoded: MessagesResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderUnavailable(format!("anthropic: {e}")))?;
        let content: String = decoded
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect();
        let usage = match decoded.usage {
            Some(u) => TokenUsage::new(u.input_tokens, u.output_tokens),
            None => TokenUsage::new(
                messages.iter().map(|m| estimate_tokens(&m.content)).sum(),
                estimate_tokens(&content),
            ),
        };
        Ok(ChatReply {
            content,
            model: model.to_string(),
            usage,
        })
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChunkStream> {
        self.refuse_when_disabled()?;
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request(model, messages, params, true);
        let response = send_with_retries(
            "anthropic",
            self.headers(shared_http_client().post(&url)).json(&body),
            MAX_RETRIES,
        )
        .await?;
        if !response.status().is_success() {
            return Err(error_from_response("anthropic", model, response).await);
        }
        let events = response.bytes_stream().eventsource();
        let chunks = events.filter_map(|event| async move {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    return Some(Err(GatewayError::ProviderUnavailable(format!(
                        "anthropic: stream read: {e}"
                    ))))
                }
            };
            match event.event.as_str() {
                "content_block_delta" => {
                    match serde_json::from_str::<StreamEvent>(&event.data) {
                        Ok(part) => {
                            let text = part
                                .delta
                                .and_then(|d| d.text)
                                .unwrap_or_default();
                            if text.is_empty() {
                                None
                            } else {
                                Some(Ok(StreamChunk {
                                    content: text,
                                    finish_reason: None,
                                }))
                            }
                        }
                        Err(e) => Some(Err(GatewayError::ProviderUnavailable(format!(
                            "anthropic: malformed stream event: {e}"
                        )))),
                    }
                }
                "message_delta" => {
                    let stop = serde_json::from_str::<StreamEvent>(&event.data)
                        .ok()
                        .and_then(|p| p.delta)
                        .and_then(|d| d.stop_reason);
                    stop.map(|reason| {
                        Ok(StreamChunk {
                            content: String::new(),
                            finish_reason: Some(reason),
                        })
                    })
                }
                _ => None,
            }
        });
        Ok(Box::pin(chunks))
    }

    async fn health_check(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let url = format!("{}/v1/models", self.base_url);
        match self.headers(shared_http_client().get(&url)).send().await {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }
}
