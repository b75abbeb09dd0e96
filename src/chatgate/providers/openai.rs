//! Adapter for OpenAI-compatible chat-completion APIs.
//!
//! Covers the hosted OpenAI service and any backend exposing the same
//! surface (`/v1/models`, `/v1/chat/completions`); streaming uses SSE
//! with the `[DONE]` sentinel.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::chatgate::error::{GatewayError, Result};
use crate::chatgate::models::{ChatMessage, ChatParams, ChatReply, ModelDescriptor, TokenUsage};
use crate::chatgate::provider::{
    estimate_tokens, ChunkStream, ProviderAdapter, ProviderType, StreamChunk,
};
use crate::chatgate::providers::common::{
    error_from_response, send_with_retries, shared_http_client,
};
use crate::chatgate::settings::ProviderSettings;

const MAX_RETRIES: u32 = 3;

pub struct OpenAiAdapter {
    base_url: String,
    api_key: Option<String>,
    enabled: bool,
    /// Applied to non-streaming requests; streamed bodies are unbounded.
    timeout: std::time::Duration,
}

impl OpenAiAdapter {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, enabled: bool) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            // An adapter without credentials can never succeed upstream.
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
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
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
            Err(GatewayError::ProviderDisabled("openai".into()))
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn build_request(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &ChatParams,
        stream: bool,
    ) -> Value {
        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(t) = params.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(n) = params.max_tokens {
            body["max_tokens"] = json!(n);
        }
        if let Some(tools) = &params.tools {
            body["tools"] = json!(tools);
        }
        if stream {
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }
}

#[derive(Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    delta: Option<WireMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct UsagePayload {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
}

fn context_length_for(id: &str) -> u32 {
    if id.starts_with("gpt-4o") || id.starts_with("gpt-4.1") || id.starts_with("gpt-4-turbo") {
        128_000
    } else if id.starts_with("o1") || id.starts_with("o3") {
        200_000
    } else if id.starts_with("gpt-3.5-turbo") {
        16_385
    } else {
        8_192
    }
}

fn cost_for(id: &str) -> Option<f64> {
    if id.starts_with("gpt-4o-mini") {
        Some(0.000_15)
    } else if id.starts_with("gpt-4o") {
        Some(0.002_5)
    } else if id.starts_with("gpt-3.5-turbo") {
        Some(0.000_5)
    } else {
        None
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider_name(&self) -> &str {
        "openai"
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Api
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        self.refuse_when_disabled()?;
        let url = format!("{}/models", self.base_url);
        let response = send_with_retries(
            "openai",
            self.authorized(shared_http_client().get(&url)),
            MAX_RETRIES,
        )
        .await?;
        if !response.status().is_success() {
            return Err(error_from_response("openai", "", response).await);
        }
        let decoded: ModelsResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderUnavailable(format!("openai: {e}")))?;
        Ok(decoded
            .data
            .into_iter()
            .filter(|m| m.id.starts_with("gpt-") || m.id.starts_with("o1") || m.id.starts_with("o3"))
            .map(|m| ModelDescriptor {
                context_length: context_length_for(&m.id),
                parameter_size: None,
                cost_per_1k_tokens: cost_for(&m.id),
                capabilities: vec!["chat".into(), "streaming".into(), "tools".into()],
                provider: "openai".into(),
                model_type: "api".into(),
                name: m.id,
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
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_request(model, messages, params, false);
        let response = send_with_retries(
            "openai",
            self.authorized(shared_http_client().post(&url))
                .timeout(self.timeout)
                .json(&body),
            MAX_RETRIES,
        )
        .await?;
        if !response.status().is_success() {
            return Err(error_from_response("openai", model, response).await);
        }
        let decoded: CompletionResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderUnavailable(format!("openai: {e}")))?;
        let content = decoded
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.content.clone())
            .unwrap_or_default();
        let usage = match decoded.usage {
            Some(u) => TokenUsage::new(u.prompt_tokens, u.completion_tokens),
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
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_request(model, messages, params, true);
        let response = send_with_retries(
            "openai",
            self.authorized(shared_http_client().post(&url)).json(&body),
            MAX_RETRIES,
        )
        .await?;
        if !response.status().is_success() {
            return Err(error_from_response("openai", model, response).await);
        }
        let events = response.bytes_stream().eventsource();
        let chunks = events.filter_map(|event| async move {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    return Some(Err(GatewayError::ProviderUnavailable(format!(
                        "openai: stream read: {e}"
                    ))))
                }
            };
            if event.data.trim() == "[DONE]" {
                return None;
            }
            match serde_json::from_str::<CompletionResponse>(&event.data) {
                Ok(part) => {
                    let choice = part.choices.into_iter().next();
                    let content = choice
                        .as_ref()
                        .and_then(|c| c.delta.as_ref())
                        .and_then(|d| d.content.clone())
                        .unwrap_or_default();
                    let finish = choice.and_then(|c| c.finish_reason);
                    if content.is_empty() && finish.is_none() {
                        None
                    } else {
                        Some(Ok(StreamChunk {
                            content,
                            finish_reason: finish,
                        }))
                    }
                }
                Err(e) => Some(Err(GatewayError::ProviderUnavailable(format!(
                    "openai: malformed stream event: {e}"
                )))),
            }
        });
        Ok(Box::pin(chunks))
    }

    async fn health_check(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let url = format!("{}/models", self.base_url);
        match self.authorized(shared_http_client().get(&url)).send().await {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }
}
