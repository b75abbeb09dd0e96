//! Shared primitives for provider-agnostic LLM adapters.
//!
//! The gateway talks to every backend through the [`ProviderAdapter`]
//! trait. An adapter translates the gateway's uniform request shape into
//! one provider's wire format and back, normalising role names, streaming
//! chunks and token accounting. Adapters are registered with the
//! [`ModelRegistry`](crate::chatgate::model_registry::ModelRegistry),
//! which owns model-name routing; the trait deliberately excludes any
//! conversation bookkeeping.
//!
//! All implementations must be thread-safe (`Send + Sync`) so they can be
//! shared between request tasks.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream::Stream;

use crate::chatgate::error::Result;
use crate::chatgate::models::{ChatMessage, ChatParams, ChatReply, ModelDescriptor};

/// Whether a provider runs on-box or behind a vendor API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    Local,
    Api,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Local => "local",
            ProviderType::Api => "api",
        }
    }
}

/// A chunk of content in a streaming response: one incremental delta of
/// the assistant's text.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    /// May be empty for chunks that carry only a finish reason.
    pub content: String,
    /// Provider-specific completion status (e.g. `"stop"`), present on
    /// the final chunk when the provider reports one.
    pub finish_reason: Option<String>,
}

/// Type alias for a stream of chunks compatible with `Send` executors.
///
/// The stream is finite: it terminates cleanly when the model stops, and
/// the concatenation of all chunk contents equals the full assistant
/// text.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Uniform interface over one LLM backend.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable identifier used in routing and configuration
    /// (`"ollama"`, `"openai"`, …).
    fn provider_name(&self) -> &str;

    /// Deployment class of the backend.
    fn provider_type(&self) -> ProviderType;

    /// Reflects configuration. A disabled adapter may stay registered but
    /// refuses chat calls.
    fn is_enabled(&self) -> bool;

    /// Models this backend currently serves.
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>>;

    /// Blocking request/response chat call.
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatReply>;

    /// Streaming chat call. Tool schemas travel inside
    /// [`ChatParams::tools`] already formatted for this provider.
    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChunkStream>;

    /// Token count for `text` under `model`'s tokenizer.
    ///
    /// The default is the flat four-characters-per-token estimate used
    /// when a backend exposes no tokenizer endpoint.
    fn count_tokens(&self, text: &str, _model: &str) -> usize {
        estimate_tokens(text)
    }

    /// One round-trip reachability probe.
    async fn health_check(&self) -> bool;
}

/// Flat token estimate: one token per four characters, minimum one for
/// non-empty text.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    if chars == 0 {
        0
    } else {
        (chars + 3) / 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("hi"), 1);
        assert_eq!(estimate_tokens("hello"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(40)), 10);
    }

    #[test]
    fn provider_type_strings() {
        assert_eq!(ProviderType::Local.as_str(), "local");
        assert_eq!(ProviderType::Api.as_str(), "api");
    }
}
