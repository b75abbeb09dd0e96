/// Tests for model routing, refresh semantics and provider precedence.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatgate::chatgate::error::{GatewayError, Result};
use chatgate::chatgate::model_registry::ModelRegistry;
use chatgate::chatgate::models::{
    ChatMessage, ChatParams, ChatReply, ModelDescriptor, TokenUsage,
};
use chatgate::chatgate::provider::{ChunkStream, ProviderAdapter, ProviderType, StreamChunk};

/// Scripted in-memory adapter.
struct FakeAdapter {
    name: String,
    models: Vec<String>,
    enabled: AtomicBool,
    fail_listing: AtomicBool,
    chats: AtomicUsize,
}

impl FakeAdapter {
    fn new(name: &str, models: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            models: models.iter().map(|m| m.to_string()).collect(),
            enabled: AtomicBool::new(true),
            fail_listing: AtomicBool::new(false),
            chats: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ProviderAdapter for FakeAdapter {
    fn provider_name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Api
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(GatewayError::ProviderUnavailable(self.name.clone()));
        }
        Ok(self
            .models
            .iter()
            .map(|m| ModelDescriptor {
                name: m.clone(),
                provider: self.name.clone(),
                model_type: "api".into(),
                context_length: 4096,
                parameter_size: None,
                cost_per_1k_tokens: None,
                capabilities: vec!["chat".into()],
            })
            .collect())
    }

    async fn chat(
        &self,
        model: &str,
        _messages: &[ChatMessage],
        _params: &ChatParams,
    ) -> Result<ChatReply> {
        self.chats.fetch_add(1, Ordering::SeqCst);
        Ok(ChatReply {
            content: format!("{} answered", self.name),
            model: model.to_string(),
            usage: TokenUsage::new(1, 2),
        })
    }

    async fn chat_stream(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
        _params: &ChatParams,
    ) -> Result<ChunkStream> {
        let chunks = vec![Ok(StreamChunk {
            content: format!("{} streamed", self.name),
            finish_reason: Some("stop".into()),
        })];
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    async fn health_check(&self) -> bool {
        self.is_enabled()
    }
}

fn registry() -> ModelRegistry {
    ModelRegistry::new(Duration::from_secs(300))
}

#[tokio::test]
async fn refresh_builds_a_consistent_index() {
    let registry = registry();
    registry
        .register("p1", FakeAdapter::new("p1", &["alpha", "beta"]))
        .await;
    registry.refresh().await;

    let models = registry.get_all_models().await;
    assert_eq!(models.len(), 2);
    for model in &models {
        // Every indexed model routes to a provider that advertises it.
        let provider = registry.get_provider_for(&model.name).await.unwrap();
        assert_eq!(provider, "p1");
    }
}

#[tokio::test]
async fn first_registered_provider_wins_collisions() {
    let registry = registry();
    registry
        .register("P1", FakeAdapter::new("P1", &["shared"]))
        .await;
    registry
        .register("P2", FakeAdapter::new("P2", &["shared", "only-p2"]))
        .await;
    registry.refresh().await;

    assert_eq!(
        registry.get_provider_for("shared").await.as_deref(),
        Some("P1")
    );
    assert_eq!(
        registry.get_provider_for("only-p2").await.as_deref(),
        Some("P2")
    );
}

#[tokio::test]
async fn unregistering_fails_over_to_the_next_provider() {
    let registry = registry();
    let p1 = FakeAdapter::new("P1", &["shared"]);
    let p2 = FakeAdapter::new("P2", &["shared"]);
    registry.register("P1", p1.clone()).await;
    registry.register("P2", p2.clone()).await;
    registry.refresh().await;

    let reply = registry
        .chat("shared", &[ChatMessage::new("user", "hi")], &ChatParams::default())
        .await
        .unwrap();
    assert_eq!(reply.content, "P1 answered");
    assert_eq!(p1.chats.load(Ordering::SeqCst), 1);

    registry.unregister("P1").await;
    // The next call re-resolves (refreshing on miss) and lands on P2.
    let reply = registry
        .chat("shared", &[ChatMessage::new("user", "hi")], &ChatParams::default())
        .await
        .unwrap();
    assert_eq!(reply.content, "P2 answered");
    assert_eq!(p2.chats.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_models_refresh_once_then_fail() {
    let registry = registry();
    registry
        .register("p1", FakeAdapter::new("p1", &["alpha"]))
        .await;
    let err = registry
        .chat("nope", &[ChatMessage::new("user", "hi")], &ChatParams::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "model_not_found");
}

#[tokio::test]
async fn empty_message_lists_fail_validation() {
    let registry = registry();
    registry
        .register("p1", FakeAdapter::new("p1", &["alpha"]))
        .await;
    registry.refresh().await;
    let err = registry
        .chat("alpha", &[], &ChatParams::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn disabled_providers_refuse_routing() {
    let registry = registry();
    let adapter = FakeAdapter::new("p1", &["alpha"]);
    registry.register("p1", adapter.clone()).await;
    registry.refresh().await;

    adapter.enabled.store(false, Ordering::SeqCst);
    let err = registry
        .chat("alpha", &[ChatMessage::new("user", "hi")], &ChatParams::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "provider_disabled");
}

#[tokio::test]
async fn failed_discovery_keeps_prior_entries() {
    let registry = registry();
    let flaky = FakeAdapter::new("flaky", &["gamma"]);
    let steady = FakeAdapter::new("steady", &["delta"]);
    registry.register("flaky", flaky.clone()).await;
    registry.register("steady", steady.clone()).await;
    registry.refresh().await;
    assert!(registry.get_provider_for("gamma").await.is_some());

    flaky.fail_listing.store(true, Ordering::SeqCst);
    registry.refresh().await;

    // The flaky provider's previous entries survive; the healthy one is
    // refreshed normally.
    assert_eq!(
        registry.get_provider_for("gamma").await.as_deref(),
        Some("flaky")
    );
    assert_eq!(
        registry.get_provider_for("delta").await.as_deref(),
        Some("steady")
    );
}

#[tokio::test]
async fn health_aggregates_across_providers() {
    let registry = registry();
    let up = FakeAdapter::new("up", &["a"]);
    let down = FakeAdapter::new("down", &["b"]);
    registry.register("up", up.clone()).await;
    registry.register("down", down.clone()).await;
    down.enabled.store(false, Ordering::SeqCst);

    let health = registry.health_check().await;
    assert_eq!(health.status, "healthy");
    assert_eq!(health.providers["up"].status, "healthy");
    assert_eq!(health.providers["down"].status, "disabled");

    up.enabled.store(false, Ordering::SeqCst);
    let health = registry.health_check().await;
    assert_eq!(health.status, "unhealthy");
}

#[tokio::test]
async fn streaming_routes_like_blocking_calls() {
    use futures_util::StreamExt;
    let registry = registry();
    registry
        .register("p1", FakeAdapter::new("p1", &["alpha"]))
        .await;
    registry.refresh().await;

    let mut stream = registry
        .chat_stream("alpha", &[ChatMessage::new("user", "hi")], &ChatParams::default())
        .await
        .unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.content, "p1 streamed");
    assert!(stream.next().await.is_none());
}
