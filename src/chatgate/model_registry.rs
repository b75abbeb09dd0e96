//! Aggregation of provider adapters and model-name routing.
//!
//! The registry owns the `model name → provider name` index. Reads vastly
//! outnumber writes, so the whole state sits behind one `RwLock`; refresh
//! builds a replacement index off-lock and swaps it in, which is what
//! keeps readers from ever observing a half-built index.
//!
//! Collision policy: when two providers advertise the same model name the
//! first-registered provider wins, giving deployments precedence control
//! through registration order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::chatgate::error::{GatewayError, Result};
use crate::chatgate::models::{ChatMessage, ChatParams, ChatReply, ModelDescriptor};
use crate::chatgate::provider::{ChunkStream, ProviderAdapter};

/// Health of one registered provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub status: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    pub enabled: bool,
}

/// Aggregate health across all providers.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryHealth {
    /// `healthy` when at least one enabled provider answers its probe.
    pub status: String,
    pub providers: HashMap<String, ProviderHealth>,
}

#[derive(Default)]
struct RegistryState {
    /// Registration order is routing precedence.
    providers: Vec<(String, Arc<dyn ProviderAdapter>)>,
    index: HashMap<String, String>,
    models: Vec<ModelDescriptor>,
    last_refresh: Option<Instant>,
}

/// Thread-safe registry of provider adapters.
pub struct ModelRegistry {
    state: RwLock<RegistryState>,
    refresh_interval: Duration,
}

impl ModelRegistry {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            refresh_interval,
        }
    }

    /// Register an adapter under `name`. Re-registering a name replaces
    /// the adapter but keeps its precedence slot.
    pub async fn register(&self, name: &str, adapter: Arc<dyn ProviderAdapter>) {
        let mut state = self.state.write().await;
        if let Some(slot) = state.providers.iter_mut().find(|(n, _)| n == name) {
            slot.1 = adapter;
        } else {
            state.providers.push((name.to_string(), adapter));
        }
        log::info!("registered provider {}", name);
    }

    /// Remove an adapter and every index entry routed to it.
    pub async fn unregister(&self, name: &str) {
        let mut state = self.state.write().await;
        state.providers.retain(|(n, _)| n != name);
        state.index.retain(|_, provider| provider != name);
        state.models.retain(|m| m.provider != name);
        log::info!("unregistered provider {}", name);
    }

    /// Re-discover models from every enabled adapter, concurrently.
    ///
    /// A failing adapter does not abort the refresh; its previous index
    /// entries and descriptors are carried over unchanged.
    pub async fn refresh(&self) {
        let providers: Vec<(String, Arc<dyn ProviderAdapter>)> =
            self.state.read().await.providers.clone();

        let discoveries = join_all(providers.iter().map(|(name, adapter)| {
            let name = name.clone();
            let adapter = adapter.clone();
            async move {
                if !adapter.is_enabled() {
                    return (name, Ok(Vec::new()));
                }
                let result = adapter.list_models().await;
                (name, result)
            }
        }))
        .await;

        let mut state = self.state.write().await;
        let mut index = HashMap::new();
        let mut models = Vec::new();
        for (name, result) in discoveries {
            let discovered = match result {
                Ok(list) => list,
                Err(e) => {
                    log::warn!("model discovery failed for {}: {}; keeping prior entries", name, e);
                    state
                        .models
                        .iter()
                        .filter(|m| m.provider == name)
                        .cloned()
                        .collect()
                }
            };
            for model in discovered {
                if !index.contains_key(&model.name) {
                    index.insert(model.name.clone(), name.clone());
                    models.push(model);
                }
            }
        }
        log::info!("model index refreshed: {} model(s)", index.len());
        state.index = index;
        state.models = models;
        state.last_refresh = Some(Instant::now());
    }

    /// Merged descriptor list; triggers a refresh when the index is empty
    /// or older than the refresh interval.
    pub async fn get_all_models(&self) -> Vec<ModelDescriptor> {
        let stale = {
            let state = self.state.read().await;
            match state.last_refresh {
                None => true,
                Some(at) => at.elapsed() > self.refresh_interval || state.index.is_empty(),
            }
        };
        if stale {
            self.refresh().await;
        }
        self.state.read().await.models.clone()
    }

    /// Provider owning `model`, or `None` when unknown.
    pub async fn get_provider_for(&self, model: &str) -> Option<String> {
        self.state.read().await.index.get(model).cloned()
    }

    /// Descriptor for `model`, or `None` when unknown.
    pub async fn descriptor_for(&self, model: &str) -> Option<ModelDescriptor> {
        self.state
            .read()
            .await
            .models
            .iter()
            .find(|m| m.name == model)
            .cloned()
    }

    /// Resolve a model to its adapter, refreshing the index once when the
    /// first lookup misses.
    async fn resolve(&self, model: &str) -> Result<Arc<dyn ProviderAdapter>> {
        let provider = match self.get_provider_for(model).await {
            Some(p) => p,
            None => {
                self.refresh().await;
                self.get_provider_for(model)
                    .await
                    .ok_or_else(|| GatewayError::ModelNotFound(model.to_string()))?
            }
        };
        let adapter = {
            let state = self.state.read().await;
            state
                .providers
                .iter()
                .find(|(n, _)| *n == provider)
                .map(|(_, a)| a.clone())
        }
        .ok_or_else(|| GatewayError::ModelNotFound(model.to_string()))?;
        if !adapter.is_enabled() {
            return Err(GatewayError::ProviderDisabled(provider));
        }
        Ok(adapter)
    }

    /// Blocking chat routed to the owning provider.
    pub async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatReply> {
        if messages.is_empty() {
            return Err(GatewayError::validation("message list must not be empty"));
        }
        let adapter = self.resolve(model).await?;
        adapter.chat(model, messages, params).await
    }

    /// Streaming chat routed to the owning provider.
    pub async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChunkStream> {
        if messages.is_empty() {
            return Err(GatewayError::validation("message list must not be empty"));
        }
        let adapter = self.resolve(model).await?;
        adapter.chat_stream(model, messages, params).await
    }

    /// Token count for `text` under `model`'s provider, falling back to
    /// the flat estimate when the model is unknown.
    pub async fn count_tokens(&self, model: &str, text: &str) -> usize {
        match self.resolve(model).await {
            Ok(adapter) => adapter.count_tokens(text, model),
            Err(_) => crate::chatgate::provider::estimate_tokens(text),
        }
    }

    /// Probe every provider; overall status is `healthy` when any enabled
    /// provider is.
    pub async fn health_check(&self) -> RegistryHealth {
        let providers: Vec<(String, Arc<dyn ProviderAdapter>)> =
            self.state.read().await.providers.clone();
        let checks = join_all(providers.iter().map(|(name, adapter)| {
            let name = name.clone();
            let adapter = adapter.clone();
            async move {
                let enabled = adapter.is_enabled();
                let healthy = enabled && adapter.health_check().await;
                (
                    name,
                    ProviderHealth {
                        status: if !enabled {
                            "disabled".to_string()
                        } else if healthy {
                            "healthy".to_string()
                        } else {
                            "unhealthy".to_string()
                        },
                        provider_type: adapter.provider_type().as_str().to_string(),
                        enabled,
                    },
                )
            }
        }))
        .await;

        let any_healthy = checks.iter().any(|(_, h)| h.status == "healthy");
        RegistryHealth {
            status: if any_healthy { "healthy" } else { "unhealthy" }.to_string(),
            providers: checks.into_iter().collect(),
        }
    }
}
