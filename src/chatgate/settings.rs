//! Layered runtime configuration.
//!
//! A [`Settings`] value is constructed once at startup and shared read-only
//! for the life of the process. Lookup precedence, highest first:
//!
//! 1. environment variable (dotted path uppercased, dots become
//!    underscores: `llm_providers.ollama.base_url` →
//!    `LLM_PROVIDERS_OLLAMA_BASE_URL`),
//! 2. JSON configuration file, located by `$CHATGATE_CONFIG` or
//!    `config.json` in the working directory,
//! 3. the caller-supplied default.
//!
//! Resolved values are trimmed and cached for the process lifetime; there
//! is no hot reload.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::Deserialize;
use serde_json::Value;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "CHATGATE_CONFIG";

/// Configuration for one MCP tool server.
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerConfig {
    /// Registry prefix for tools discovered on this server.
    pub name: String,
    /// JSON-RPC endpoint.
    pub base_url: String,
    /// Optional bearer token forwarded on every call.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Whether the server participates in discovery and execution.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Tool names that bypass the approval gate on this server.
    #[serde(default)]
    pub auto_approve_tools: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Configuration for one LLM provider block (`llm_providers.<name>.*`).
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub enabled: bool,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub default_model: Option<String>,
    pub timeout_seconds: u64,
}

/// Process-wide read-only configuration with dotted-path lookup.
pub struct Settings {
    file: Value,
    cache: RwLock<HashMap<String, Option<String>>>,
}

impl Settings {
    /// Load settings from `$CHATGATE_CONFIG` (or `config.json`). A missing
    /// or unreadable file degrades to environment + defaults.
    pub fn load() -> Self {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config.json".to_string());
        Self::from_file(&path)
    }

    /// Load settings from an explicit file path.
    pub fn from_file(path: impl AsRef<Path>) -> Self {
        let file = match std::fs::read_to_string(path.as_ref()) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(value) => {
                    log::info!("configuration loaded from {}", path.as_ref().display());
                    value
                }
                Err(e) => {
                    log::error!(
                        "configuration file {} is not valid JSON: {}",
                        path.as_ref().display(),
                        e
                    );
                    Value::Null
                }
            },
            Err(_) => {
                log::info!(
                    "no configuration file at {}; using environment and defaults",
                    path.as_ref().display()
                );
                Value::Null
            }
        };
        Self {
            file,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Build settings from an in-memory JSON document. Used by tests and
    /// embedders.
    pub fn from_value(file: Value) -> Self {
        Self {
            file,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a dotted path to a string, or `None` when neither the
    /// environment nor the file defines it.
    pub fn get(&self, path: &str) -> Option<String> {
        if let Some(cached) = self.cache.read().expect("settings cache poisoned").get(path) {
            return cached.clone();
        }
        let resolved = self.resolve(path);
        self.cache
            .write()
            .expect("settings cache poisoned")
            .insert(path.to_string(), resolved.clone());
        resolved
    }

    fn resolve(&self, path: &str) -> Option<String> {
        let env_key = path.to_uppercase().replace('.', "_");
        if let Ok(value) = std::env::var(&env_key) {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return Some(trimmed);
            }
        }
        match self.file_lookup(path) {
            Some(Value::String(s)) => Some(s.trim().to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(other) if !other.is_null() => Some(other.to_string()),
            _ => None,
        }
    }

    fn file_lookup(&self, path: &str) -> Option<&Value> {
        let mut node = &self.file;
        for segment in path.split('.') {
            node = node.as_object()?.get(segment)?;
        }
        Some(node)
    }

    /// String lookup with a default.
    pub fn get_str(&self, path: &str, default: &str) -> String {
        self.get(path).unwrap_or_else(|| default.to_string())
    }

    /// Boolean lookup accepting `true/false/1/0` case-insensitively.
    pub fn get_bool(&self, path: &str, default: bool) -> bool {
        match self.get(path) {
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => default,
            },
            None => default,
        }
    }

    /// Integer lookup with a default; unparseable values fall back.
    pub fn get_u64(&self, path: &str, default: u64) -> u64 {
        self.get(path)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(default)
    }

    // Typed accessors for the keys the gateway recognises.

    pub fn log_level(&self) -> String {
        self.get_str("log_level", "info")
    }

    pub fn database_url(&self) -> String {
        self.get_str("database_url", "sqlite::memory:")
    }

    pub fn redis_url(&self) -> Option<String> {
        self.get("redis_url")
    }

    pub fn bind_address(&self) -> String {
        self.get_str("bind_address", "0.0.0.0:8000")
    }

    /// Whether bearer validation is enforced. Off means every request maps
    /// to the demo user.
    pub fn auth_enabled(&self) -> bool {
        self.get_bool("auth_enabled", true)
    }

    /// Externally visible identity-provider URL; this is the expected
    /// token issuer (realm path included, see
    /// [`identity_issuer`](Self::identity_issuer)).
    pub fn identity_provider_url(&self) -> String {
        self.get_str("identity_provider_url", "http://localhost:8180")
    }

    /// URL used for JWKS retrieval inside the deployment network. Falls
    /// back to the external URL.
    pub fn identity_provider_internal_url(&self) -> String {
        self.get("identity_provider_internal_url")
            .unwrap_or_else(|| self.identity_provider_url())
    }

    pub fn identity_realm(&self) -> String {
        self.get_str("identity_realm", "gateway")
    }

    /// Expected `iss` claim: the external provider URL with the realm
    /// path appended unless it already carries one.
    pub fn identity_issuer(&self) -> String {
        with_realm(&self.identity_provider_url(), &self.identity_realm())
    }

    /// Base URL for JWKS retrieval, realm path included.
    pub fn identity_jwks_base(&self) -> String {
        with_realm(&self.identity_provider_internal_url(), &self.identity_realm())
    }

    /// Expected `aud` claim. This is the identity provider's account
    /// audience, not the OAuth client id.
    pub fn identity_audience(&self) -> String {
        self.get_str("identity_audience", "account")
    }

    pub fn stream_session_ttl_seconds(&self) -> u64 {
        self.get_u64("stream_session_ttl_seconds", 300)
    }

    pub fn context_message_limit(&self) -> u64 {
        self.get_u64("context_message_limit", 20)
    }

    pub fn default_system_prompt(&self) -> String {
        self.get_str("default_system_prompt", "You are a helpful assistant.")
    }

    pub fn enable_thinking_mode(&self) -> bool {
        self.get_bool("enable_thinking_mode", true)
    }

    pub fn approval_timeout_seconds(&self) -> u64 {
        self.get_u64("mcp.approval_timeout_seconds", 300)
    }

    pub fn model_refresh_interval_seconds(&self) -> u64 {
        self.get_u64("model_refresh_interval_seconds", 300)
    }

    /// One provider block. `enabled` defaults to false so that only
    /// explicitly configured backends are constructed.
    pub fn provider(&self, name: &str) -> ProviderSettings {
        let prefix = format!("llm_providers.{name}");
        ProviderSettings {
            enabled: self.get_bool(&format!("{prefix}.enabled"), false),
            base_url: self.get(&format!("{prefix}.base_url")),
            api_key: self.get(&format!("{prefix}.api_key")),
            default_model: self.get(&format!("{prefix}.default_model")),
            timeout_seconds: self.get_u64(&format!("{prefix}.timeout"), 120),
        }
    }

    /// Configured MCP servers. The `MCP_SERVERS` environment variable (a
    /// JSON array) overrides the file list wholesale.
    pub fn mcp_servers(&self) -> Vec<McpServerConfig> {
        if let Ok(raw) = std::env::var("MCP_SERVERS") {
            match serde_json::from_str(&raw) {
                Ok(servers) => return servers,
                Err(e) => log::warn!("MCP_SERVERS is not a valid JSON array: {}", e),
            }
        }
        match self.file_lookup("mcp.servers") {
            Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
                log::warn!("mcp.servers is malformed: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        }
    }
}

fn with_realm(base: &str, realm: &str) -> String {
    if base.contains("/realms/") {
        base.trim_end_matches('/').to_string()
    } else {
        format!("{}/realms/{}", base.trim_end_matches('/'), realm)
    }
}
