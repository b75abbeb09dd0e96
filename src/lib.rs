// src/lib.rs

// Import the top-level `chatgate` module.
pub mod chatgate;

// Re-exporting key items for easier external access.
pub use chatgate::error::{GatewayError, Result};
pub use chatgate::init_logger;
pub use chatgate::model_registry::ModelRegistry;
pub use chatgate::models::{ChatMessage, ChatParams, ChatReply, TokenUsage};
pub use chatgate::orchestrator::ChatOrchestrator;
pub use chatgate::provider::{ProviderAdapter, ProviderType, StreamChunk};
pub use chatgate::server::Application;
pub use chatgate::settings::Settings;
