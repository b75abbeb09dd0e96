//! Provider adapter implementations.
//!
//! One module per backend, plus shared HTTP plumbing in [`common`]. All
//! adapters implement
//! [`ProviderAdapter`](crate::chatgate::provider::ProviderAdapter).

pub mod anthropic;
pub mod common;
pub mod ollama;
pub mod openai;

pub use anthropic::AnthropicAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;
