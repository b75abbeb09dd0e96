// src/chatgate/mod.rs

pub mod approval;
pub mod auth;
pub mod error;
pub mod mcp_client;
pub mod mcp_transport;
pub mod model_registry;
pub mod models;
pub mod orchestrator;
pub mod provider;
pub mod providers;
pub mod server;
pub mod session_store;
pub mod settings;
pub mod store;
pub mod stream_parser;
pub mod tool_registry;
pub mod users;

pub use error::{GatewayError, Result};
pub use server::Application;

use std::sync::Once;

static LOGGER_INIT: Once = Once::new();

/// Initialise env_logger once for the whole process. Safe to call from
/// every test and binary entry point.
pub fn init_logger() {
    LOGGER_INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("info"),
        )
        .try_init();
    });
}
