//! JSON-RPC 2.0 over HTTP, the wire protocol spoken to MCP tool servers.
//!
//! One [`McpTransport`] per process; it shares the pooled HTTP client and
//! stamps every call with a fresh request id. Connection failures and 5xx
//! responses retry with exponential backoff; JSON-RPC `error` objects and
//! other 4xx responses surface immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{json, Value};

use crate::chatgate::error::{GatewayError, Result};
use crate::chatgate::providers::common::shared_http_client;

const JSONRPC_VERSION: &str = "2.0";

/// Per-call overrides; [`Default`] gives the standard policy.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Maximum retry attempts after the first try.
    pub max_retries: u32,
    pub timeout: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(30),
        }
    }
}

/// JSON-RPC client for MCP servers.
pub struct McpTransport {
    next_id: AtomicU64,
}

impl Default for McpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl McpTransport {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Invoke `method` on the server at `server_url` and return the
    /// JSON-RPC `result` field.
    pub async fn execute(
        &self,
        server_url: &str,
        method: &str,
        params: Value,
        auth_token: Option<&str>,
    ) -> Result<Value> {
        self.execute_with(server_url, method, params, auth_token, CallOptions::default())
            .await
    }

    /// [`execute`](Self::execute) with explicit retry/timeout policy.
    pub async fn execute_with(
        &self,
        server_url: &str,
        method: &str,
        params: Value,
        auth_token: Option<&str>,
        options: CallOptions,
    ) -> Result<Value> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": request_id,
            "method": method,
            "params": params,
        });

        let mut attempt = 0;
        loop {
            let mut builder = shared_http_client()
                .post(server_url)
                .timeout(options.timeout)
                .json(&payload);
            if let Some(token) = auth_token {
                builder = builder.bearer_auth(token);
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() {
                        if attempt < options.max_retries {
                            log::warn!(
                                "mcp {}: {} answered {}, retry {}/{}",
                                method,
                                server_url,
                                status,
                                attempt + 1,
                                options.max_retries
                            );
                        } else {
                            return Err(GatewayError::ToolUnavailable(format!(
                                "{server_url} answered {status} after {attempt} retries"
                            )));
                        }
                    } else if !status.is_success() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(GatewayError::ToolError {
                            code: status.as_u16() as i64,
                            message: format!("{server_url}: {status} {body}"),
                        });
                    } else {
                        let body: Value = response.json().await.map_err(|e| {
                            GatewayError::ToolError {
                                code: -32700,
                                message: format!("{server_url}: unparseable response: {e}"),
                            }
                        })?;
                        return parse_response(server_url, request_id, body);
                    }
                }
                Err(e) if attempt < options.max_retries => {
                    log::warn!(
                        "mcp {}: {} unreachable ({}), retry {}/{}",
                        method,
                        server_url,
                        e,
                        attempt + 1,
                        options.max_retries
                    );
                }
                Err(e) => {
                    return Err(GatewayError::ToolUnavailable(format!("{server_url}: {e}")));
                }
            }
            attempt += 1;
            tokio::time::sleep(Duration::from_secs_f64(1.5_f64.powi(attempt as i32))).await;
        }
    }
}

fn parse_response(server_url: &str, request_id: u64, body: Value) -> Result<Value> {
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32603);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(GatewayError::ToolError { code, message });
    }
    if let Some(id) = body.get("id").and_then(Value::as_u64) {
        if id != request_id {
            log::warn!(
                "mcp response from {} carries id {} for request {}",
                server_url,
                id,
                request_id
            );
        }
    }
    Ok(body.get("result").cloned().unwrap_or(Value::Null))
}
