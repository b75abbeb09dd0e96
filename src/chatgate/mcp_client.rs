//! High-level MCP client: discovery, approval gating, execution.
//!
//! Composes the JSON-RPC transport, the tool registry and the approval
//! service. Discovery runs at startup (`tools/list` per configured
//! server); execution goes through `tools/call` with the bare tool name,
//! gated by an approval unless the call qualifies for auto-approval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::chatgate::approval::{ApprovalService, ToolCallRequest};
use crate::chatgate::error::{GatewayError, Result};
use crate::chatgate::mcp_transport::McpTransport;
use crate::chatgate::models::{approval_status, Approval};
use crate::chatgate::settings::McpServerConfig;
use crate::chatgate::tool_registry::{ToolDescriptor, ToolRegistry};

/// Outcome of a tool execution request.
#[derive(Debug, Clone)]
pub enum ToolExecution {
    /// Ran (auto-approved or already approved) and succeeded.
    Executed {
        approval_id: String,
        result: Value,
        duration_ms: i64,
    },
    /// Ran but the server reported a failure.
    Failed {
        approval_id: String,
        error: String,
    },
    /// Awaiting a human decision.
    PendingApproval { approval_id: String },
}

pub struct McpClient {
    transport: McpTransport,
    registry: Arc<ToolRegistry>,
    approvals: Arc<ApprovalService>,
    servers: Vec<McpServerConfig>,
    approval_ttl: Duration,
}

impl McpClient {
    pub fn new(
        registry: Arc<ToolRegistry>,
        approvals: Arc<ApprovalService>,
        servers: Vec<McpServerConfig>,
        approval_ttl: Duration,
    ) -> Self {
        Self {
            transport: McpTransport::new(),
            registry,
            approvals,
            servers,
            approval_ttl,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn approvals(&self) -> &Arc<ApprovalService> {
        &self.approvals
    }

    pub fn servers(&self) -> &[McpServerConfig] {
        &self.servers
    }

    /// Discover tools from every enabled server and register them. A
    /// server that fails discovery is logged and skipped; the gateway
    /// still starts.
    pub async fn initialize(&self) {
        for server in self.servers.iter().filter(|s| s.enabled) {
            match self
                .transport
                .execute(
                    &server.base_url,
                    "tools/list",
                    json!({}),
                    server.auth_token.as_deref(),
                )
                .await
            {
                Ok(result) => {
                    let raw_tools: Vec<Value> = result
                        .get("tools")
                        .and_then(Value::as_array)
                        .cloned()
                        .or_else(|| result.as_array().cloned())
                        .unwrap_or_default();
                    let (count, failures) =
                        self.registry.register(&server.name, &raw_tools).await;
                    if !failures.is_empty() {
                        log::warn!(
                            "{}: {} tool definition(s) rejected: {}",
                            server.name,
                            failures.len(),
                            failures.join("; ")
                        );
                    }
                    log::info!("discovered {} tool(s) on {}", count, server.name);
                }
                Err(e) => {
                    log::warn!("tool discovery on {} failed: {}", server.name, e);
                }
            }
        }
    }

    fn server_for(&self, descriptor: &ToolDescriptor) -> Result<&McpServerConfig> {
        let server = self
            .servers
            .iter()
            .find(|s| s.name == descriptor.server)
            .ok_or_else(|| {
                GatewayError::ToolUnavailable(format!(
                    "server {} is not configured",
                    descriptor.server
                ))
            })?;
        if !server.enabled {
            return Err(GatewayError::ToolUnavailable(format!(
                "server {} is disabled",
                descriptor.server
            )));
        }
        Ok(server)
    }

    /// Request execution of `tool_name`. When the call qualifies for
    /// auto-approval it runs immediately; otherwise a pending approval is
    /// recorded and returned for out-of-band resolution.
    pub async fn execute_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        user_id: i64,
        conversation_id: &str,
        auto_approve: bool,
    ) -> Result<ToolExecution> {
        let descriptor = self
            .registry
            .get(tool_name)
            .await
            .ok_or_else(|| GatewayError::ToolNotFound(tool_name.to_string()))?;
        let server = self.server_for(&descriptor)?;

        let problems = self
            .registry
            .validate_arguments(&descriptor.qualified_name, &arguments)
            .await?;
        if !problems.is_empty() {
            return Err(GatewayError::validation(problems.join("; ")));
        }

        let call = ToolCallRequest {
            tool_name: descriptor.qualified_name.clone(),
            arguments: arguments.clone(),
            user_id,
            conversation_id: conversation_id.to_string(),
        };

        let auto = auto_approve
            || server.auto_approve_tools.iter().any(|allowed| {
                allowed == &descriptor.name || allowed == &descriptor.qualified_name
            });
        if !auto {
            let approval_id = self.approvals.request(&call, self.approval_ttl).await?;
            return Ok(ToolExecution::PendingApproval { approval_id });
        }

        let approval_id = self
            .approvals
            .request_pre_approved(&call, self.approval_ttl)
            .await?;
        self.run_recorded(&approval_id, &descriptor, &arguments).await
    }

    /// Execute a previously approved call. Replays the stored outcome when
    /// the approval was already executed.
    pub async fn execute_approved(&self, approval_id: &str) -> Result<ToolExecution> {
        let approval = self
            .approvals
            .get(approval_id)
            .await?
            .ok_or_else(|| GatewayError::not_found(format!("approval {approval_id}")))?;
        match approval.status.as_str() {
            approval_status::EXECUTED => Ok(replay(&approval)),
            approval_status::APPROVED => {
                let descriptor = self
                    .registry
                    .get(&approval.tool_name)
                    .await
                    .ok_or_else(|| GatewayError::ToolNotFound(approval.tool_name.clone()))?;
                self.run_recorded(approval_id, &descriptor, &approval.arguments)
                    .await
            }
            other => Err(GatewayError::conflict(format!(
                "approval {approval_id} is {other}, not approved"
            ))),
        }
    }

    /// Block until the approval is resolved or `timeout` elapses.
    pub async fn wait_for_approval(&self, approval_id: &str, timeout: Duration) -> Result<String> {
        self.approvals.wait(approval_id, timeout).await
    }

    async fn run_recorded(
        &self,
        approval_id: &str,
        descriptor: &ToolDescriptor,
        arguments: &Value,
    ) -> Result<ToolExecution> {
        let server = self.server_for(descriptor)?;
        let started = Instant::now();
        let outcome = self
            .transport
            .execute(
                &server.base_url,
                "tools/call",
                json!({"name": descriptor.name, "arguments": arguments}),
                server.auth_token.as_deref(),
            )
            .await;
        let duration = started.elapsed();

        match outcome {
            Ok(result) => {
                self.approvals
                    .record_execution(approval_id, Some(&result), None, duration)
                    .await?;
                log::info!(
                    "tool {} executed in {} ms",
                    descriptor.qualified_name,
                    duration.as_millis()
                );
                Ok(ToolExecution::Executed {
                    approval_id: approval_id.to_string(),
                    result,
                    duration_ms: duration.as_millis() as i64,
                })
            }
            Err(e) => {
                let message = e.to_string();
                self.approvals
                    .record_execution(approval_id, None, Some(&message), duration)
                    .await?;
                log::warn!("tool {} failed: {}", descriptor.qualified_name, message);
                Ok(ToolExecution::Failed {
                    approval_id: approval_id.to_string(),
                    error: message,
                })
            }
        }
    }
}

fn replay(approval: &Approval) -> ToolExecution {
    match (&approval.result, &approval.error) {
        (_, Some(error)) => ToolExecution::Failed {
            approval_id: approval.id.clone(),
            error: error.clone(),
        },
        (result, None) => ToolExecution::Executed {
            approval_id: approval.id.clone(),
            result: result.clone().unwrap_or(Value::Null),
            duration_ms: approval.duration_ms.unwrap_or(0),
        },
    }
}
