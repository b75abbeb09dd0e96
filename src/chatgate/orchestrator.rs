//! Two-phase streaming chat orchestration.
//!
//! **Prepare** performs every durable write up front: it authorises the
//! caller, persists the user message, assembles the provider message
//! list, reserves the assistant-message id and parks everything in a
//! [`StreamSession`]. **Stream** then consumes the session token exactly
//! once and only talks to the provider and the event channel; the
//! assistant message is written by a detached persistence task after the
//! stream ends, so the streaming path itself never touches the
//! conversation store.
//!
//! Event order within one stream: `stream_start`, `user_message`,
//! `assistant_message_start`, (`tools_available`,) `content_chunk`*,
//! tool events interleaved as markers complete, `assistant_message_complete`,
//! `done`. A client disconnect stops emission but the provider stream is
//! drained and the partial message persisted with a truncation flag.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::chatgate::error::{GatewayError, Result};
use crate::chatgate::mcp_client::{McpClient, ToolExecution};
use crate::chatgate::model_registry::ModelRegistry;
use crate::chatgate::models::{
    role, ChatMessage, ChatParams, Conversation, StreamSession,
};
use crate::chatgate::session_store::StreamSessionStore;
use crate::chatgate::store::{ConversationStore, NewMessage};
use crate::chatgate::stream_parser::{parse_ai_content, StreamItem, ToolCallScanner};

/// Tunables injected from settings at startup.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How many recent messages feed the provider context.
    pub context_message_limit: i64,
    pub default_system_prompt: String,
    pub enable_thinking_mode: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            context_message_limit: 20,
            default_system_prompt: "You are a helpful assistant.".to_string(),
            enable_thinking_mode: true,
        }
    }
}

/// Body of a prepare request.
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub message: String,
    /// Explicit model; falls back to the conversation's model.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Tool configuration for an MCP-enabled stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolOptions {
    pub enabled: bool,
    pub auto_approve: bool,
}

/// What prepare hands back to the client.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PreparedStream {
    pub stream_token: String,
    pub stream_url: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub conversation_id: String,
}

/// Result of a non-persisted pass-through chat call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DirectReply {
    pub text: String,
    pub model: String,
    pub response_time_ms: u64,
}

/// Reject access to a conversation the caller does not own, unless the
/// caller is an administrator.
pub fn ensure_owner(conversation: &Conversation, user_id: i64, is_admin: bool) -> Result<()> {
    if conversation.user_id == user_id || is_admin {
        Ok(())
    } else {
        Err(GatewayError::AuthForbidden(format!(
            "conversation {} belongs to another user",
            conversation.id
        )))
    }
}

pub struct ChatOrchestrator {
    store: Arc<ConversationStore>,
    sessions: Arc<StreamSessionStore>,
    registry: Arc<ModelRegistry>,
    mcp: Option<Arc<McpClient>>,
    config: OrchestratorConfig,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<ConversationStore>,
        sessions: Arc<StreamSessionStore>,
        registry: Arc<ModelRegistry>,
        mcp: Option<Arc<McpClient>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            sessions,
            registry,
            mcp,
            config,
        }
    }

    /// Resolve the provider for `model`, refreshing the index once before
    /// giving up.
    async fn resolve_provider(&self, model: &str) -> Result<String> {
        if let Some(provider) = self.registry.get_provider_for(model).await {
            return Ok(provider);
        }
        self.registry.refresh().await;
        self.registry
            .get_provider_for(model)
            .await
            .ok_or_else(|| GatewayError::ModelNotFound(model.to_string()))
    }

    /// Phase one: persist the user message, assemble context, reserve the
    /// assistant id and park a [`StreamSession`]. Everything that mutates
    /// durable state happens here.
    pub async fn prepare_stream(
        &self,
        user_id: i64,
        is_admin: bool,
        conversation_id: &str,
        request: PrepareRequest,
        tools: ToolOptions,
    ) -> Result<PreparedStream> {
        if request.message.trim().is_empty() {
            return Err(GatewayError::validation("message must not be empty"));
        }

        let conversation = self
            .store
            .get(conversation_id)
            .await?
            .filter(|c| c.status != "deleted")
            .ok_or_else(|| GatewayError::not_found(format!("conversation {conversation_id}")))?;
        ensure_owner(&conversation, user_id, is_admin)?;

        let model = request
            .model
            .clone()
            .or_else(|| conversation.model_name.clone())
            .ok_or_else(|| GatewayError::validation("no model selected"))?;
        let provider = self.resolve_provider(&model).await?;

        // Context: system prompt, then recent history, then the new turn.
        let history = self
            .store
            .recent_messages(conversation_id, self.config.context_message_limit)
            .await?;
        let system_prompt = conversation
            .system_prompt
            .clone()
            .unwrap_or_else(|| self.config.default_system_prompt.clone());
        let mut llm_messages = Vec::with_capacity(history.len() + 2);
        if !system_prompt.trim().is_empty() {
            llm_messages.push(ChatMessage::new(role::SYSTEM, system_prompt));
        }
        for message in &history {
            llm_messages.push(ChatMessage::new(&message.role, message.content.clone()));
        }
        llm_messages.push(ChatMessage::new(role::USER, request.message.clone()));

        if let Some(descriptor) = self.registry.descriptor_for(&model).await {
            let mut current_tokens = 0usize;
            for message in &llm_messages {
                current_tokens += self.registry.count_tokens(&model, &message.content).await;
            }
            let limit = descriptor.context_length as usize;
            if current_tokens > limit {
                return Err(GatewayError::ContextLimit {
                    model: model.clone(),
                    current_tokens,
                    limit,
                });
            }
        }

        let user_message_id = Uuid::new_v4().to_string();
        let user_tokens = self.registry.count_tokens(&model, &request.message).await;
        self.store
            .add_message(NewMessage {
                id: Some(user_message_id.clone()),
                conversation_id: conversation_id.to_string(),
                role: role::USER.to_string(),
                content: request.message.clone(),
                raw_content: None,
                token_count: user_tokens as i64,
                data: json!({"model": model}),
            })
            .await?;

        let assistant_message_id = Uuid::new_v4().to_string();

        let formatted_tools = if tools.enabled {
            match &self.mcp {
                Some(mcp) => {
                    let formatted = mcp
                        .registry()
                        .format_for_provider(tool_style_for(&provider))
                        .await;
                    (!formatted.is_empty()).then_some(formatted)
                }
                None => None,
            }
        } else {
            None
        };

        let session = StreamSession {
            conversation_id: conversation_id.to_string(),
            user_id,
            is_admin,
            user_message_id: user_message_id.clone(),
            assistant_message_id: assistant_message_id.clone(),
            llm_messages,
            model_name: model,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            tools: formatted_tools,
            tools_enabled: tools.enabled,
            auto_approve_tools: tools.auto_approve,
            created_at: Utc::now(),
        };
        let stream_token = self.sessions.create(&session).await?;
        let stream_url = if tools.enabled {
            format!("/stream/mcp/{stream_token}")
        } else {
            format!("/stream/{stream_token}")
        };
        log::info!(
            "prepared stream for conversation {} (model {}, tools {})",
            conversation_id,
            session.model_name,
            tools.enabled
        );

        Ok(PreparedStream {
            stream_token,
            stream_url,
            user_message_id,
            assistant_message_id,
            conversation_id: conversation_id.to_string(),
        })
    }

    /// Phase two: consume the token and run the stream. The returned
    /// receiver yields one JSON event per SSE frame; it closes after the
    /// final `done` event.
    pub async fn stream(&self, token: &str) -> Result<ReceiverStream<Value>> {
        let session = self
            .sessions
            .consume(token)
            .await?
            .ok_or_else(|| GatewayError::not_found("stream session"))?;

        let (tx, rx) = mpsc::channel::<Value>(64);
        let task = StreamTask {
            store: self.store.clone(),
            registry: self.registry.clone(),
            mcp: self.mcp.clone(),
            config: self.config.clone(),
            session,
        };
        tokio::spawn(task.run(tx));
        Ok(ReceiverStream::new(rx))
    }

    /// Ad-hoc one-shot chat that bypasses conversations and sessions
    /// entirely.
    pub async fn direct_chat(
        &self,
        message: &str,
        model: &str,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<DirectReply> {
        if message.trim().is_empty() {
            return Err(GatewayError::validation("message must not be empty"));
        }
        let started = Instant::now();
        let reply = self
            .registry
            .chat(
                model,
                &[ChatMessage::new(role::USER, message)],
                &ChatParams {
                    temperature,
                    max_tokens,
                    tools: None,
                },
            )
            .await?;
        Ok(DirectReply {
            text: reply.content,
            model: reply.model,
            response_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Streaming sibling of [`direct_chat`](Self::direct_chat): no
    /// conversation, no session, no persistence. Emits `content_chunk`
    /// events followed by `assistant_message_complete` and `done`.
    pub async fn direct_chat_stream(
        &self,
        message: &str,
        model: &str,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<ReceiverStream<Value>> {
        if message.trim().is_empty() {
            return Err(GatewayError::validation("message must not be empty"));
        }
        let mut chunks = self
            .registry
            .chat_stream(
                model,
                &[ChatMessage::new(role::USER, message)],
                &ChatParams {
                    temperature,
                    max_tokens,
                    tools: None,
                },
            )
            .await?;
        let registry = self.registry.clone();
        let model = model.to_string();

        let (tx, rx) = mpsc::channel::<Value>(64);
        tokio::spawn(async move {
            use futures_util::StreamExt;
            let mut full = String::new();
            while let Some(next) = chunks.next().await {
                match next {
                    Ok(chunk) => {
                        if chunk.content.is_empty() {
                            continue;
                        }
                        full.push_str(&chunk.content);
                        if tx
                            .send(json!({"type": "content_chunk", "content": chunk.content}))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(json!({"type": "error", "message": e.to_string()}))
                            .await;
                        break;
                    }
                }
            }
            let token_count = registry.count_tokens(&model, &full).await;
            let _ = tx
                .send(json!({
                    "type": "assistant_message_complete",
                    "message": {
                        "role": role::ASSISTANT,
                        "content": full,
                        "token_count": token_count,
                        "created_at": Utc::now().to_rfc3339(),
                    }
                }))
                .await;
            let _ = tx.send(json!({"type": "done"})).await;
        });
        Ok(ReceiverStream::new(rx))
    }
}

/// Tool formatting style for a provider name.
fn tool_style_for(provider: &str) -> &str {
    match provider {
        "openai" | "anthropic" | "ollama" => provider,
        _ => "generic",
    }
}

/// Everything the detached stream task needs, cloned out of the
/// orchestrator so the task outlives the request handler.
struct StreamTask {
    store: Arc<ConversationStore>,
    registry: Arc<ModelRegistry>,
    mcp: Option<Arc<McpClient>>,
    config: OrchestratorConfig,
    session: StreamSession,
}

/// A sender that degrades to a no-op once the client goes away, so the
/// provider stream can be drained regardless.
struct EventSink {
    tx: mpsc::Sender<Value>,
    connected: bool,
}

impl EventSink {
    async fn emit(&mut self, event: Value) {
        if self.connected && self.tx.send(event).await.is_err() {
            log::debug!("stream client disconnected; draining without emission");
            self.connected = false;
        }
    }
}

impl StreamTask {
    async fn run(self, tx: mpsc::Sender<Value>) {
        let session = &self.session;
        let mut sink = EventSink {
            tx,
            connected: true,
        };

        sink.emit(json!({
            "type": "stream_start",
            "conversation_id": session.conversation_id,
        }))
        .await;

        let user_content = session
            .llm_messages
            .iter()
            .rev()
            .find(|m| m.role == role::USER)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        sink.emit(json!({
            "type": "user_message",
            "message": {
                "id": session.user_message_id,
                "role": role::USER,
                "content": user_content,
                "created_at": Utc::now().to_rfc3339(),
            }
        }))
        .await;

        sink.emit(json!({
            "type": "assistant_message_start",
            "message_id": session.assistant_message_id,
        }))
        .await;

        if session.tools_enabled {
            if let Some(tools) = &session.tools {
                let preview: Vec<Value> = tools
                    .iter()
                    .take(5)
                    .map(|tool| {
                        json!({
                            "name": tool_name_of(tool),
                            "description": tool_description_of(tool),
                        })
                    })
                    .collect();
                sink.emit(json!({"type": "tools_available", "tools": preview}))
                    .await;
            }
        }

        let params = ChatParams {
            temperature: session.temperature,
            max_tokens: session.max_tokens,
            tools: session.tools_enabled.then(|| session.tools.clone()).flatten(),
        };
        let mut chunks = match self
            .registry
            .chat_stream(&session.model_name, &session.llm_messages, &params)
            .await
        {
            Ok(chunks) => chunks,
            Err(e) => {
                log::error!(
                    "stream for conversation {} failed to start: {}",
                    session.conversation_id,
                    e
                );
                sink.emit(json!({"type": "error", "message": e.to_string()}))
                    .await;
                sink.emit(json!({"type": "done"})).await;
                return;
            }
        };

        let mut full_raw = String::new();
        let mut visible = String::new();
        let mut tool_calls: Vec<Value> = Vec::new();
        let mut scanner = ToolCallScanner::new();
        let mut stream_failed = false;

        use futures_util::StreamExt;
        while let Some(next) = chunks.next().await {
            let chunk = match next {
                Ok(chunk) => chunk,
                Err(e) => {
                    log::warn!(
                        "stream for conversation {} broke mid-flight: {}",
                        session.conversation_id,
                        e
                    );
                    sink.emit(json!({"type": "error", "message": e.to_string()}))
                        .await;
                    stream_failed = true;
                    break;
                }
            };
            if chunk.content.is_empty() {
                continue;
            }
            full_raw.push_str(&chunk.content);

            if session.tools_enabled {
                for item in scanner.push(&chunk.content) {
                    self.handle_item(item, &mut sink, &mut visible, &mut tool_calls)
                        .await;
                }
            } else {
                visible.push_str(&chunk.content);
                sink.emit(json!({
                    "type": "content_chunk",
                    "message_id": session.assistant_message_id,
                    "content": chunk.content,
                }))
                .await;
            }
        }

        if session.tools_enabled {
            if let Some(item) = scanner.finish() {
                self.handle_item(item, &mut sink, &mut visible, &mut tool_calls)
                    .await;
            }
        }

        let parsed = parse_ai_content(&visible, self.config.enable_thinking_mode);
        let output_tokens = self
            .registry
            .count_tokens(&session.model_name, &full_raw)
            .await;
        let mut input_tokens = 0usize;
        for message in &session.llm_messages {
            input_tokens += self
                .registry
                .count_tokens(&session.model_name, &message.content)
                .await;
        }

        sink.emit(json!({
            "type": "assistant_message_complete",
            "message": {
                "id": session.assistant_message_id,
                "role": role::ASSISTANT,
                "content": parsed.processed,
                "created_at": Utc::now().to_rfc3339(),
                "token_count": output_tokens,
            }
        }))
        .await;

        // Persistence runs detached: the stream endpoint itself never
        // writes to the conversation store.
        let truncated = !sink.connected || stream_failed;
        let mut data = json!({
            "model": session.model_name,
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
            "truncated": truncated,
        });
        if !tool_calls.is_empty() {
            data["tool_calls"] = json!(tool_calls);
        }
        if let Some(thinking) = &parsed.thinking {
            data["thinking_content"] = json!(thinking);
        }
        let store = self.store.clone();
        let draft = NewMessage {
            id: Some(session.assistant_message_id.clone()),
            conversation_id: session.conversation_id.clone(),
            role: role::ASSISTANT.to_string(),
            content: parsed.processed.clone(),
            raw_content: Some(full_raw),
            token_count: output_tokens as i64,
            data,
        };
        tokio::spawn(async move {
            if let Err(e) = store.add_message(draft).await {
                log::error!("failed to persist assistant message: {}", e);
            }
        });

        sink.emit(json!({"type": "done"})).await;
    }

    async fn handle_item(
        &self,
        item: StreamItem,
        sink: &mut EventSink,
        visible: &mut String,
        tool_calls: &mut Vec<Value>,
    ) {
        let session = &self.session;
        match item {
            StreamItem::Text(text) => {
                visible.push_str(&text);
                sink.emit(json!({
                    "type": "content_chunk",
                    "message_id": session.assistant_message_id,
                    "content": text,
                }))
                .await;
            }
            StreamItem::ToolCall(body) => {
                sink.emit(json!({"type": "tool_call_detected", "tool_call": body}))
                    .await;

                let parsed: Option<(String, Value)> = serde_json::from_str::<Value>(&body)
                    .ok()
                    .and_then(|call| {
                        let name = call.get("name")?.as_str()?.to_string();
                        let arguments =
                            call.get("arguments").cloned().unwrap_or_else(|| json!({}));
                        Some((name, arguments))
                    });
                let Some((tool_name, arguments)) = parsed else {
                    log::warn!("unparseable tool call body: {}", body);
                    return;
                };

                let Some(mcp) = &self.mcp else {
                    log::warn!("tool call {} with no MCP client configured", tool_name);
                    return;
                };

                if session.auto_approve_tools {
                    sink.emit(json!({"type": "tool_executing", "tool_name": tool_name}))
                        .await;
                    match mcp
                        .execute_tool(
                            &tool_name,
                            arguments,
                            session.user_id,
                            &session.conversation_id,
                            true,
                        )
                        .await
                    {
                        Ok(ToolExecution::Executed {
                            approval_id,
                            result,
                            duration_ms,
                        }) => {
                            sink.emit(json!({"type": "tool_result", "result": result}))
                                .await;
                            tool_calls.push(json!({
                                "tool_name": tool_name,
                                "approval_id": approval_id,
                                "status": "executed",
                                "duration_ms": duration_ms,
                            }));
                        }
                        Ok(ToolExecution::Failed { approval_id, error }) => {
                            sink.emit(json!({"type": "tool_result", "result": {"error": error}}))
                                .await;
                            tool_calls.push(json!({
                                "tool_name": tool_name,
                                "approval_id": approval_id,
                                "status": "failed",
                            }));
                        }
                        Ok(ToolExecution::PendingApproval { approval_id }) => {
                            // Auto-approve was requested, so this branch
                            // means server config overruled it.
                            sink.emit(json!({
                                "type": "tool_approval_required",
                                "tool_name": tool_name,
                                "approval_id": approval_id,
                            }))
                            .await;
                            tool_calls.push(json!({
                                "tool_name": tool_name,
                                "approval_id": approval_id,
                                "status": "pending",
                            }));
                        }
                        Err(e) => {
                            log::warn!("tool {} execution failed: {}", tool_name, e);
                            sink.emit(json!({"type": "tool_result", "result": {"error": e.to_string()}}))
                                .await;
                        }
                    }
                } else {
                    match mcp
                        .execute_tool(
                            &tool_name,
                            arguments,
                            session.user_id,
                            &session.conversation_id,
                            false,
                        )
                        .await
                    {
                        Ok(ToolExecution::PendingApproval { approval_id }) => {
                            sink.emit(json!({
                                "type": "tool_approval_required",
                                "tool_name": tool_name,
                                "approval_id": approval_id,
                            }))
                            .await;
                            tool_calls.push(json!({
                                "tool_name": tool_name,
                                "approval_id": approval_id,
                                "status": "pending",
                            }));
                        }
                        Ok(ToolExecution::Executed {
                            approval_id,
                            result,
                            duration_ms,
                        }) => {
                            // Server-side auto-approval list fired.
                            sink.emit(json!({"type": "tool_result", "result": result}))
                                .await;
                            tool_calls.push(json!({
                                "tool_name": tool_name,
                                "approval_id": approval_id,
                                "status": "executed",
                                "duration_ms": duration_ms,
                            }));
                        }
                        Ok(ToolExecution::Failed { approval_id, error }) => {
                            sink.emit(json!({"type": "tool_result", "result": {"error": error}}))
                                .await;
                            tool_calls.push(json!({
                                "tool_name": tool_name,
                                "approval_id": approval_id,
                                "status": "failed",
                            }));
                        }
                        Err(e) => {
                            log::warn!("tool {} request failed: {}", tool_name, e);
                            sink.emit(json!({
                                "type": "error",
                                "message": format!("tool {tool_name}: {e}"),
                            }))
                            .await;
                        }
                    }
                }
            }
        }
    }
}

fn tool_name_of(tool: &Value) -> String {
    tool.get("function")
        .and_then(|f| f.get("name"))
        .or_else(|| tool.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

fn tool_description_of(tool: &Value) -> String {
    tool.get("function")
        .and_then(|f| f.get("description"))
        .or_else(|| tool.get("description"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
