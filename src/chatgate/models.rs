//! Domain types shared across the gateway.
//!
//! Message and conversation roles/statuses deliberately travel as plain
//! strings at every component boundary; the constants below are the only
//! place the accepted values are spelled out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message role strings.
pub mod role {
    pub const USER: &str = "user";
    pub const ASSISTANT: &str = "assistant";
    pub const SYSTEM: &str = "system";
    pub const TOOL: &str = "tool";

    /// All accepted role values.
    pub const ALL: [&str; 4] = [USER, ASSISTANT, SYSTEM, TOOL];
}

/// Conversation status strings.
pub mod conversation_status {
    pub const ACTIVE: &str = "active";
    pub const ARCHIVED: &str = "archived";
    pub const DELETED: &str = "deleted";
}

/// Approval status strings. Transitions follow
/// pending → {approved, rejected, expired} → executed (from approved only).
pub mod approval_status {
    pub const PENDING: &str = "pending";
    pub const APPROVED: &str = "approved";
    pub const REJECTED: &str = "rejected";
    pub const EXPIRED: &str = "expired";
    pub const EXECUTED: &str = "executed";
}

/// A locally provisioned user. Created on first authenticated access,
/// never deleted by the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    /// Identity-provider subject, unique.
    pub external_id: String,
    pub email: String,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A thread of messages owned by one user.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: i64,
    pub title: String,
    pub status: String,
    pub model_name: Option<String>,
    pub system_prompt: Option<String>,
    pub data: Value,
    pub total_tokens: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Eagerly loaded; always safe to inspect outside any transaction.
    pub messages: Vec<Message>,
}

/// One entry in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    /// Plain string, one of [`role::ALL`].
    pub role: String,
    /// What the UI shows.
    pub content: String,
    /// Pre-parse form preserving tool-call markup and thinking segments.
    /// Never exposed through the streaming protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_content: Option<String>,
    pub token_count: i64,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A message in provider wire shape: role string plus content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// Sampling parameters and optional provider-formatted tool schemas for a
/// chat call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Provider-specific tool schemas, passed through verbatim.
    pub tools: Option<Vec<Value>>,
}

/// How many tokens were spent on prompt vs. completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

impl TokenUsage {
    pub fn new(input_tokens: usize, output_tokens: usize) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// A blocking chat result: assistant text plus usage metadata.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// One model advertised by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub provider: String,
    /// `local` or `api`.
    #[serde(rename = "type")]
    pub model_type: String,
    pub context_length: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_per_1k_tokens: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

/// Ephemeral record bridging the prepare and stream phases of a chat
/// request. Serialised opaquely into the key-value store under
/// `stream:{token}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSession {
    pub conversation_id: String,
    pub user_id: i64,
    /// Whether the owner holds the admin role; carried so the stream phase
    /// needs no second credential check.
    pub is_admin: bool,
    /// Id of the user message persisted during prepare.
    pub user_message_id: String,
    /// Reserved id the assistant message will be persisted under.
    pub assistant_message_id: String,
    /// Fully assembled message list handed to the provider.
    pub llm_messages: Vec<ChatMessage>,
    pub model_name: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Provider-formatted tool schemas when tools are enabled.
    pub tools: Option<Vec<Value>>,
    pub tools_enabled: bool,
    pub auto_approve_tools: bool,
    pub created_at: DateTime<Utc>,
}

/// A pending or resolved authorisation for one tool invocation.
#[derive(Debug, Clone, Serialize)]
pub struct Approval {
    pub id: String,
    /// Qualified `server.tool` name.
    pub tool_name: String,
    /// Arguments exactly as requested.
    pub arguments: Value,
    pub user_id: i64,
    pub conversation_id: String,
    pub status: String,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reviewer_id: Option<i64>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_reason: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
}

impl Approval {
    /// Projection used by approval listings: adds the remaining decision
    /// window so clients need not compare clocks.
    pub fn to_ui_format(&self) -> Value {
        let remaining = (self.expires_at - Utc::now()).num_seconds().max(0);
        serde_json::json!({
            "approval_id": self.id,
            "tool_name": self.tool_name,
            "arguments": self.arguments,
            "user_id": self.user_id,
            "conversation_id": self.conversation_id,
            "status": self.status,
            "requested_at": self.requested_at.to_rfc3339(),
            "expires_at": self.expires_at.to_rfc3339(),
            "time_remaining_seconds": remaining,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_roles_are_plain_strings() {
        let m = ChatMessage::new(role::ASSISTANT, "hi");
        assert_eq!(m.role, "assistant");
    }

    #[test]
    fn usage_totals_add_up() {
        let u = TokenUsage::new(12, 30);
        assert_eq!(u.total_tokens, 42);
    }

    #[test]
    fn stream_session_round_trips_through_json() {
        let session = StreamSession {
            conversation_id: "c1".into(),
            user_id: 7,
            is_admin: false,
            user_message_id: "u1".into(),
            assistant_message_id: "a1".into(),
            llm_messages: vec![ChatMessage::new(role::USER, "hi")],
            model_name: "m-small".into(),
            temperature: Some(0.7),
            max_tokens: None,
            tools: None,
            tools_enabled: false,
            auto_approve_tools: false,
            created_at: Utc::now(),
        };
        let encoded = serde_json::to_string(&session).unwrap();
        let decoded: StreamSession = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.llm_messages, session.llm_messages);
        assert_eq!(decoded.assistant_message_id, "a1");
    }

    #[test]
    fn ui_projection_clamps_elapsed_windows_to_zero() {
        let a = Approval {
            id: "ap1".into(),
            tool_name: "files.read".into(),
            arguments: serde_json::json!({"path": "/tmp/x"}),
            user_id: 1,
            conversation_id: "c1".into(),
            status: approval_status::PENDING.into(),
            requested_at: Utc::now() - chrono::Duration::minutes(10),
            expires_at: Utc::now() - chrono::Duration::minutes(5),
            reviewer_id: None,
            reviewed_at: None,
            review_reason: None,
            result: None,
            error: None,
            duration_ms: None,
        };
        assert_eq!(a.to_ui_format()["time_remaining_seconds"], 0);
    }
}
