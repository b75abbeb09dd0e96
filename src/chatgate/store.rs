//! Durable storage for conversations and messages.
//!
//! [`ConversationStore`] wraps a `sqlx` SQLite pool it does not own; the
//! pool is injected at construction and every method manages its own
//! transaction scope. Returned values are fully materialised (messages
//! eagerly loaded), so callers can inspect them without holding any
//! database resource.
//!
//! Failure semantics: every method returns the gateway taxonomy
//! (`not_found`, `conflict`, `store_unavailable`); transient driver
//! failures are retried twice with exponential backoff before surfacing.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::chatgate::error::{GatewayError, Result};
use crate::chatgate::models::{conversation_status, role, Conversation, Message};

/// Create all tables the gateway persists into. Idempotent.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    const STATEMENTS: &[&str] = &[
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL,
            username TEXT NOT NULL,
            first_name TEXT,
            last_name TEXT,
            role TEXT NOT NULL DEFAULT 'user',
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_users_external_id ON users(external_id)",
        "CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL,
            title TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            model_name TEXT,
            system_prompt TEXT,
            data TEXT NOT NULL DEFAULT '{}',
            total_tokens INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id, updated_at)",
        "CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            raw_content TEXT,
            token_count INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at)",
        "CREATE TABLE IF NOT EXISTS approvals (
            id TEXT PRIMARY KEY,
            tool_name TEXT NOT NULL,
            arguments TEXT NOT NULL DEFAULT '{}',
            user_id INTEGER NOT NULL,
            conversation_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            requested_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            reviewer_id INTEGER,
            reviewed_at TEXT,
            review_reason TEXT,
            result TEXT,
            error TEXT,
            duration_ms INTEGER
        )",
        "CREATE INDEX IF NOT EXISTS idx_approvals_status ON approvals(status, conversation_id)",
    ];
    for sql in STATEMENTS {
        sqlx::query(sql)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx("init_schema", e))?;
    }
    Ok(())
}

/// Translate a driver error into the gateway taxonomy.
pub(crate) fn map_sqlx(context: &str, e: sqlx::Error) -> GatewayError {
    match &e {
        sqlx::Error::RowNotFound => GatewayError::NotFound(context.to_string()),
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            GatewayError::Conflict(format!("{context}: unique constraint"))
        }
        _ => {
            log::error!("{}: database error: {}", context, e);
            GatewayError::StoreUnavailable(context.to_string())
        }
    }
}

async fn backoff(attempt: u32) {
    let millis = (100.0 * 1.5_f64.powi(attempt as i32)) as u64;
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

/// Fields accepted when creating a conversation.
#[derive(Debug, Clone, Default)]
pub struct NewConversation {
    pub user_id: i64,
    pub title: String,
    pub model_name: Option<String>,
    pub system_prompt: Option<String>,
    pub data: Value,
}

/// Mutable fields accepted by [`ConversationStore::update`]. `None` leaves
/// the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct ConversationUpdate {
    pub title: Option<String>,
    pub status: Option<String>,
    pub model_name: Option<Option<String>>,
    pub system_prompt: Option<Option<String>>,
    pub data: Option<Value>,
}

/// Fields accepted when appending a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Caller-reserved id; generated when absent.
    pub id: Option<String>,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub raw_content: Option<String>,
    pub token_count: i64,
    pub data: Value,
}

/// CRUD over conversations and their messages.
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a new conversation. Fails with `not_found` when the owner
    /// does not exist.
    pub async fn create(&self, draft: NewConversation) -> Result<Conversation> {
        let mut attempt = 0;
        loop {
            match self.create_inner(&draft).await {
                Err(e) if e.is_transient() && attempt < 2 => {
                    attempt += 1;
                    backoff(attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn create_inner(&self, draft: &NewConversation) -> Result<Conversation> {
        let owner: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE id = ?")
            .bind(draft.user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("conversation.create", e))?;
        if owner.is_none() {
            return Err(GatewayError::not_found(format!(
                "user {} does not exist",
                draft.user_id
            )));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let data = if draft.data.is_null() {
            Value::Object(Default::default())
        } else {
            draft.data.clone()
        };
        sqlx::query(
            "INSERT INTO conversations
                 (id, user_id, title, status, model_name, system_prompt, data, total_tokens, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(&id)
        .bind(draft.user_id)
        .bind(&draft.title)
        .bind(conversation_status::ACTIVE)
        .bind(&draft.model_name)
        .bind(&draft.system_prompt)
        .bind(data.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("conversation.create", e))?;

        self.get_inner(&id)
            .await?
            .ok_or_else(|| GatewayError::internal("conversation vanished after insert"))
    }

    /// Fetch a conversation with all messages eagerly loaded; `None` when
    /// absent.
    pub async fn get(&self, id: &str) -> Result<Option<Conversation>> {
        let mut attempt = 0;
        loop {
            match self.get_inner(id).await {
                Err(e) if e.is_transient() && attempt < 2 => {
                    attempt += 1;
                    backoff(attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn get_inner(&self, id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("conversation.get", e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut conversation = conversation_from_row(&row)?;
        conversation.messages = self.list_messages_inner(id, i64::MAX, 0).await?;
        Ok(Some(conversation))
    }

    /// List a user's non-deleted conversations, most recently updated
    /// first. `status` may narrow to one non-deleted state.
    pub async fn list_by_user(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
        status: Option<&str>,
    ) -> Result<Vec<Conversation>> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT * FROM conversations
                     WHERE user_id = ? AND status != 'deleted' AND status = ?
                     ORDER BY updated_at DESC LIMIT ? OFFSET ?",
                )
                .bind(user_id)
                .bind(s)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM conversations
                     WHERE user_id = ? AND status != 'deleted'
                     ORDER BY updated_at DESC LIMIT ? OFFSET ?",
                )
                .bind(user_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| map_sqlx("conversation.list", e))?;
        rows.iter().map(conversation_from_row).collect()
    }

    /// Replace mutable fields; `not_found` when the id is unknown.
    pub async fn update(&self, id: &str, update: ConversationUpdate) -> Result<Conversation> {
        if let Some(status) = update.status.as_deref() {
            let valid = [
                conversation_status::ACTIVE,
                conversation_status::ARCHIVED,
                conversation_status::DELETED,
            ];
            if !valid.contains(&status) {
                return Err(GatewayError::validation(format!(
                    "invalid conversation status {status:?}"
                )));
            }
        }

        let existing = self
            .get(id)
            .await?
            .ok_or_else(|| GatewayError::not_found(format!("conversation {id}")))?;

        let title = update.title.unwrap_or(existing.title);
        let status = update.status.unwrap_or(existing.status);
        let model_name = update.model_name.unwrap_or(existing.model_name);
        let system_prompt = update.system_prompt.unwrap_or(existing.system_prompt);
        let data = update.data.unwrap_or(existing.data);

        sqlx::query(
            "UPDATE conversations
             SET title = ?, status = ?, model_name = ?, system_prompt = ?, data = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&title)
        .bind(&status)
        .bind(&model_name)
        .bind(&system_prompt)
        .bind(data.to_string())
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("conversation.update", e))?;

        self.get(id)
            .await?
            .ok_or_else(|| GatewayError::not_found(format!("conversation {id}")))
    }

    /// Soft-delete by default; hard deletion removes the row and all its
    /// messages. Returns whether the conversation existed.
    pub async fn delete(&self, id: &str, hard: bool) -> Result<bool> {
        if hard {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx("conversation.delete", e))?;
            sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx("conversation.delete", e))?;
            let done = sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx("conversation.delete", e))?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx("conversation.delete", e))?;
            Ok(done.rows_affected() > 0)
        } else {
            let done = sqlx::query(
                "UPDATE conversations SET status = ?, updated_at = ? WHERE id = ?",
            )
            .bind(conversation_status::DELETED)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("conversation.delete", e))?;
            Ok(done.rows_affected() > 0)
        }
    }

    /// Append a message, bumping the conversation's token counter and
    /// `updated_at` in the same transaction.
    pub async fn add_message(&self, draft: NewMessage) -> Result<Message> {
        if !role::ALL.contains(&draft.role.as_str()) {
            return Err(GatewayError::validation(format!(
                "invalid message role {:?}",
                draft.role
            )));
        }
        let mut attempt = 0;
        loop {
            match self.add_message_inner(&draft).await {
                Err(e) if e.is_transient() && attempt < 2 => {
                    attempt += 1;
                    backoff(attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn add_message_inner(&self, draft: &NewMessage) -> Result<Message> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx("message.add", e))?;

        let exists: Option<String> =
            sqlx::query_scalar("SELECT id FROM conversations WHERE id = ?")
                .bind(&draft.conversation_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx("message.add", e))?;
        if exists.is_none() {
            return Err(GatewayError::not_found(format!(
                "conversation {}",
                draft.conversation_id
            )));
        }

        let id = draft
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let data = if draft.data.is_null() {
            Value::Object(Default::default())
        } else {
            draft.data.clone()
        };
        sqlx::query(
            "INSERT INTO messages
                 (id, conversation_id, role, content, raw_content, token_count, data, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&draft.conversation_id)
        .bind(&draft.role)
        .bind(&draft.content)
        .bind(&draft.raw_content)
        .bind(draft.token_count)
        .bind(data.to_string())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx("message.add", e))?;

        sqlx::query(
            "UPDATE conversations
             SET total_tokens = total_tokens + ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(draft.token_count)
        .bind(now)
        .bind(&draft.conversation_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx("message.add", e))?;

        tx.commit().await.map_err(|e| map_sqlx("message.add", e))?;

        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx("message.add", e))?;
        message_from_row(&row)
    }

    /// Messages of one conversation in creation order.
    pub async fn list_messages(
        &self,
        conversation_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>> {
        self.list_messages_inner(conversation_id, limit, offset).await
    }

    async fn list_messages_inner(
        &self,
        conversation_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages
             WHERE conversation_id = ?
             ORDER BY created_at ASC, rowid ASC
             LIMIT ? OFFSET ?",
        )
        .bind(conversation_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("message.list", e))?;
        rows.iter().map(message_from_row).collect()
    }

    /// The most recent `limit` messages, returned in creation order. Used
    /// for LLM context assembly.
    pub async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages
             WHERE conversation_id = ?
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?",
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("message.recent", e))?;
        let mut messages: Vec<Message> = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Case-insensitive substring search over titles and message content,
    /// scoped to the user's non-deleted conversations.
    pub async fn search(&self, user_id: i64, query: &str, limit: i64) -> Result<Vec<Conversation>> {
        let pattern = format!("%{}%", query.to_lowercase());
        let rows = sqlx::query(
            "SELECT DISTINCT c.* FROM conversations c
             LEFT JOIN messages m ON m.conversation_id = c.id
             WHERE c.user_id = ? AND c.status != 'deleted'
               AND (LOWER(c.title) LIKE ? OR LOWER(m.content) LIKE ?)
             ORDER BY c.updated_at DESC
             LIMIT ?",
        )
        .bind(user_id)
        .bind(&pattern)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("conversation.search", e))?;
        rows.iter().map(conversation_from_row).collect()
    }

    /// One cheap round-trip, used by the health endpoint.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx("store.ping", e))?;
        Ok(())
    }
}

fn parse_data(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::Null)
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: row
            .try_get("id")
            .map_err(|e| map_sqlx("conversation.decode", e))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| map_sqlx("conversation.decode", e))?,
        title: row
            .try_get("title")
            .map_err(|e| map_sqlx("conversation.decode", e))?,
        status: row
            .try_get("status")
            .map_err(|e| map_sqlx("conversation.decode", e))?,
        model_name: row
            .try_get("model_name")
            .map_err(|e| map_sqlx("conversation.decode", e))?,
        system_prompt: row
            .try_get("system_prompt")
            .map_err(|e| map_sqlx("conversation.decode", e))?,
        data: parse_data(
            row.try_get("data")
                .map_err(|e| map_sqlx("conversation.decode", e))?,
        ),
        total_tokens: row
            .try_get("total_tokens")
            .map_err(|e| map_sqlx("conversation.decode", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| map_sqlx("conversation.decode", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| map_sqlx("conversation.decode", e))?,
        messages: Vec::new(),
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        id: row
            .try_get("id")
            .map_err(|e| map_sqlx("message.decode", e))?,
        conversation_id: row
            .try_get("conversation_id")
            .map_err(|e| map_sqlx("message.decode", e))?,
        role: row
            .try_get("role")
            .map_err(|e| map_sqlx("message.decode", e))?,
        content: row
            .try_get("content")
            .map_err(|e| map_sqlx("message.decode", e))?,
        raw_content: row
            .try_get("raw_content")
            .map_err(|e| map_sqlx("message.decode", e))?,
        token_count: row
            .try_get("token_count")
            .map_err(|e| map_sqlx("message.decode", e))?,
        data: parse_data(
            row.try_get("data")
                .map_err(|e| map_sqlx("message.decode", e))?,
        ),
        created_at: row
            .try_get("created_at")
            .map_err(|e| map_sqlx("message.decode", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| map_sqlx("message.decode", e))?,
    })
}
