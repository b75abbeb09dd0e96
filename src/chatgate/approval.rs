//! Persisted human-in-the-loop approvals for tool execution.
//!
//! Every tool invocation that is not auto-approved produces a row in the
//! `approvals` table. Status transitions follow the DAG
//! pending → {approved, rejected, expired} → executed, with `executed`
//! reachable only from `approved`. Expiry is enforced lazily: any read of
//! a pending row past its deadline flips it to `expired` first.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::chatgate::error::{GatewayError, Result};
use crate::chatgate::models::{approval_status, Approval};
use crate::chatgate::store::map_sqlx;

/// One requested tool invocation awaiting authorisation.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub tool_name: String,
    pub arguments: Value,
    pub user_id: i64,
    pub conversation_id: String,
}

/// Store-backed approval lifecycle.
pub struct ApprovalService {
    pool: SqlitePool,
}

impl ApprovalService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a pending approval expiring after `ttl`. Returns its id.
    pub async fn request(&self, call: &ToolCallRequest, ttl: Duration) -> Result<String> {
        self.insert(call, ttl, approval_status::PENDING, None).await
    }

    /// Insert an approval that is already approved (auto-approval paths
    /// keep the audit trail without a pending phase).
    pub async fn request_pre_approved(
        &self,
        call: &ToolCallRequest,
        ttl: Duration,
    ) -> Result<String> {
        self.insert(call, ttl, approval_status::APPROVED, Some("auto-approved"))
            .await
    }

    async fn insert(
        &self,
        call: &ToolCallRequest,
        ttl: Duration,
        status: &str,
        reason: Option<&str>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(300));
        sqlx::query(
            "INSERT INTO approvals
                 (id, tool_name, arguments, user_id, conversation_id, status, requested_at, expires_at, review_reason)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&call.tool_name)
        .bind(call.arguments.to_string())
        .bind(call.user_id)
        .bind(&call.conversation_id)
        .bind(status)
        .bind(now)
        .bind(expires)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("approval.request", e))?;
        log::info!(
            "approval {} requested for {} ({})",
            id,
            call.tool_name,
            status
        );
        Ok(id)
    }

    /// Load an approval, applying lazy expiry first.
    pub async fn get(&self, id: &str) -> Result<Option<Approval>> {
        let row = sqlx::query("SELECT * FROM approvals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("approval.get", e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut approval = approval_from_row(&row)?;
        if approval.status == approval_status::PENDING && approval.expires_at < Utc::now() {
            sqlx::query("UPDATE approvals SET status = ? WHERE id = ? AND status = ?")
                .bind(approval_status::EXPIRED)
                .bind(id)
                .bind(approval_status::PENDING)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx("approval.expire", e))?;
            approval.status = approval_status::EXPIRED.to_string();
        }
        Ok(Some(approval))
    }

    /// Atomically transition pending → approved/rejected. Deciding a
    /// resolved or expired approval fails with `conflict`.
    pub async fn decide(
        &self,
        id: &str,
        reviewer_id: i64,
        approved: bool,
        reason: Option<&str>,
    ) -> Result<Approval> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| GatewayError::not_found(format!("approval {id}")))?;
        if current.status != approval_status::PENDING {
            return Err(GatewayError::conflict(format!(
                "approval {id} is already {}",
                current.status
            )));
        }
        let status = if approved {
            approval_status::APPROVED
        } else {
            approval_status::REJECTED
        };
        let done = sqlx::query(
            "UPDATE approvals
             SET status = ?, reviewer_id = ?, reviewed_at = ?, review_reason = ?
             WHERE id = ? AND status = ?",
        )
        .bind(status)
        .bind(reviewer_id)
        .bind(Utc::now())
        .bind(reason)
        .bind(id)
        .bind(approval_status::PENDING)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("approval.decide", e))?;
        if done.rows_affected() == 0 {
            // Raced with another reviewer or the expiry sweep.
            return Err(GatewayError::conflict(format!(
                "approval {id} was resolved concurrently"
            )));
        }
        log::info!("approval {} {} by user {}", id, status, reviewer_id);
        self.get(id)
            .await?
            .ok_or_else(|| GatewayError::internal("approval vanished after decision"))
    }

    /// `Some(true)` approved, `Some(false)` rejected or expired, `None`
    /// still pending.
    pub async fn check(&self, id: &str) -> Result<Option<bool>> {
        let approval = self
            .get(id)
            .await?
            .ok_or_else(|| GatewayError::not_found(format!("approval {id}")))?;
        Ok(match approval.status.as_str() {
            approval_status::PENDING => None,
            approval_status::APPROVED | approval_status::EXECUTED => Some(true),
            _ => Some(false),
        })
    }

    /// Poll until the approval leaves `pending` or `timeout` elapses;
    /// returns the status seen last. Dropping the future cancels the wait
    /// immediately.
    pub async fn wait(&self, id: &str, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let approval = self
                .get(id)
                .await?
                .ok_or_else(|| GatewayError::not_found(format!("approval {id}")))?;
            if approval.status != approval_status::PENDING {
                return Ok(approval.status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(approval.status);
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Pending approvals for one user, oldest first, after lazy expiry.
    pub async fn list_pending(&self, user_id: i64) -> Result<Vec<Approval>> {
        // Sweep anything past its deadline before reading.
        let now = Utc::now();
        let rows = sqlx::query("SELECT id, expires_at FROM approvals WHERE status = ?")
            .bind(approval_status::PENDING)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx("approval.list", e))?;
        for row in rows {
            let id: String = row.try_get("id").map_err(|e| map_sqlx("approval.list", e))?;
            let expires: chrono::DateTime<Utc> = row
                .try_get("expires_at")
                .map_err(|e| map_sqlx("approval.list", e))?;
            if expires < now {
                sqlx::query("UPDATE approvals SET status = ? WHERE id = ? AND status = ?")
                    .bind(approval_status::EXPIRED)
                    .bind(&id)
                    .bind(approval_status::PENDING)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| map_sqlx("approval.list", e))?;
            }
        }

        let rows = sqlx::query(
            "SELECT * FROM approvals
             WHERE status = ? AND user_id = ?
             ORDER BY requested_at ASC",
        )
        .bind(approval_status::PENDING)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("approval.list", e))?;
        rows.iter().map(approval_from_row).collect()
    }

    /// Transition approved → executed and store the call outcome. Calling
    /// again on an executed approval is a no-op that returns the stored
    /// row, which is what makes execution idempotent.
    pub async fn record_execution(
        &self,
        id: &str,
        result: Option<&Value>,
        error: Option<&str>,
        duration: Duration,
    ) -> Result<Approval> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| GatewayError::not_found(format!("approval {id}")))?;
        match current.status.as_str() {
            approval_status::EXECUTED => return Ok(current),
            approval_status::APPROVED => {}
            other => {
                return Err(GatewayError::conflict(format!(
                    "approval {id} is {other}, not approved"
                )))
            }
        }
        sqlx::query(
            "UPDATE approvals
             SET status = ?, result = ?, error = ?, duration_ms = ?
             WHERE id = ? AND status = ?",
        )
        .bind(approval_status::EXECUTED)
        .bind(result.map(|v| v.to_string()))
        .bind(error)
        .bind(duration.as_millis() as i64)
        .bind(id)
        .bind(approval_status::APPROVED)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("approval.execute", e))?;
        self.get(id)
            .await?
            .ok_or_else(|| GatewayError::internal("approval vanished after execution"))
    }
}

fn approval_from_row(row: &SqliteRow) -> Result<Approval> {
    let arguments: String = row
        .try_get("arguments")
        .map_err(|e| map_sqlx("approval.decode", e))?;
    let result: Option<String> = row
        .try_get("result")
        .map_err(|e| map_sqlx("approval.decode", e))?;
    Ok(Approval {
        id: row.try_get("id").map_err(|e| map_sqlx("approval.decode", e))?,
        tool_name: row
            .try_get("tool_name")
            .map_err(|e| map_sqlx("approval.decode", e))?,
        arguments: serde_json::from_str(&arguments).unwrap_or(Value::Null),
        user_id: row
            .try_get("user_id")
            .map_err(|e| map_sqlx("approval.decode", e))?,
        conversation_id: row
            .try_get("conversation_id")
            .map_err(|e| map_sqlx("approval.decode", e))?,
        status: row
            .try_get("status")
            .map_err(|e| map_sqlx("approval.decode", e))?,
        requested_at: row
            .try_get("requested_at")
            .map_err(|e| map_sqlx("approval.decode", e))?,
        expires_at: row
            .try_get("expires_at")
            .map_err(|e| map_sqlx("approval.decode", e))?,
        reviewer_id: row
            .try_get("reviewer_id")
            .map_err(|e| map_sqlx("approval.decode", e))?,
        reviewed_at: row
            .try_get("reviewed_at")
            .map_err(|e| map_sqlx("approval.decode", e))?,
        review_reason: row
            .try_get("review_reason")
            .map_err(|e| map_sqlx("approval.decode", e))?,
        result: result.and_then(|raw| serde_json::from_str(&raw).ok()),
        error: row
            .try_get("error")
            .map_err(|e| map_sqlx("approval.decode", e))?,
        duration_ms: row
            .try_get("duration_ms")
            .map_err(|e| map_sqlx("approval.decode", e))?,
    })
}
