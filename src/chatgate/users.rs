//! Mapping of external identities to local user rows.
//!
//! The gateway never manages credentials itself; it trusts the identity
//! provider and provisions a local row the first time a subject shows up.
//! Concurrent first requests for the same subject race on the unique
//! external-id constraint; the loser re-reads and returns the winner's
//! row.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::chatgate::auth::UserClaims;
use crate::chatgate::error::{GatewayError, Result};
use crate::chatgate::models::User;
use crate::chatgate::store::map_sqlx;

/// External id assigned when authentication is disabled.
pub const DEMO_EXTERNAL_ID: &str = "demo-user";

/// Resolves claims to a local user id, creating users on first sight.
pub struct UserResolver {
    pool: SqlitePool,
}

impl UserResolver {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Return the local id for the given claims. `None` claims means auth
    /// is disabled; the fixed demo user is returned (created on first
    /// call).
    pub async fn resolve(&self, claims: Option<&UserClaims>) -> Result<i64> {
        match claims {
            Some(claims) => self.resolve_claims(claims).await,
            None => {
                let demo = UserClaims {
                    subject: DEMO_EXTERNAL_ID.to_string(),
                    email: "demo@example.com".to_string(),
                    username: "demo".to_string(),
                    first_name: None,
                    last_name: None,
                    roles: vec!["admin".to_string()],
                    role: "admin".to_string(),
                    issued_at: None,
                    expires_at: None,
                };
                self.resolve_claims(&demo).await
            }
        }
    }

    async fn resolve_claims(&self, claims: &UserClaims) -> Result<i64> {
        if let Some(id) = self.find_by_external_id(&claims.subject).await? {
            return Ok(id);
        }
        match self.insert(claims).await {
            Ok(id) => {
                log::info!(
                    "provisioned user {} for external id {}",
                    id,
                    claims.subject
                );
                Ok(id)
            }
            Err(GatewayError::Conflict(_)) => {
                // Lost the provisioning race; the row exists now.
                self.find_by_external_id(&claims.subject)
                    .await?
                    .ok_or_else(|| {
                        GatewayError::internal(format!(
                            "user {} absent after conflicting insert",
                            claims.subject
                        ))
                    })
            }
            Err(e) => Err(e),
        }
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<i64>> {
        sqlx::query_scalar("SELECT id FROM users WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("user.find", e))
    }

    async fn insert(&self, claims: &UserClaims) -> Result<i64> {
        let now = Utc::now();
        let done = sqlx::query(
            "INSERT INTO users
                 (external_id, email, username, first_name, last_name, role, is_active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&claims.subject)
        .bind(&claims.email)
        .bind(&claims.username)
        .bind(&claims.first_name)
        .bind(&claims.last_name)
        .bind(&claims.role)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("user.insert", e))?;
        Ok(done.last_insert_rowid())
    }

    /// Load a full user row by local id.
    pub async fn get(&self, id: i64) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, external_id, email, username, first_name, last_name, role, is_active,
                    created_at, updated_at
             FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("user.get", e))?;
        use sqlx::Row;
        row.map(|row| {
            Ok(User {
                id: row.try_get("id").map_err(|e| map_sqlx("user.decode", e))?,
                external_id: row
                    .try_get("external_id")
                    .map_err(|e| map_sqlx("user.decode", e))?,
                email: row
                    .try_get("email")
                    .map_err(|e| map_sqlx("user.decode", e))?,
                username: row
                    .try_get("username")
                    .map_err(|e| map_sqlx("user.decode", e))?,
                first_name: row
                    .try_get("first_name")
                    .map_err(|e| map_sqlx("user.decode", e))?,
                last_name: row
                    .try_get("last_name")
                    .map_err(|e| map_sqlx("user.decode", e))?,
                role: row
                    .try_get("role")
                    .map_err(|e| map_sqlx("user.decode", e))?,
                is_active: row
                    .try_get::<i64, _>("is_active")
                    .map_err(|e| map_sqlx("user.decode", e))?
                    != 0,
                created_at: row
                    .try_get("created_at")
                    .map_err(|e| map_sqlx("user.decode", e))?,
                updated_at: row
                    .try_get("updated_at")
                    .map_err(|e| map_sqlx("user.decode", e))?,
            })
        })
        .transpose()
    }
}
