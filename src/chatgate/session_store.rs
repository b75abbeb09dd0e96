//! Ephemeral storage for stream sessions.
//!
//! Sessions live in a shared key-value service under `stream:{token}` with
//! a short TTL; the token itself is the only credential for the stream
//! endpoint, so it is minted from 256 bits of OS entropy. The concrete
//! service sits behind [`SessionBackend`]: production uses Redis, tests
//! and single-node deployments the in-process memory backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::chatgate::error::{GatewayError, Result};
use crate::chatgate::models::StreamSession;

const KEY_PREFIX: &str = "stream:";

/// Minimal key-value surface the session store needs.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Store `value` under `key` with the given TTL.
    async fn set_ex(&self, key: &str, value: String, ttl_seconds: u64) -> Result<()>;
    /// Fetch without extending the TTL.
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Fetch and remove atomically: of any number of concurrent takers
    /// of the same key, exactly one receives the value.
    async fn take(&self, key: &str) -> Result<Option<String>>;
    /// Remove the key; removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
    /// One round-trip liveness probe.
    async fn ping(&self) -> Result<()>;
}

/// Redis-backed implementation.
pub struct RedisBackend {
    manager: redis::aio::ConnectionManager,
}

impl RedisBackend {
    /// Connect and hold a reconnecting connection manager.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GatewayError::StoreUnavailable(format!("redis url: {e}")))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| GatewayError::StoreUnavailable(format!("redis connect: {e}")))?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl SessionBackend for RedisBackend {
    async fn set_ex(&self, key: &str, value: String, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::AsyncCommands::set_ex::<_, _, ()>(&mut conn, key, value, ttl_seconds)
            .await
            .map_err(|e| GatewayError::StoreUnavailable(format!("redis set: {e}")))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        redis::AsyncCommands::get(&mut conn, key)
            .await
            .map_err(|e| GatewayError::StoreUnavailable(format!("redis get: {e}")))
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        // GETDEL (Redis 6.2+) removes the key in the same command, so
        // concurrent takers cannot both see the value.
        redis::cmd("GETDEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| GatewayError::StoreUnavailable(format!("redis getdel: {e}")))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::AsyncCommands::del::<_, ()>(&mut conn, key)
            .await
            .map_err(|e| GatewayError::StoreUnavailable(format!("redis del: {e}")))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| GatewayError::StoreUnavailable(format!("redis ping: {e}")))
    }
}

/// In-process backend with lazy expiry. TTL arithmetic uses tokio's clock
/// so paused-time tests behave deterministically.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn set_ex(&self, key: &str, value: String, ttl_seconds: u64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(ttl_seconds);
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value, deadline));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((_, deadline)) if *deadline <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        // One lock across lookup and removal: concurrent takers race on
        // the mutex, not on the key.
        let mut entries = self.entries.lock().await;
        match entries.remove(key) {
            Some((_, deadline)) if deadline <= Instant::now() => Ok(None),
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Keyed storage of [`StreamSession`] records.
pub struct StreamSessionStore {
    backend: Arc<dyn SessionBackend>,
    ttl_seconds: u64,
}

impl StreamSessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>, ttl_seconds: u64) -> Self {
        Self {
            backend,
            ttl_seconds,
        }
    }

    /// Store a session under a freshly minted token and return the token.
    ///
    /// Collisions are practically impossible at 256 bits but the mint loop
    /// still re-rolls if the key is somehow taken.
    pub async fn create(&self, session: &StreamSession) -> Result<String> {
        let encoded = serde_json::to_string(session)
            .map_err(|e| GatewayError::internal(format!("session encode: {e}")))?;
        loop {
            let token = mint_token();
            let key = format!("{KEY_PREFIX}{token}");
            if self.backend.get(&key).await?.is_some() {
                log::warn!("stream token collision, re-rolling");
                continue;
            }
            self.backend
                .set_ex(&key, encoded.clone(), self.ttl_seconds)
                .await?;
            return Ok(token);
        }
    }

    /// Fetch a session; does not extend its TTL.
    pub async fn get(&self, token: &str) -> Result<Option<StreamSession>> {
        let key = format!("{KEY_PREFIX}{token}");
        match self.backend.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| GatewayError::internal(format!("session decode: {e}"))),
            None => Ok(None),
        }
    }

    /// Fetch and remove atomically, so a token is consumed at most once
    /// even when two connects race on it.
    pub async fn consume(&self, token: &str) -> Result<Option<StreamSession>> {
        let key = format!("{KEY_PREFIX}{token}");
        match self.backend.take(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| GatewayError::internal(format!("session decode: {e}"))),
            None => Ok(None),
        }
    }

    /// Remove a session; idempotent.
    pub async fn delete(&self, token: &str) -> Result<()> {
        self.backend.delete(&format!("{KEY_PREFIX}{token}")).await
    }

    /// Backend liveness, surfaced by the health endpoint.
    pub async fn ping(&self) -> Result<()> {
        self.backend.ping().await
    }
}

fn mint_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut token = String::with_capacity(64);
    for b in bytes {
        token.push_str(&format!("{b:02x}"));
    }
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_tokens_are_long_and_unique() {
        let a = mint_token();
        let b = mint_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
