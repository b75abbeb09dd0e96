//! Bearer-token validation against an OIDC identity provider.
//!
//! [`TokenValidator`] fetches the provider's JWKS document, caches the key
//! set for the process lifetime (refreshing once when an unknown `kid`
//! shows up), and checks signature, expiry, issuer and audience. The
//! issuer is compared against the externally visible provider URL, which
//! may differ from the URL used to reach the JWKS endpoint inside the
//! deployment network.
//!
//! Validation never surfaces an error to callers: any malformed header,
//! unsupported algorithm, unknown key id or failed check yields `None`.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::chatgate::providers::common::shared_http_client;

/// Claims extracted from a validated bearer token.
#[derive(Debug, Clone)]
pub struct UserClaims {
    /// Identity-provider subject id.
    pub subject: String,
    pub email: String,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub roles: Vec<String>,
    /// Primary role: `admin` when present in the role list, else `user`.
    pub role: String,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl UserClaims {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
    /// Symmetric key material for `oct` keys, base64url encoded.
    #[serde(default)]
    k: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    given_name: Option<String>,
    #[serde(default)]
    family_name: Option<String>,
    #[serde(default)]
    realm_access: Option<RealmAccess>,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    exp: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RealmAccess {
    #[serde(default)]
    roles: Vec<String>,
}

/// Validates bearer credentials and maps them to [`UserClaims`].
pub struct TokenValidator {
    jwks_url: String,
    issuer: String,
    audience: String,
    keys: RwLock<HashMap<String, Jwk>>,
}

impl TokenValidator {
    /// `jwks_base_url` is the identity provider URL reachable from this
    /// process; `issuer` the externally visible one carried in tokens.
    pub fn new(jwks_base_url: &str, issuer: &str, audience: &str) -> Self {
        Self {
            jwks_url: format!(
                "{}/protocol/openid-connect/certs",
                jwks_base_url.trim_end_matches('/')
            ),
            issuer: issuer.to_string(),
            audience: audience.to_string(),
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Pre-seed the key cache from a JWKS document. Tests and offline
    /// deployments use this instead of network retrieval.
    pub async fn install_jwks(&self, document: serde_json::Value) {
        if let Ok(doc) = serde_json::from_value::<JwksDocument>(document) {
            let mut keys = self.keys.write().await;
            for key in doc.keys {
                let kid = key.kid.clone().unwrap_or_default();
                keys.insert(kid, key);
            }
        }
    }

    /// Validate a bearer token. Returns claims on success, `None` on any
    /// failure.
    pub async fn validate(&self, token: &str) -> Option<UserClaims> {
        let header = match decode_header(token) {
            Ok(h) => h,
            Err(e) => {
                log::debug!("rejecting token with malformed header: {}", e);
                return None;
            }
        };
        if !matches!(header.alg, Algorithm::RS256 | Algorithm::HS256) {
            log::debug!("rejecting token with unsupported algorithm {:?}", header.alg);
            return None;
        }

        let kid = header.kid.unwrap_or_default();
        let jwk = match self.key_for(&kid).await {
            Some(jwk) => jwk,
            None => {
                log::debug!("no JWKS entry for kid {:?}", kid);
                return None;
            }
        };
        let key = decoding_key_for(&jwk)?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);

        let data = match decode::<RawClaims>(token, &key, &validation) {
            Ok(data) => data,
            Err(e) => {
                log::debug!("token failed validation: {}", e);
                return None;
            }
        };

        Some(into_user_claims(data.claims))
    }

    async fn key_for(&self, kid: &str) -> Option<Jwk> {
        if let Some(jwk) = self.keys.read().await.get(kid) {
            return Some(jwk.clone());
        }
        // Unknown kid: the provider may have rotated keys. Refresh once.
        self.refresh_jwks().await;
        self.keys.read().await.get(kid).cloned()
    }

    async fn refresh_jwks(&self) {
        let response = match shared_http_client().get(&self.jwks_url).send().await {
            Ok(r) => r,
            Err(e) => {
                log::warn!("JWKS fetch from {} failed: {}", self.jwks_url, e);
                return;
            }
        };
        match response.json::<JwksDocument>().await {
            Ok(doc) => {
                let mut keys = self.keys.write().await;
                for key in doc.keys {
                    let kid = key.kid.clone().unwrap_or_default();
                    keys.insert(kid, key);
                }
                log::info!("JWKS refreshed, {} key(s) cached", keys.len());
            }
            Err(e) => log::warn!("JWKS document from {} is malformed: {}", self.jwks_url, e),
        }
    }
}

fn decoding_key_for(jwk: &Jwk) -> Option<DecodingKey> {
    match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk.n.as_deref()?;
            let e = jwk.e.as_deref()?;
            DecodingKey::from_rsa_components(n, e).ok()
        }
        "oct" => {
            let secret = URL_SAFE_NO_PAD.decode(jwk.k.as_deref()?).ok()?;
            Some(DecodingKey::from_secret(&secret))
        }
        other => {
            log::debug!("unsupported JWKS key type {:?}", other);
            None
        }
    }
}

fn into_user_claims(raw: RawClaims) -> UserClaims {
    let roles = raw.realm_access.unwrap_or_default().roles;
    let role = if roles.iter().any(|r| r == "admin") {
        "admin".to_string()
    } else {
        "user".to_string()
    };
    let username = raw
        .preferred_username
        .or_else(|| raw.email.clone())
        .unwrap_or_else(|| raw.sub.clone());
    UserClaims {
        email: raw.email.unwrap_or_else(|| format!("{}@unknown", raw.sub)),
        username,
        first_name: raw.given_name,
        last_name: raw.family_name,
        roles,
        role,
        issued_at: raw.iat.and_then(|t| Utc.timestamp_opt(t, 0).single()),
        expires_at: raw.exp.and_then(|t| Utc.timestamp_opt(t, 0).single()),
        subject: raw.sub,
    }
}
