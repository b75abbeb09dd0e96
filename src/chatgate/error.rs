//! Error taxonomy shared by every gateway component.
//!
//! Components translate foreign errors (database driver, HTTP client,
//! key-value client, provider wire formats) into [`GatewayError`] at their
//! boundary; nothing above the adapter layer ever sees a raw driver error.
//! The HTTP surface owns the single mapping from these variants to status
//! codes and response bodies.

use thiserror::Error;

/// Result type alias used across the gateway.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// The gateway-wide error type.
///
/// Variant names mirror the wire-level `error.type` strings, see
/// [`GatewayError::kind`].
#[derive(Error, Debug)]
pub enum GatewayError {
    /// No bearer credential was presented on a protected route.
    #[error("authentication required")]
    AuthMissing,

    /// The presented credential failed validation.
    #[error("invalid credentials: {0}")]
    AuthInvalid(String),

    /// The caller is authenticated but not allowed to touch the resource.
    #[error("forbidden: {0}")]
    AuthForbidden(String),

    /// Entity does not exist (or is invisible to the caller).
    #[error("not found: {0}")]
    NotFound(String),

    /// Request payload failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// State transition raced or repeated, e.g. deciding a resolved approval.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Assembled prompt exceeds the model's context window.
    #[error("context limit exceeded for {model}: {current_tokens} > {limit}")]
    ContextLimit {
        model: String,
        current_tokens: usize,
        limit: usize,
    },

    /// No registered provider advertises the requested model.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// The provider owning the model is configured off.
    #[error("provider disabled: {0}")]
    ProviderDisabled(String),

    /// The provider could not be reached or answered with a server error.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Requested tool is not registered.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// The tool's server is unreachable or not configured.
    #[error("tool unavailable: {0}")]
    ToolUnavailable(String),

    /// A tool server reported a JSON-RPC error.
    #[error("tool error {code}: {message}")]
    ToolError { code: i64, message: String },

    /// The durable or key-value store could not serve the request.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Anything unexpected. Always logged with context at the source.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable discriminator, used as `error.type` on the
    /// wire and in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::AuthMissing => "auth_missing",
            GatewayError::AuthInvalid(_) => "auth_invalid",
            GatewayError::AuthForbidden(_) => "auth_forbidden",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Validation(_) => "validation",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::ContextLimit { .. } => "context_limit",
            GatewayError::ModelNotFound(_) => "model_not_found",
            GatewayError::ProviderDisabled(_) => "provider_disabled",
            GatewayError::ProviderUnavailable(_) => "provider_unavailable",
            GatewayError::ToolNotFound(_) => "tool_not_found",
            GatewayError::ToolUnavailable(_) => "tool_unavailable",
            GatewayError::ToolError { .. } => "tool_error",
            GatewayError::StoreUnavailable(_) => "store_unavailable",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Whether the owning component may retry the operation.
    ///
    /// Only infrastructure-level classes qualify; integrity and validation
    /// failures never retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::ProviderUnavailable(_) | GatewayError::StoreUnavailable(_)
        )
    }

    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        GatewayError::Validation(msg.into())
    }

    /// Create a not-found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        GatewayError::NotFound(msg.into())
    }

    /// Create a conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        GatewayError::Conflict(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        GatewayError::Internal(msg.into())
    }
}
