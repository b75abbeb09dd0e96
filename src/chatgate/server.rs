//! HTTP surface: routes, wire schemas, SSE framing and the single
//! error-to-status mapping.
//!
//! The layer is deliberately thin — handlers parse and validate the wire
//! shape, pull the [`AuthContext`] installed by the bearer middleware,
//! call into the orchestrator or component services, and let
//! [`GatewayError`]'s `IntoResponse` impl produce the error body.
//!
//! Route map:
//!
//! * `GET  /health` — public component health
//! * `/api/chat/…`, `/api/mcp/…` — bearer-protected application routes
//! * `GET  /stream/{token}`, `GET /stream/mcp/{token}` — SSE endpoints
//!   whose only credential is the stream token itself

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;

use crate::chatgate::approval::ApprovalService;
use crate::chatgate::auth::TokenValidator;
use crate::chatgate::error::{GatewayError, Result};
use crate::chatgate::mcp_client::{McpClient, ToolExecution};
use crate::chatgate::model_registry::ModelRegistry;
use crate::chatgate::orchestrator::{
    ensure_owner, ChatOrchestrator, OrchestratorConfig, PrepareRequest, ToolOptions,
};
use crate::chatgate::provider::estimate_tokens;
use crate::chatgate::providers::{AnthropicAdapter, OllamaAdapter, OpenAiAdapter};
use crate::chatgate::session_store::{
    MemoryBackend, RedisBackend, SessionBackend, StreamSessionStore,
};
use crate::chatgate::settings::Settings;
use crate::chatgate::store::{
    init_schema, ConversationStore, ConversationUpdate, NewConversation, NewMessage,
};
use crate::chatgate::tool_registry::ToolRegistry;
use crate::chatgate::users::UserResolver;

/// The dependency graph, constructed once at startup and cloned into
/// handlers through request state.
#[derive(Clone)]
pub struct Application {
    pub settings: Arc<Settings>,
    pub store: Arc<ConversationStore>,
    pub sessions: Arc<StreamSessionStore>,
    pub registry: Arc<ModelRegistry>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub mcp: Option<Arc<McpClient>>,
    pub validator: Option<Arc<TokenValidator>>,
    pub users: Arc<UserResolver>,
}

impl Application {
    /// Wire the full graph from settings: database pool and schema,
    /// session backend, provider adapters, MCP discovery, validator,
    /// orchestrator.
    pub async fn bootstrap(settings: Settings) -> Result<Self> {
        let settings = Arc::new(settings);

        let database_url = settings.database_url();
        let max_connections = if database_url.contains(":memory:") {
            // A pooled in-memory SQLite would open one database per
            // connection.
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&database_url)
            .await
            .map_err(|e| GatewayError::StoreUnavailable(format!("database connect: {e}")))?;
        init_schema(&pool).await?;

        let backend: Arc<dyn SessionBackend> = match settings.redis_url() {
            Some(url) => Arc::new(RedisBackend::connect(&url).await?),
            None => {
                log::info!("no redis_url configured; stream sessions held in process memory");
                Arc::new(MemoryBackend::new())
            }
        };
        let sessions = Arc::new(StreamSessionStore::new(
            backend,
            settings.stream_session_ttl_seconds(),
        ));

        let registry = Arc::new(ModelRegistry::new(Duration::from_secs(
            settings.model_refresh_interval_seconds(),
        )));
        registry
            .register(
                "ollama",
                Arc::new(OllamaAdapter::from_settings(&settings.provider("ollama"))),
            )
            .await;
        registry
            .register(
                "openai",
                Arc::new(OpenAiAdapter::from_settings(&settings.provider("openai"))),
            )
            .await;
        registry
            .register(
                "anthropic",
                Arc::new(AnthropicAdapter::from_settings(
                    &settings.provider("anthropic"),
                )),
            )
            .await;
        registry.refresh().await;

        let store = Arc::new(ConversationStore::new(pool.clone()));
        let users = Arc::new(UserResolver::new(pool.clone()));

        let mcp_servers = settings.mcp_servers();
        let mcp = if mcp_servers.is_empty() {
            None
        } else {
            let client = Arc::new(McpClient::new(
                Arc::new(ToolRegistry::new()),
                Arc::new(ApprovalService::new(pool.clone())),
                mcp_servers,
                Duration::from_secs(settings.approval_timeout_seconds()),
            ));
            client.initialize().await;
            Some(client)
        };

        let validator = if settings.auth_enabled() {
            Some(Arc::new(TokenValidator::new(
                &settings.identity_jwks_base(),
                &settings.identity_issuer(),
                &settings.identity_audience(),
            )))
        } else {
            log::warn!("authentication disabled; all requests map to the demo user");
            None
        };

        let orchestrator = Arc::new(ChatOrchestrator::new(
            store.clone(),
            sessions.clone(),
            registry.clone(),
            mcp.clone(),
            OrchestratorConfig {
                context_message_limit: settings.context_message_limit() as i64,
                default_system_prompt: settings.default_system_prompt(),
                enable_thinking_mode: settings.enable_thinking_mode(),
            },
        ));

        Ok(Self {
            settings,
            store,
            sessions,
            registry,
            orchestrator,
            mcp,
            validator,
            users,
        })
    }
}

/// Identity attached to every authenticated request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: i64,
    pub is_admin: bool,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::AuthMissing | GatewayError::AuthInvalid(_) => StatusCode::UNAUTHORIZED,
            GatewayError::AuthForbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::ContextLimit { .. } => StatusCode::BAD_REQUEST,
            GatewayError::ModelNotFound(_)
            | GatewayError::ProviderDisabled(_)
            | GatewayError::ProviderUnavailable(_)
            | GatewayError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ToolNotFound(_)
            | GatewayError::ToolUnavailable(_)
            | GatewayError::ToolError { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("internal error surfaced to client: {}", self);
        }
        let mut error = json!({
            "type": self.kind(),
            "message": self.to_string(),
        });
        if let GatewayError::ContextLimit {
            model,
            current_tokens,
            limit,
        } = &self
        {
            error["details"] = json!({
                "model": model,
                "current_tokens": current_tokens,
                "limit": limit,
            });
        }
        (status, Json(json!({"error": error}))).into_response()
    }
}

/// Bearer middleware for `/api/` routes. With validation disabled every
/// request resolves to the auto-provisioned demo user.
async fn auth_middleware(
    State(app): State<Application>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, GatewayError> {
    let claims = match &app.validator {
        Some(validator) => {
            let token = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .ok_or(GatewayError::AuthMissing)?;
            let claims = validator
                .validate(token)
                .await
                .ok_or_else(|| GatewayError::AuthInvalid("token rejected".to_string()))?;
            Some(claims)
        }
        None => None,
    };

    let user_id = app.users.resolve(claims.as_ref()).await?;
    let is_admin = claims.as_ref().map(|c| c.is_admin()).unwrap_or(true);
    request
        .extensions_mut()
        .insert(AuthContext { user_id, is_admin });
    Ok(next.run(request).await)
}

/// Build the full router for the application.
pub fn router(app: Application) -> Router {
    let api = Router::new()
        .route(
            "/chat/conversations",
            post(create_conversation).get(list_conversations),
        )
        .route(
            "/chat/conversations/{id}",
            get(get_conversation)
                .patch(update_conversation)
                .delete(delete_conversation),
        )
        .route(
            "/chat/conversations/{id}/messages",
            get(list_messages).post(create_message),
        )
        .route(
            "/chat/conversations/{id}/prepare-stream",
            post(prepare_stream),
        )
        .route(
            "/chat/conversations/{id}/prepare-mcp-stream",
            post(prepare_mcp_stream),
        )
        .route("/chat/search", get(search_conversations))
        .route("/chat/direct", post(direct_chat))
        .route("/chat/direct/stream", post(direct_chat_stream))
        .route("/mcp/tools", get(list_tools))
        .route("/mcp/execute", post(execute_tool))
        .route("/mcp/approvals/pending", get(pending_approvals))
        .route("/mcp/approvals/{id}/approve", post(decide_approval))
        .route("/mcp/approvals/{id}/execute", post(execute_approval))
        .layer(middleware::from_fn_with_state(app.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/stream/{token}", get(consume_stream))
        .route("/stream/mcp/{token}", get(consume_stream))
        .nest("/api", api)
        .with_state(app)
}

// ---- health ----

async fn health(State(app): State<Application>) -> Json<Value> {
    let registry = app.registry.health_check().await;
    let store_ok = app.store.ping().await.is_ok();
    let sessions_ok = app.sessions.ping().await.is_ok();
    let status = if store_ok && sessions_ok {
        "healthy"
    } else {
        "unhealthy"
    };
    Json(json!({
        "status": status,
        "components": {
            "store": if store_ok { "healthy" } else { "unhealthy" },
            "session_store": if sessions_ok { "healthy" } else { "unhealthy" },
            "models": registry,
        }
    }))
}

// ---- conversations ----

#[derive(Debug, Deserialize)]
struct CreateConversationBody {
    title: String,
    #[serde(default)]
    model_name: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

async fn create_conversation(
    State(app): State<Application>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateConversationBody>,
) -> Result<impl IntoResponse> {
    if body.title.trim().is_empty() {
        return Err(GatewayError::validation("title must not be empty"));
    }
    let conversation = app
        .store
        .create(NewConversation {
            user_id: auth.user_id,
            title: body.title,
            model_name: body.model_name,
            system_prompt: body.system_prompt,
            data: body.data.unwrap_or_else(|| json!({})),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
    #[serde(default)]
    status: Option<String>,
}

fn default_limit() -> i64 {
    50
}

async fn list_conversations(
    State(app): State<Application>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>> {
    let conversations = app
        .store
        .list_by_user(
            auth.user_id,
            query.limit,
            query.offset,
            query.status.as_deref(),
        )
        .await?;
    Ok(Json(json!({
        "conversations": conversations,
        "limit": query.limit,
        "offset": query.offset,
    })))
}

async fn get_conversation(
    State(app): State<Application>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let conversation = app
        .store
        .get(&id)
        .await?
        .ok_or_else(|| GatewayError::not_found(format!("conversation {id}")))?;
    ensure_owner(&conversation, auth.user_id, auth.is_admin)?;
    Ok(Json(json!(conversation)))
}

#[derive(Debug, Deserialize)]
struct UpdateConversationBody {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    model_name: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

async fn update_conversation(
    State(app): State<Application>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<UpdateConversationBody>,
) -> Result<Json<Value>> {
    let conversation = app
        .store
        .get(&id)
        .await?
        .ok_or_else(|| GatewayError::not_found(format!("conversation {id}")))?;
    ensure_owner(&conversation, auth.user_id, auth.is_admin)?;
    let updated = app
        .store
        .update(
            &id,
            ConversationUpdate {
                title: body.title,
                status: body.status,
                model_name: body.model_name.map(Some),
                system_prompt: body.system_prompt.map(Some),
                data: body.data,
            },
        )
        .await?;
    Ok(Json(json!(updated)))
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    hard: bool,
}

async fn delete_conversation(
    State(app): State<Application>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<StatusCode> {
    let conversation = app
        .store
        .get(&id)
        .await?
        .ok_or_else(|| GatewayError::not_found(format!("conversation {id}")))?;
    ensure_owner(&conversation, auth.user_id, auth.is_admin)?;
    app.store.delete(&id, query.hard).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default = "default_limit")]
    limit: i64,
}

async fn search_conversations(
    State(app): State<Application>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Value>> {
    let results = app.store.search(auth.user_id, &query.q, query.limit).await?;
    Ok(Json(json!({"conversations": results, "query": query.q})))
}

// ---- messages ----

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    #[serde(default = "default_message_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_message_limit() -> i64 {
    100
}

async fn list_messages(
    State(app): State<Application>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Value>> {
    let conversation = app
        .store
        .get(&id)
        .await?
        .ok_or_else(|| GatewayError::not_found(format!("conversation {id}")))?;
    ensure_owner(&conversation, auth.user_id, auth.is_admin)?;
    let messages = app.store.list_messages(&id, query.limit, query.offset).await?;
    Ok(Json(json!({"messages": messages})))
}

#[derive(Debug, Deserialize)]
struct CreateMessageBody {
    role: String,
    content: String,
    #[serde(default)]
    raw_content: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

async fn create_message(
    State(app): State<Application>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<CreateMessageBody>,
) -> Result<impl IntoResponse> {
    let conversation = app
        .store
        .get(&id)
        .await?
        .ok_or_else(|| GatewayError::not_found(format!("conversation {id}")))?;
    ensure_owner(&conversation, auth.user_id, auth.is_admin)?;
    let token_count = estimate_tokens(&body.content) as i64;
    let message = app
        .store
        .add_message(NewMessage {
            id: None,
            conversation_id: id,
            role: body.role,
            content: body.content,
            raw_content: body.raw_content,
            token_count,
            data: body.data.unwrap_or_else(|| json!({})),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

// ---- streaming ----

#[derive(Debug, Deserialize)]
struct PrepareBody {
    message: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

async fn prepare_stream(
    State(app): State<Application>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<PrepareBody>,
) -> Result<Json<Value>> {
    let prepared = app
        .orchestrator
        .prepare_stream(
            auth.user_id,
            auth.is_admin,
            &id,
            PrepareRequest {
                message: body.message,
                model: body.model,
                temperature: body.temperature,
                max_tokens: body.max_tokens,
            },
            ToolOptions::default(),
        )
        .await?;
    Ok(Json(json!(prepared)))
}

#[derive(Debug, Deserialize)]
struct PrepareMcpBody {
    message: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default = "default_true")]
    tools_enabled: bool,
    #[serde(default)]
    auto_approve_tools: bool,
}

fn default_true() -> bool {
    true
}

async fn prepare_mcp_stream(
    State(app): State<Application>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<PrepareMcpBody>,
) -> Result<Json<Value>> {
    let prepared = app
        .orchestrator
        .prepare_stream(
            auth.user_id,
            auth.is_admin,
            &id,
            PrepareRequest {
                message: body.message,
                model: body.model,
                temperature: body.temperature,
                max_tokens: body.max_tokens,
            },
            ToolOptions {
                enabled: body.tools_enabled,
                auto_approve: body.auto_approve_tools,
            },
        )
        .await?;
    Ok(Json(json!(prepared)))
}

/// Stream consumption. No auth header: possession of the token is the
/// authorisation, and the token is consumed on first use.
async fn consume_stream(
    State(app): State<Application>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse> {
    let events = app.orchestrator.stream(&token).await?;
    let frames = events.map(|event| {
        Ok::<_, Infallible>(Event::default().data(event.to_string()))
    });
    let sse = Sse::new(frames).keep_alive(KeepAlive::default());
    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            // Tell buffering reverse proxies to pass frames through.
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    ))
}

#[derive(Debug, Deserialize)]
struct DirectBody {
    message: String,
    model: String,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

async fn direct_chat(
    State(app): State<Application>,
    Json(body): Json<DirectBody>,
) -> Result<Json<Value>> {
    let reply = app
        .orchestrator
        .direct_chat(&body.message, &body.model, body.temperature, body.max_tokens)
        .await?;
    Ok(Json(json!(reply)))
}

/// Streaming variant of the direct pass-through; same SSE envelope,
/// nothing persisted.
async fn direct_chat_stream(
    State(app): State<Application>,
    Json(body): Json<DirectBody>,
) -> Result<impl IntoResponse> {
    let events = app
        .orchestrator
        .direct_chat_stream(&body.message, &body.model, body.temperature, body.max_tokens)
        .await?;
    let frames = events.map(|event| {
        Ok::<_, Infallible>(Event::default().data(event.to_string()))
    });
    let sse = Sse::new(frames).keep_alive(KeepAlive::default());
    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    ))
}

// ---- MCP ----

fn require_mcp(app: &Application) -> Result<Arc<McpClient>> {
    app.mcp
        .clone()
        .ok_or_else(|| GatewayError::ToolUnavailable("no MCP servers configured".to_string()))
}

#[derive(Debug, Deserialize)]
struct ToolsQuery {
    #[serde(default)]
    provider: Option<String>,
}

async fn list_tools(
    State(app): State<Application>,
    Query(query): Query<ToolsQuery>,
) -> Result<Json<Value>> {
    let mcp = require_mcp(&app)?;
    let tools: Value = match query.provider.as_deref() {
        Some(provider) => json!(mcp.registry().format_for_provider(provider).await),
        None => json!(mcp.registry().list().await),
    };
    let servers: Vec<Value> = mcp
        .servers()
        .iter()
        .map(|s| json!({"name": s.name, "base_url": s.base_url, "enabled": s.enabled}))
        .collect();
    Ok(Json(json!({
        "tools": tools,
        "servers": servers,
        "stats": mcp.registry().stats().await,
    })))
}

#[derive(Debug, Deserialize)]
struct ExecuteToolBody {
    tool_name: String,
    #[serde(default)]
    arguments: Value,
    conversation_id: String,
}

async fn execute_tool(
    State(app): State<Application>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<ExecuteToolBody>,
) -> Result<Json<Value>> {
    let mcp = require_mcp(&app)?;
    let arguments = if body.arguments.is_null() {
        json!({})
    } else {
        body.arguments
    };
    // Administrators skip the approval gate.
    let outcome = mcp
        .execute_tool(
            &body.tool_name,
            arguments,
            auth.user_id,
            &body.conversation_id,
            auth.is_admin,
        )
        .await?;
    Ok(Json(execution_to_json(outcome)))
}

fn execution_to_json(outcome: ToolExecution) -> Value {
    match outcome {
        ToolExecution::Executed {
            approval_id,
            result,
            duration_ms,
        } => json!({
            "success": true,
            "result": result,
            "approval_id": approval_id,
            "duration_ms": duration_ms,
        }),
        ToolExecution::Failed { approval_id, error } => json!({
            "success": false,
            "error": error,
            "approval_id": approval_id,
        }),
        ToolExecution::PendingApproval { approval_id } => json!({
            "success": false,
            "error": "approval required",
            "approval_id": approval_id,
        }),
    }
}

async fn pending_approvals(
    State(app): State<Application>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Value>> {
    let mcp = require_mcp(&app)?;
    let pending = mcp.approvals().list_pending(auth.user_id).await?;
    let items: Vec<Value> = pending.iter().map(|a| a.to_ui_format()).collect();
    Ok(Json(json!({"approvals": items})))
}

#[derive(Debug, Deserialize)]
struct DecideBody {
    approved: bool,
    #[serde(default)]
    reason: Option<String>,
}

async fn decide_approval(
    State(app): State<Application>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<DecideBody>,
) -> Result<Json<Value>> {
    let mcp = require_mcp(&app)?;
    let approval = mcp
        .approvals()
        .decide(&id, auth.user_id, body.approved, body.reason.as_deref())
        .await?;
    Ok(Json(json!(approval)))
}

async fn execute_approval(
    State(app): State<Application>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let mcp = require_mcp(&app)?;
    let outcome = mcp.execute_approved(&id).await?;
    Ok(Json(execution_to_json(outcome)))
}

/// Serve the router until the process is stopped.
pub async fn serve(app: Application) -> Result<()> {
    let address = app.settings.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| GatewayError::internal(format!("bind {address}: {e}")))?;
    log::info!("chatgate listening on {}", address);
    axum::serve(listener, router(app))
        .await
        .map_err(|e| GatewayError::internal(format!("server: {e}")))
}
