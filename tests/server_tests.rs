/// Tests for the HTTP surface: routing, auth middleware, SSE framing and
/// error mapping, driven through `tower::ServiceExt::oneshot`.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chatgate::chatgate::auth::TokenValidator;
use chatgate::chatgate::error::Result;
use chatgate::chatgate::model_registry::ModelRegistry;
use chatgate::chatgate::models::{
    ChatMessage, ChatParams, ChatReply, ModelDescriptor, TokenUsage,
};
use chatgate::chatgate::orchestrator::{ChatOrchestrator, OrchestratorConfig};
use chatgate::chatgate::provider::{ChunkStream, ProviderAdapter, ProviderType, StreamChunk};
use chatgate::chatgate::server::{router, Application};
use chatgate::chatgate::session_store::{MemoryBackend, StreamSessionStore};
use chatgate::chatgate::settings::Settings;
use chatgate::chatgate::store::{init_schema, ConversationStore};
use chatgate::chatgate::users::UserResolver;
use chrono::Utc;
use http_body_util::BodyExt;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use tower::util::ServiceExt;

const SECRET: &[u8] = b"server-test-shared-secret-material";
const ISSUER: &str = "http://keycloak.example.com/realms/gateway";

struct EchoAdapter;

#[async_trait]
impl ProviderAdapter for EchoAdapter {
    fn provider_name(&self) -> &str {
        "mock"
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Local
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        Ok(vec![ModelDescriptor {
            name: "m-small".into(),
            provider: "mock".into(),
            model_type: "local".into(),
            context_length: 4096,
            parameter_size: None,
            cost_per_1k_tokens: None,
            capabilities: vec!["chat".into()],
        }])
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        _params: &ChatParams,
    ) -> Result<ChatReply> {
        let prompt = messages.last().map(|m| m.content.as_str()).unwrap_or("");
        Ok(ChatReply {
            content: format!("echo: {prompt}"),
            model: model.to_string(),
            usage: TokenUsage::new(2, 3),
        })
    }

    async fn chat_stream(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
        _params: &ChatParams,
    ) -> Result<ChunkStream> {
        let chunks = vec![
            Ok(StreamChunk {
                content: "he".into(),
                finish_reason: None,
            }),
            Ok(StreamChunk {
                content: "llo".into(),
                finish_reason: Some("stop".into()),
            }),
        ];
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

async fn make_app(validator: Option<Arc<TokenValidator>>) -> Router {
    chatgate::init_logger();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    init_schema(&pool).await.unwrap();

    let store = Arc::new(ConversationStore::new(pool.clone()));
    let sessions = Arc::new(StreamSessionStore::new(Arc::new(MemoryBackend::new()), 300));
    let registry = Arc::new(ModelRegistry::new(Duration::from_secs(300)));
    registry.register("mock", Arc::new(EchoAdapter)).await;
    registry.refresh().await;
    let orchestrator = Arc::new(ChatOrchestrator::new(
        store.clone(),
        sessions.clone(),
        registry.clone(),
        None,
        OrchestratorConfig::default(),
    ));

    router(Application {
        settings: Arc::new(Settings::from_value(Value::Null)),
        store,
        sessions,
        registry,
        orchestrator,
        mcp: None,
        validator,
        users: Arc::new(UserResolver::new(pool)),
    })
}

async fn auth_validator() -> Arc<TokenValidator> {
    let validator = TokenValidator::new("http://127.0.0.1:1/realms/gateway", ISSUER, "account");
    validator
        .install_jwks(json!({
            "keys": [{
                "kty": "oct",
                "kid": "test-key",
                "alg": "HS256",
                "k": URL_SAFE_NO_PAD.encode(SECRET),
            }]
        }))
        .await;
    Arc::new(validator)
}

fn bearer(audience: &str) -> String {
    let now = Utc::now().timestamp();
    let claims = json!({
        "sub": "kc-1",
        "email": "alice@example.com",
        "preferred_username": "alice",
        "realm_access": {"roles": ["user"]},
        "iss": ISSUER,
        "aud": audience,
        "iat": now,
        "exp": now + 600,
    });
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some("test-key".to_string());
    encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn sse_events(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect()
}

#[tokio::test]
async fn health_is_public() {
    let app = make_app(None).await;
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["components"]["store"], "healthy");
}

#[tokio::test]
async fn full_streaming_flow_over_http() {
    let app = make_app(None).await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/chat/conversations",
            json!({"title": "T1", "model_name": "m-small"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let conversation = body_json(response).await;
    let conversation_id = conversation["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/api/chat/conversations/{conversation_id}/prepare-stream"),
            json!({"message": "hi", "model": "m-small"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let prepared = body_json(response).await;
    let token = prepared["stream_token"].as_str().unwrap().to_string();
    let assistant_id = prepared["assistant_message_id"].as_str().unwrap().to_string();
    assert!(prepared["user_message_id"].is_string());

    let response = app
        .clone()
        .oneshot(get(&format!("/stream/{token}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap(),
        "text/event-stream"
    );
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-cache"
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let events = sse_events(&String::from_utf8_lossy(&bytes));
    let types: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
    assert_eq!(
        types,
        vec![
            "stream_start",
            "user_message",
            "assistant_message_start",
            "content_chunk",
            "content_chunk",
            "assistant_message_complete",
            "done",
        ]
    );
    assert_eq!(events[2]["message_id"].as_str().unwrap(), assistant_id);
    assert_eq!(events[5]["message"]["content"], "hello");

    // The token is consumed: a second connect is a 404.
    let response = app
        .clone()
        .oneshot(get(&format!("/stream/{token}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Both messages eventually land in the conversation.
    let mut messages = Vec::new();
    for _ in 0..200 {
        let response = app
            .clone()
            .oneshot(get(&format!(
                "/api/chat/conversations/{conversation_id}/messages"
            )))
            .await
            .unwrap();
        let body = body_json(response).await;
        messages = body["messages"].as_array().unwrap().clone();
        if messages.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "hello");
}

#[tokio::test]
async fn unknown_models_map_to_service_unavailable() {
    let app = make_app(None).await;
    let response = app
        .oneshot(post_json(
            "/api/chat/direct",
            json!({"message": "hi", "model": "nope"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "model_not_found");
}

#[tokio::test]
async fn direct_chat_passes_through() {
    let app = make_app(None).await;
    let response = app
        .oneshot(post_json(
            "/api/chat/direct",
            json!({"message": "ping", "model": "m-small"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["text"], "echo: ping");
    assert_eq!(body["model"], "m-small");
    assert!(body["response_time_ms"].is_number());
}

#[tokio::test]
async fn direct_stream_emits_chunks_without_persisting() {
    let app = make_app(None).await;
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/chat/direct/stream",
            json!({"message": "hi", "model": "m-small"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let events = sse_events(&String::from_utf8_lossy(&bytes));
    let types: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
    assert_eq!(
        types,
        vec![
            "content_chunk",
            "content_chunk",
            "assistant_message_complete",
            "done",
        ]
    );
    assert_eq!(events[2]["message"]["content"], "hello");

    // Nothing was written to any conversation.
    let response = app.oneshot(get("/api/chat/conversations")).await.unwrap();
    let body = body_json(response).await;
    assert!(body["conversations"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn missing_bearer_is_unauthorized_when_auth_is_on() {
    let app = make_app(Some(auth_validator().await)).await;
    let response = app
        .oneshot(post_json("/api/chat/conversations", json!({"title": "x"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "auth_missing");
}

#[tokio::test]
async fn wrong_audience_is_rejected_with_auth_invalid() {
    let app = make_app(Some(auth_validator().await)).await;
    let mut request = post_json("/api/chat/conversations", json!({"title": "T"}));
    request.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {}", bearer("wrong-aud")).parse().unwrap(),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "auth_invalid");
}

#[tokio::test]
async fn valid_bearer_auto_provisions_the_user() {
    let app = make_app(Some(auth_validator().await)).await;
    let mut request = post_json("/api/chat/conversations", json!({"title": "T"}));
    request.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {}", bearer("account")).parse().unwrap(),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["title"], "T");
    assert!(body["user_id"].is_number());
}

#[tokio::test]
async fn validation_failures_are_unprocessable() {
    let app = make_app(None).await;
    let response = app
        .oneshot(post_json("/api/chat/conversations", json!({"title": "  "})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "validation");
}

#[tokio::test]
async fn conversation_crud_round_trip() {
    let app = make_app(None).await;
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/chat/conversations",
            json!({"title": "crud", "system_prompt": "be nice"}),
        ))
        .await
        .unwrap();
    let created = body_json(response).await;
    let id = created["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri(format!("/api/chat/conversations/{id}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({"title": "renamed"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["title"], "renamed");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/chat/conversations/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // Soft-deleted conversations vanish from listings.
    let response = app
        .clone()
        .oneshot(get("/api/chat/conversations"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert!(body["conversations"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn mcp_routes_require_configured_servers() {
    let app = make_app(None).await;
    let response = app.oneshot(get("/api/mcp/tools")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "tool_unavailable");
}
