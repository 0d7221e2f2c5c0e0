//! HTTP transport: REST auth endpoints and the MCP Streamable-HTTP surface.
//!
//! `POST /mcp` carries single or batched JSON-RPC requests, `GET /mcp` opens
//! an SSE stream for server-to-client notifications, and `DELETE /mcp` drops
//! the MCP session named by the `Mcp-Session-Id` header. Every MCP request
//! authenticates a bearer token into a [`TenantContext`] before any routing.

pub mod protocol;
pub mod tools;

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::auth::TenantContext;
use crate::config::SimpleMemConfig;
use crate::engine::Engine;
use crate::error::{ServiceError, ServiceResult};
use protocol::{
    CallToolParams, CallToolResult, InitializeResult, JsonRpcError, JsonRpcId,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
};

const MCP_SESSION_HEADER: &str = "Mcp-Session-Id";

/// Capacity of each MCP session's notification channel.
const NOTIFY_BUFFER: usize = 64;

pub struct AppState {
    pub engine: Arc<Engine>,
    /// One broadcast channel per MCP session for SSE delivery.
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            channels: Mutex::new(HashMap::new()),
        })
    }

    fn subscribe(&self, mcp_session: &str) -> broadcast::Receiver<String> {
        let mut channels = self.channels.lock().expect("channel registry poisoned");
        channels
            .entry(mcp_session.to_string())
            .or_insert_with(|| broadcast::channel(NOTIFY_BUFFER).0)
            .subscribe()
    }

    fn notify(&self, mcp_session: &str, notification: &JsonRpcNotification) {
        let channels = self.channels.lock().expect("channel registry poisoned");
        if let Some(sender) = channels.get(mcp_session) {
            if let Ok(payload) = serde_json::to_string(notification) {
                // Receivers may have gone away; that's fine.
                let _ = sender.send(payload);
            }
        }
    }

    fn drop_session(&self, mcp_session: &str) -> bool {
        let mut channels = self.channels.lock().expect("channel registry poisoned");
        channels.remove(mcp_session).is_some()
    }
}

/// Start the HTTP server and run until ctrl-c.
pub async fn serve(config: SimpleMemConfig) -> anyhow::Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let public_url = config
        .server
        .base_url
        .clone()
        .unwrap_or_else(|| format!("http://{bind_addr}"));
    let engine = Arc::new(Engine::new(config)?);
    let state = AppState::new(engine);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "SimpleMem listening at {public_url}/mcp");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for ctrl-c");
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}

/// Build the full route table.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/mcp", post(mcp_post).get(mcp_sse).delete(mcp_delete))
        .route("/api/auth/register", post(auth_register))
        .route("/api/auth/verify", get(auth_verify))
        .route("/api/auth/refresh", post(auth_refresh))
        .route("/api/health", get(health))
        .route("/api/server/info", get(server_info))
        .with_state(state)
}

// ── Auth helpers ──────────────────────────────────────────────────────────────

fn bearer_token(headers: &HeaderMap) -> ServiceResult<&str> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ServiceError::Auth("missing Authorization header".into()))?;
    value
        .strip_prefix("Bearer ")
        .ok_or_else(|| ServiceError::Auth("Authorization header is not a bearer token".into()))
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> ServiceResult<TenantContext> {
    let token = bearer_token(headers)?;
    state.engine.auth_keys().verify_token(token)
}

fn error_response(err: &ServiceError) -> Response {
    let body = json!({"error": err.to_string()});
    (err.http_status(), Json(body)).into_response()
}

// ── MCP handlers ──────────────────────────────────────────────────────────────

async fn mcp_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let ctx = match authenticate(&state, &headers) {
        Ok(ctx) => ctx,
        Err(err) => return error_response(&err),
    };

    // Session affinity: allocate an id on first contact, echo it back.
    let mcp_session = headers
        .get(MCP_SESSION_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());

    let parsed: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) => {
            let response = JsonRpcResponse::error(
                JsonRpcId::Null,
                JsonRpcError::parse_error(e.to_string()),
            );
            return with_session_header(Json(response).into_response(), &mcp_session);
        }
    };

    let payload = match parsed {
        Value::Array(requests) => {
            if requests.is_empty() {
                let response = JsonRpcResponse::error(
                    JsonRpcId::Null,
                    JsonRpcError::invalid_request("empty batch"),
                );
                return with_session_header(Json(response).into_response(), &mcp_session);
            }
            let mut responses = Vec::new();
            for request in requests {
                if let Some(response) =
                    handle_value(&state, &ctx, &mcp_session, request).await
                {
                    responses.push(response);
                }
            }
            serde_json::to_value(responses).unwrap_or_default()
        }
        single => match handle_value(&state, &ctx, &mcp_session, single).await {
            Some(response) => serde_json::to_value(response).unwrap_or_default(),
            // A lone notification gets 202-style empty acceptance.
            None => Value::Null,
        },
    };

    with_session_header(Json(payload).into_response(), &mcp_session)
}

fn with_session_header(mut response: Response, mcp_session: &str) -> Response {
    if let Ok(value) = mcp_session.parse() {
        response.headers_mut().insert(MCP_SESSION_HEADER, value);
    }
    response
}

/// Handle one JSON-RPC value. Notifications return `None`.
async fn handle_value(
    state: &AppState,
    ctx: &TenantContext,
    mcp_session: &str,
    value: Value,
) -> Option<JsonRpcResponse> {
    let request: JsonRpcRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(e) => {
            return Some(JsonRpcResponse::error(
                JsonRpcId::Null,
                JsonRpcError::invalid_request(e.to_string()),
            ));
        }
    };

    let Some(id) = request.id.clone() else {
        // Notification: initialized etc. — nothing to send back.
        tracing::debug!(method = %request.method, "notification received");
        return None;
    };

    let result = handle_request(state, ctx, mcp_session, &request).await;
    Some(match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(err) => {
            tracing::warn!(method = %request.method, code = err.code, message = %err.message, "request failed");
            JsonRpcResponse::error(id, err)
        }
    })
}

async fn handle_request(
    state: &AppState,
    ctx: &TenantContext,
    mcp_session: &str,
    request: &JsonRpcRequest,
) -> Result<Value, JsonRpcError> {
    match request.method.as_str() {
        "initialize" => Ok(serde_json::to_value(InitializeResult::current()).unwrap_or_default()),
        "ping" => Ok(json!({})),
        "tools/list" => {
            let result = ListToolsResult {
                tools: tools::list_tools(),
            };
            Ok(serde_json::to_value(result).unwrap_or_default())
        }
        "tools/call" => {
            let params: CallToolParams = request
                .params
                .clone()
                .ok_or_else(|| JsonRpcError::invalid_params("missing params"))
                .and_then(|p| {
                    serde_json::from_value(p)
                        .map_err(|e| JsonRpcError::invalid_params(format!("malformed params: {e}")))
                })?;
            let tool_name = params.name.clone();

            let payload = tools::dispatch(&state.engine, ctx, params)
                .await
                .map_err(|e| JsonRpcError::from(&e))?;

            state.notify(
                mcp_session,
                &JsonRpcNotification::new(
                    "notifications/message",
                    json!({
                        "level": "info",
                        "data": format!("{tool_name} completed")
                    }),
                ),
            );

            Ok(serde_json::to_value(CallToolResult::json(&payload)).unwrap_or_default())
        }
        other => Err(JsonRpcError::method_not_found(other)),
    }
}

async fn mcp_sse(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    authenticate(&state, &headers).map_err(|e| error_response(&e))?;

    let mcp_session = headers
        .get(MCP_SESSION_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());

    let receiver = state.subscribe(&mcp_session);
    let stream: std::pin::Pin<
        Box<dyn Stream<Item = Result<SseEvent, Infallible>> + Send>,
    > = Box::pin(
        BroadcastStream::new(receiver).filter_map(|message| match message {
            Ok(payload) => Some(Ok(SseEvent::default().event("message").data(payload))),
            // A lagged receiver just skips; the stream stays up.
            Err(_) => None,
        }),
    );

    let sse = Sse::new(stream).keep_alive(KeepAlive::default());
    Ok(with_session_header(sse.into_response(), &mcp_session))
}

async fn mcp_delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    authenticate(&state, &headers).map_err(|e| error_response(&e))?;

    let Some(mcp_session) = headers
        .get(MCP_SESSION_HEADER)
        .and_then(|h| h.to_str().ok())
    else {
        return Err(error_response(&ServiceError::InvalidArgument(
            "missing Mcp-Session-Id header".into(),
        )));
    };

    state.drop_session(mcp_session);
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ── REST handlers ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RegisterBody {
    provider_api_key: String,
}

async fn auth_register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> Response {
    if let Err(err) = state.engine.verify_provider_key(&body.provider_api_key).await {
        return error_response(&err);
    }
    match state.engine.register(&body.provider_api_key) {
        Ok((user_id, token)) => Json(json!({
            "success": true,
            "user_id": user_id,
            "token": token,
        }))
        .into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Deserialize)]
struct VerifyQuery {
    token: String,
}

async fn auth_verify(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VerifyQuery>,
) -> Json<Value> {
    match state.engine.auth_keys().verify_token(&query.token) {
        Ok(ctx) => Json(json!({"valid": true, "user_id": ctx.user_id})),
        Err(_) => Json(json!({"valid": false})),
    }
}

async fn auth_refresh(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let token = match bearer_token(&headers) {
        Ok(token) => token,
        Err(err) => return error_response(&err),
    };
    match state.engine.auth_keys().refresh_token(token) {
        Ok(token) => Json(json!({"token": token})).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let report = {
        let meta = state.engine.meta_db().lock();
        match meta {
            Ok(conn) => crate::db::check_database_health(&conn).ok(),
            Err(_) => None,
        }
    };
    match report {
        Some(report) if report.integrity_ok => {
            Json(json!({"status": "ok"})).into_response()
        }
        Some(report) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "degraded", "details": report.integrity_details})),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "down"})),
        )
            .into_response(),
    }
}

async fn server_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = state.engine.config();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "embedding_dim": config.llm.embedding_dimension,
        "llm_provider": config.llm.provider,
    }))
}
