//! HTTP router and handlers

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Extension, Json, Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower_http::{catch_panic::CatchPanicLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, error, info, info_span};

use super::auth::{AuthState, AuthenticatedClient, UNKNOWN_CLIENT, auth_middleware};
use super::dispatch::Dispatcher;
use super::streaming::{SESSION_HEADER, Session, SessionManager, create_sse_response};
use crate::config::ServerConfig;
use crate::error::rpc_codes;
use crate::health::{HealthReporter, StatusReport, format_uptime};
use crate::protocol::{
    Info, InitializeParams, InitializeResult, JsonRpcResponse, PROTOCOL_VERSION, RequestId,
    ServerCapabilities, ToolsCapability, ToolsListResult, negotiate_version,
};
use crate::security::redact_uri;
use crate::tool::ToolContext;

/// Shared application state
#[derive(Debug)]
pub struct AppState {
    /// Live sessions
    pub sessions: Arc<SessionManager>,
    /// Tool dispatcher
    pub dispatcher: Arc<Dispatcher>,
    /// Dependency probes for `/status`
    pub health: HealthReporter,
    /// Server-wide cancellation; parent of every session and invocation
    pub shutdown: CancellationToken,
    /// Process start, for uptime
    pub started_at: Instant,
    /// Hide internal error detail from clients
    pub production: bool,
}

/// Create the router.
///
/// `/health` is public; the MCP endpoint and `/status` sit behind
/// [`auth_middleware`].
pub fn create_router(state: Arc<AppState>, auth: Arc<AuthState>, server: &ServerConfig) -> Router {
    let protected = Router::new()
        .route(
            &server.mcp_path,
            get(mcp_sse_handler)
                .post(mcp_post_handler)
                .delete(mcp_delete_handler),
        )
        .route("/status", get(status_handler))
        .layer(middleware::from_fn_with_state(auth, auth_middleware));

    Router::new()
        .route("/health", get(health_handler))
        .merge(protected)
        .layer(DefaultBodyLimit::max(server.max_body_size))
        .layer(RequestBodyLimitLayer::new(server.max_body_size))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
            info_span!(
                "http",
                method = %request.method(),
                uri = %redact_uri(&request.uri().to_string()),
            )
        }))
        .with_state(state)
}

/// GET /health - liveness, never authenticated or rate limited
async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /status - version, uptime and dependency health
async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed();
    let report = StatusReport {
        version: env!("CARGO_PKG_VERSION"),
        transport: "streamable-http",
        protocol: PROTOCOL_VERSION,
        uptime: format_uptime(uptime),
        uptime_secs: uptime.as_secs(),
        sessions: state.sessions.len(),
        tools: state.dispatcher.registry().len(),
        dependencies: state.health.check_all(state.production).await,
    };
    Json(report)
}

/// POST /mcp - JSON-RPC requests and notifications
async fn mcp_post_handler(
    State(state): State<Arc<AppState>>,
    client: Option<Extension<AuthenticatedClient>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_id = client.map_or_else(|| UNKNOWN_CLIENT.to_string(), |Extension(c)| c.client_id);

    let request: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return rpc_error_response(
                StatusCode::BAD_REQUEST,
                None,
                rpc_codes::PARSE_ERROR,
                format!("Invalid JSON: {e}"),
            );
        }
    };

    let (id, method, params) = match parse_request(&request) {
        Ok(parsed) => parsed,
        Err(response) => return json_response(StatusCode::BAD_REQUEST, &response, None),
    };

    if method == "initialize" {
        let Some(id) = id else {
            return rpc_error_response(
                StatusCode::BAD_REQUEST,
                None,
                rpc_codes::INVALID_REQUEST,
                "initialize requires an id",
            );
        };
        return initialize(&state, id, params, &client_id);
    }

    let session = match session_from_headers(&state.sessions, &headers) {
        SessionLookup::Found(session) => Some(session),
        SessionLookup::Absent => None,
        SessionLookup::Unknown(sid) => {
            debug!(session_id = %sid, "Unknown session");
            return session_not_found();
        }
    };
    let session_id = session.as_ref().map(|s| s.id().to_string());

    // Notifications get no response body
    let Some(id) = id else {
        debug!(notification = %method, "Handling notification");
        return (StatusCode::ACCEPTED, session_header(session_id.as_deref())).into_response();
    };

    debug!(method = %method, session_id = ?session_id, "MCP request");

    let response = match method.as_str() {
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => {
            let result = ToolsListResult {
                tools: state.dispatcher.registry().list(),
            };
            JsonRpcResponse::success(id, json!(result))
        }
        "tools/call" => {
            let cancel = session
                .as_ref()
                .map_or_else(|| state.shutdown.child_token(), |s| s.invocation_token());
            let ctx = ToolContext {
                cancel,
                session_id: session_id.clone(),
                client_id,
            };
            state.dispatcher.handle_call(id, params, ctx).await
        }
        other => JsonRpcResponse::error(
            Some(id),
            rpc_codes::METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        ),
    };

    json_response(StatusCode::OK, &response, session_id.as_deref())
}

fn initialize(state: &AppState, id: RequestId, params: Option<Value>, client_id: &str) -> Response {
    let params: InitializeParams = params
        .and_then(|p| serde_json::from_value(p).ok())
        .unwrap_or_default();
    let version = negotiate_version(params.protocol_version.as_deref());
    let session = state.sessions.create(client_id, version);

    if let Some(info) = &params.client_info {
        info!(
            session_id = %session.id(),
            client = %info.name,
            client_version = %info.version,
            protocol = %version,
            "Client initialized"
        );
    }

    let result = InitializeResult {
        protocol_version: version.to_string(),
        capabilities: ServerCapabilities {
            tools: Some(ToolsCapability { list_changed: false }),
        },
        server_info: Info {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        instructions: None,
    };

    json_response(
        StatusCode::OK,
        &JsonRpcResponse::success(id, json!(result)),
        Some(session.id()),
    )
}

/// GET /mcp - SSE stream for server→client events
async fn mcp_sse_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !accept.contains("text/event-stream") {
        return (
            StatusCode::NOT_ACCEPTABLE,
            Json(json!({ "error": "Must accept text/event-stream" })),
        )
            .into_response();
    }

    let session = match session_from_headers(&state.sessions, &headers) {
        SessionLookup::Found(session) => session,
        SessionLookup::Absent => {
            return rpc_error_response(
                StatusCode::BAD_REQUEST,
                None,
                rpc_codes::INVALID_REQUEST,
                "Missing Mcp-Session-Id header",
            );
        }
        SessionLookup::Unknown(_) => return session_not_found(),
    };

    info!(
        session_id = %session.id(),
        client_ip = %session.client_id(),
        protocol = %session.protocol_version(),
        "Client connected to SSE stream"
    );
    let session_id = session.id().to_string();
    (session_header(Some(&session_id)), create_sse_response(session)).into_response()
}

/// DELETE /mcp - session termination
async fn mcp_delete_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> StatusCode {
    let session_id = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok());

    match session_id {
        Some(id) if state.sessions.remove(id) => StatusCode::NO_CONTENT,
        Some(id) => {
            debug!(session_id = %id, "Session not found for DELETE");
            StatusCode::NOT_FOUND
        }
        None => StatusCode::BAD_REQUEST,
    }
}

enum SessionLookup {
    Found(Arc<Session>),
    Absent,
    Unknown(String),
}

fn session_from_headers(sessions: &SessionManager, headers: &HeaderMap) -> SessionLookup {
    let Some(id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
        return SessionLookup::Absent;
    };
    sessions
        .get(id)
        .map_or_else(|| SessionLookup::Unknown(id.to_string()), SessionLookup::Found)
}

fn session_header(session_id: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(value) = session_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        headers.insert(SESSION_HEADER, value);
    }
    headers
}

fn json_response(
    status: StatusCode,
    response: &JsonRpcResponse,
    session_id: Option<&str>,
) -> Response {
    (status, session_header(session_id), Json(response)).into_response()
}

fn rpc_error_response(
    status: StatusCode,
    id: Option<RequestId>,
    code: i32,
    message: impl Into<String>,
) -> Response {
    json_response(status, &JsonRpcResponse::error(id, code, message), None)
}

fn session_not_found() -> Response {
    rpc_error_response(
        StatusCode::NOT_FOUND,
        None,
        rpc_codes::SERVER_ERROR_START,
        "Session not found",
    )
}

fn panic_response(_panic: Box<dyn Any + Send + 'static>) -> Response {
    error!("HTTP handler panicked");
    rpc_error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        None,
        rpc_codes::INTERNAL_ERROR,
        "Internal error",
    )
}

/// Extract request ID from JSON value
fn extract_request_id(value: &Value) -> Option<RequestId> {
    match value {
        Value::String(s) => Some(RequestId::String(s.clone())),
        Value::Number(n) => n.as_i64().map(RequestId::Number),
        _ => None,
    }
}

/// Parse a JSON-RPC envelope into `(id, method, params)`.
///
/// Messages without an id are notifications.
fn parse_request(
    value: &Value,
) -> Result<(Option<RequestId>, String, Option<Value>), JsonRpcResponse> {
    if value.is_array() {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Batch requests are not supported",
        ));
    }

    let jsonrpc = value.get("jsonrpc").and_then(Value::as_str);
    if jsonrpc != Some("2.0") {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Invalid JSON-RPC version",
        ));
    }

    let id = value.get("id").and_then(extract_request_id);

    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            JsonRpcResponse::error(id.clone(), rpc_codes::INVALID_REQUEST, "Missing method")
        })?;

    let params = value.get("params").cloned();

    Ok((id, method.to_string(), params))
}
