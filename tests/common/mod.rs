//! Shared helpers for router-level tests
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Method, Request, Response, header};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use toolgate::config::Config;
use toolgate::failsafe::{Clock, LockoutLimiter, ManualClock, RequestThrottle};
use toolgate::gateway::streaming::SESSION_HEADER;
use toolgate::gateway::{
    AppState, AuthState, CredentialValidator, Dispatcher, SessionManager, create_router,
};
use toolgate::health::HealthReporter;
use toolgate::tool::{ServerInfoTool, ToolDescriptor, ToolError, ToolOutput, ToolRegistry};

pub const SECRET: &str = "s3cret-token-for-tests";

/// Router plus the pieces tests poke at directly
pub struct TestApp {
    pub router: Router,
    pub limiter: Arc<LockoutLimiter>,
    pub sessions: Arc<SessionManager>,
    pub clock: ManualClock,
}

pub fn echo_tool() -> ToolDescriptor {
    ToolDescriptor::from_fn("echo", |args: Value, _ctx| async move {
        let message = args.get("message").and_then(Value::as_str).unwrap_or_default();
        Ok::<_, ToolError>(ToolOutput::text(message))
    })
    .with_description("Echo the message back")
    .with_schema(json!({
        "type": "object",
        "properties": { "message": { "type": "string" } },
        "required": ["message"]
    }))
}

pub fn failing_tool() -> ToolDescriptor {
    ToolDescriptor::from_fn("explode", |_args: Value, _ctx| async move {
        Err::<ToolOutput, _>(ToolError::Failed("db password rejected".to_string()))
    })
}

pub fn app(config: &Config) -> TestApp {
    app_with_tools(config, [])
}

/// Like [`app`], with `extra` registered after the standard tools
pub fn app_with_tools(config: &Config, extra: impl IntoIterator<Item = ToolDescriptor>) -> TestApp {
    let clock = ManualClock::new();
    let limiter = Arc::new(LockoutLimiter::with_clock(
        &config.rate_limit,
        Arc::new(clock.clone()) as Arc<dyn Clock>,
    ));
    let throttle = Arc::new(RequestThrottle::new(&config.rate_limit));
    let auth = Arc::new(AuthState::new(
        CredentialValidator::new(SECRET).unwrap(),
        Arc::clone(&limiter),
        throttle,
        &config.auth,
    ));

    let root = CancellationToken::new();
    let sessions = Arc::new(SessionManager::new(root.clone(), 16));
    let mut tools = ToolRegistry::builder();
    tools.register(ServerInfoTool::descriptor(Instant::now())).unwrap();
    tools.register(echo_tool()).unwrap();
    tools.register(failing_tool()).unwrap();
    for tool in extra {
        tools.register(tool).unwrap();
    }
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(tools.build()),
        config.server.production,
    ));

    let state = Arc::new(AppState {
        sessions: Arc::clone(&sessions),
        dispatcher,
        health: HealthReporter::new(),
        shutdown: root,
        started_at: Instant::now(),
        production: config.server.production,
    });

    TestApp {
        router: create_router(state, auth, &config.server),
        limiter,
        sessions,
        clock,
    }
}

pub fn default_app() -> TestApp {
    app(&Config::default())
}

/// Request from `ip` with an optional bearer token and JSON body
pub fn request(
    method: Method,
    uri: &str,
    ip: [u8; 4],
    token: Option<&str>,
    body: Option<Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let mut request = builder.body(body).unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((ip, 40_000))));
    request
}

pub fn rpc(id: u64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn session_id(response: &Response<Body>) -> Option<String> {
    response
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}
