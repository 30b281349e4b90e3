//! Real-listener tests: heartbeats on a live SSE stream and bounded shutdown

use std::time::{Duration, Instant};

use serde_json::{Value, json};

use toolgate::config::Config;
use toolgate::gateway::streaming::SESSION_HEADER;
use toolgate::gateway::{Gateway, GatewayHandle, ServerState};
use toolgate::tool::{ToolDescriptor, ToolError, ToolOutput};

const SECRET: &str = "shutdown-test-secret";

fn config() -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.auth.bearer_token = Some(SECRET.to_string());
    config.streaming.heartbeat_interval = Duration::from_millis(100);
    config.shutdown.grace_period = Duration::from_secs(1);
    config
}

/// Never returns and ignores cancellation
fn hang_tool() -> ToolDescriptor {
    ToolDescriptor::from_fn("hang", |_args: Value, _ctx| async move {
        std::future::pending::<()>().await;
        Ok::<_, ToolError>(ToolOutput::text("unreachable"))
    })
}

/// Waits for cancellation, then reports it
fn patient_tool() -> ToolDescriptor {
    ToolDescriptor::from_fn("patient", |_args: Value, ctx: toolgate::tool::ToolContext| async move {
        ctx.cancel.cancelled().await;
        Ok::<_, ToolError>(ToolOutput::text("stopped"))
    })
}

async fn start() -> GatewayHandle {
    Gateway::new(config())
        .unwrap()
        .with_tools([hang_tool(), patient_tool()])
        .unwrap()
        .start()
        .await
        .unwrap()
}

fn mcp_url(handle: &GatewayHandle) -> String {
    format!("{}/mcp", handle.base_url())
}

async fn wait_for_in_flight(handle: &GatewayHandle, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.in_flight() < n {
        assert!(Instant::now() < deadline, "invocation never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn call(name: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "tools/call",
        "params": { "name": name, "arguments": {} }
    })
}

#[tokio::test]
async fn shutdown_is_bounded_by_grace_period() {
    let handle = start().await;
    let url = mcp_url(&handle);
    let health = format!("{}/health", handle.base_url());
    let mut state = handle.subscribe_state();
    assert_eq!(handle.state(), ServerState::Listening);

    let client = reqwest::Client::new();
    assert!(client.get(&health).send().await.unwrap().status().is_success());

    let hung = tokio::spawn({
        let client = client.clone();
        let url = url.clone();
        async move { client.post(url).bearer_auth(SECRET).json(&call("hang")).send().await }
    });
    wait_for_in_flight(&handle, 1).await;

    let started = Instant::now();
    handle.shutdown().await.unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "shutdown took {:?}",
        started.elapsed()
    );
    assert_eq!(*state.borrow_and_update(), ServerState::Stopped);

    let _ = tokio::time::timeout(Duration::from_secs(2), hung).await;
    assert!(reqwest::Client::new().get(&health).send().await.is_err());
}

#[tokio::test]
async fn in_flight_invocation_observes_cancellation() {
    let handle = start().await;
    let url = mcp_url(&handle);

    let pending = tokio::spawn(async move {
        reqwest::Client::new()
            .post(url)
            .bearer_auth(SECRET)
            .json(&call("patient"))
            .send()
            .await
    });
    wait_for_in_flight(&handle, 1).await;

    handle.shutdown_with(Duration::from_secs(2)).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), pending).await;
    assert!(outcome.is_ok(), "client request still hanging after shutdown");
}

#[tokio::test]
async fn heartbeats_reach_open_stream_until_shutdown() {
    let handle = start().await;
    let url = mcp_url(&handle);
    let client = reqwest::Client::new();

    let init = client
        .post(&url)
        .bearer_auth(SECRET)
        .json(&json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }))
        .send()
        .await
        .unwrap();
    let sid = init.headers()[SESSION_HEADER].to_str().unwrap().to_string();

    let mut stream = client
        .get(&url)
        .bearer_auth(SECRET)
        .header("accept", "text/event-stream")
        .header(SESSION_HEADER, &sid)
        .send()
        .await
        .unwrap();
    assert!(stream.status().is_success());

    let mut seen = String::new();
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = stream.chunk().await.unwrap() {
            seen.push_str(&String::from_utf8_lossy(&chunk));
            if seen.contains("event: heartbeat") {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(found, "no heartbeat in {seen:?}");
    assert!(seen.contains("\"type\":\"heartbeat\""));

    handle.shutdown().await.unwrap();

    let ended = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match stream.chunk().await {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "stream still open after shutdown");
}
