//! End-to-end authentication tests
//!
//! Drives the router through the auth middleware:
//! - Bearer header and `?token=` fallback
//! - Failed-attempt lockout per client IP
//! - Public `/health` unaffected by lockout

mod common;

use std::time::Duration;

use axum::http::{Method, StatusCode, header};
use serde_json::json;
use tower::ServiceExt;

use common::{SECRET, body_json, default_app, request, rpc};
use toolgate::config::Config;

const CLIENT: [u8; 4] = [10, 0, 0, 5];
const OTHER: [u8; 4] = [10, 0, 0, 9];

fn ping() -> serde_json::Value {
    rpc(1, "ping", json!({}))
}

#[tokio::test]
async fn valid_bearer_token_is_accepted() {
    let app = default_app();
    let response = app
        .router
        .oneshot(request(Method::POST, "/mcp", CLIENT, Some(SECRET), Some(ping())))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["result"], json!({}));
}

#[tokio::test]
async fn missing_token_is_unauthorized_with_challenge() {
    let app = default_app();
    let response = app
        .router
        .oneshot(request(Method::POST, "/mcp", CLIENT, None, Some(ping())))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[header::WWW_AUTHENTICATE],
        "Bearer realm=\"toolgate\""
    );
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32000);
}

#[tokio::test]
async fn query_token_fallback_is_accepted() {
    let app = default_app();
    let uri = format!("/mcp?token={SECRET}");
    let response = app
        .router
        .oneshot(request(Method::POST, &uri, CLIENT, None, Some(ping())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn wrong_query_token_counts_as_failure() {
    let app = default_app();
    let response = app
        .router
        .clone()
        .oneshot(request(Method::POST, "/mcp?token=nope", CLIENT, None, Some(ping())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.limiter.failure_count("10.0.0.5"), 1);
}

#[tokio::test]
async fn status_requires_auth() {
    let app = default_app();
    let denied = app
        .router
        .clone()
        .oneshot(request(Method::GET, "/status", CLIENT, None, None))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let allowed = app
        .router
        .oneshot(request(Method::GET, "/status", CLIENT, Some(SECRET), None))
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
}

/// Five wrong tokens lock 10.0.0.5 out; the correct token is then refused
/// until the lockout expires, after which the history is cleared and the
/// next failure starts counting from one.
#[tokio::test]
async fn repeated_failures_lock_the_client_out() {
    let app = default_app();

    for attempt in 1..=5 {
        let response = app
            .router
            .clone()
            .oneshot(request(Method::POST, "/mcp", CLIENT, Some("wrong"), Some(ping())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "attempt {attempt}");
    }
    assert!(app.limiter.is_locked("10.0.0.5"));

    let locked = app
        .router
        .clone()
        .oneshot(request(Method::POST, "/mcp", CLIENT, Some(SECRET), Some(ping())))
        .await
        .unwrap();
    assert_eq!(locked.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(locked.headers()[header::RETRY_AFTER], "300");

    app.clock.advance(Duration::from_secs(120));
    let still_locked = app
        .router
        .clone()
        .oneshot(request(Method::POST, "/mcp", CLIENT, Some(SECRET), Some(ping())))
        .await
        .unwrap();
    assert_eq!(still_locked.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(still_locked.headers()[header::RETRY_AFTER], "180");

    app.clock.advance(Duration::from_secs(181));
    let recovered = app
        .router
        .clone()
        .oneshot(request(Method::POST, "/mcp", CLIENT, Some(SECRET), Some(ping())))
        .await
        .unwrap();
    assert_eq!(recovered.status(), StatusCode::OK);
    assert_eq!(app.limiter.failure_count("10.0.0.5"), 0);

    let fresh_failure = app
        .router
        .clone()
        .oneshot(request(Method::POST, "/mcp", CLIENT, Some("wrong"), Some(ping())))
        .await
        .unwrap();
    assert_eq!(fresh_failure.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.limiter.failure_count("10.0.0.5"), 1);
    assert!(!app.limiter.is_locked("10.0.0.5"));
}

#[tokio::test]
async fn lockout_is_per_client() {
    let app = default_app();
    for _ in 0..5 {
        app.router
            .clone()
            .oneshot(request(Method::POST, "/mcp", CLIENT, Some("wrong"), Some(ping())))
            .await
            .unwrap();
    }

    let other = app
        .router
        .oneshot(request(Method::POST, "/mcp", OTHER, Some(SECRET), Some(ping())))
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn failures_outside_the_window_do_not_accumulate() {
    let app = default_app();
    for _ in 0..4 {
        app.router
            .clone()
            .oneshot(request(Method::POST, "/mcp", CLIENT, Some("wrong"), Some(ping())))
            .await
            .unwrap();
    }
    app.clock.advance(Duration::from_secs(61));

    let response = app
        .router
        .clone()
        .oneshot(request(Method::POST, "/mcp", CLIENT, Some("wrong"), Some(ping())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(!app.limiter.is_locked("10.0.0.5"));
    assert_eq!(app.limiter.failure_count("10.0.0.5"), 1);
}

#[tokio::test]
async fn health_stays_public_while_locked_out() {
    let app = default_app();
    for _ in 0..5 {
        app.router
            .clone()
            .oneshot(request(Method::POST, "/mcp", CLIENT, Some("wrong"), Some(ping())))
            .await
            .unwrap();
    }

    let response = app
        .router
        .oneshot(request(Method::GET, "/health", CLIENT, None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn forwarded_headers_ignored_unless_trusted() {
    let app = default_app();
    for _ in 0..5 {
        app.router
            .clone()
            .oneshot(request(Method::POST, "/mcp", CLIENT, Some("wrong"), Some(ping())))
            .await
            .unwrap();
    }

    let mut spoofed = request(Method::POST, "/mcp", CLIENT, Some(SECRET), Some(ping()));
    spoofed
        .headers_mut()
        .insert("x-forwarded-for", "203.0.113.7".parse().unwrap());
    let response = app.router.oneshot(spoofed).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn trusted_proxy_header_identifies_client() {
    let mut config = Config::default();
    config.auth.trust_proxy_headers = true;
    let app = common::app(&config);

    let mut proxied = request(Method::POST, "/mcp", CLIENT, Some("wrong"), Some(ping()));
    proxied
        .headers_mut()
        .insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
    app.router.oneshot(proxied).await.unwrap();

    assert_eq!(app.limiter.failure_count("203.0.113.7"), 1);
    assert_eq!(app.limiter.failure_count("10.0.0.5"), 0);
}
