//! Authentication middleware for the gateway
//!
//! Every protected request goes through the same steps:
//! - derive the client identifier (peer IP, or proxy headers when trusted)
//! - refuse locked-out identifiers before looking at the credential
//! - compare the presented bearer credential in constant time
//! - record the outcome with the lockout limiter

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::error::rpc_codes;
use crate::failsafe::{Attempt, LockoutLimiter, RateDecision, RequestThrottle};
use crate::{Error, Result};

/// Identifier used when no client address can be determined
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Verifies a presented credential against the configured secret.
///
/// Both sides are hashed before the constant-time comparison, so the time
/// taken does not depend on where the strings differ or on their lengths.
/// Only the digest of the secret is kept.
#[derive(Clone)]
pub struct CredentialValidator {
    digest: [u8; 32],
}

impl CredentialValidator {
    /// Build a validator for `secret`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the secret is empty.
    pub fn new(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Config(
                "auth.bearer_token resolved to an empty secret".to_string(),
            ));
        }
        Ok(Self {
            digest: sha256(secret),
        })
    }

    /// `true` when `presented` equals the configured secret
    #[must_use]
    pub fn verify(&self, presented: &str) -> bool {
        sha256(presented)[..].ct_eq(&self.digest[..]).into()
    }
}

impl fmt::Debug for CredentialValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialValidator([redacted])")
    }
}

fn sha256(value: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(hasher.finalize().as_slice());
    out
}

/// Where the credential was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// `Authorization: Bearer` header
    Header,
    /// `?token=` query parameter
    Query,
}

/// Information about an authenticated client, attached as a request extension
#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    /// Client identifier (IP address)
    pub client_id: String,
    /// How the credential was presented
    pub via: CredentialSource,
}

/// Shared state of the authentication middleware
#[derive(Debug)]
pub struct AuthState {
    validator: CredentialValidator,
    limiter: Arc<LockoutLimiter>,
    throttle: Arc<RequestThrottle>,
    realm: String,
    trust_proxy_headers: bool,
}

impl AuthState {
    /// Assemble the middleware state
    #[must_use]
    pub fn new(
        validator: CredentialValidator,
        limiter: Arc<LockoutLimiter>,
        throttle: Arc<RequestThrottle>,
        auth: &AuthConfig,
    ) -> Self {
        Self {
            validator,
            limiter,
            throttle,
            realm: auth.realm.clone(),
            trust_proxy_headers: auth.trust_proxy_headers,
        }
    }
}

/// Derive the client identifier for a request.
///
/// Proxy headers are honoured only when `trust_proxy_headers` is set:
/// `X-Real-IP` first, then the first `X-Forwarded-For` entry. Otherwise the
/// peer address is used.
#[must_use]
pub fn client_id(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_proxy_headers: bool,
) -> String {
    if trust_proxy_headers {
        let header_ip = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };
        if let Some(ip) = header_ip("x-real-ip").or_else(|| header_ip("x-forwarded-for")) {
            return ip;
        }
    }

    peer.map_or_else(|| UNKNOWN_CLIENT.to_string(), |addr| addr.ip().to_string())
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Extract the presented credential: bearer header first, then `?token=`
fn presented_credential(request: &Request<Body>) -> Option<(String, CredentialSource)> {
    let from_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim().to_string())
        .filter(|token| !token.is_empty());

    if let Some(token) = from_header {
        return Some((token, CredentialSource::Header));
    }

    Query::<TokenQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(q)| q.token)
        .filter(|token| !token.is_empty())
        .map(|token| (token, CredentialSource::Query))
}

/// Authentication middleware
pub async fn auth_middleware(
    State(auth): State<Arc<AuthState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_id = client_id(request.headers(), peer, auth.trust_proxy_headers);

    let decision = auth.limiter.check_and_record(&client_id, Attempt::Pending);
    if !decision.is_allowed() {
        debug!(client_ip = %client_id, path = %request.uri().path(), "Rejected locked-out client");
        return AuthRejection::from_decision(decision).into_response();
    }

    match presented_credential(&request) {
        Some((token, via)) if auth.validator.verify(&token) => {
            let decision = auth.limiter.check_and_record(&client_id, Attempt::Succeeded);
            if !decision.is_allowed() {
                return AuthRejection::from_decision(decision).into_response();
            }
            if !auth.throttle.try_acquire(&client_id) {
                warn!(client_ip = %client_id, path = %request.uri().path(), "Request throttled");
                return AuthRejection::Throttled.into_response();
            }

            debug!(client_ip = %client_id, via = ?via, "Authenticated request");
            request
                .extensions_mut()
                .insert(AuthenticatedClient { client_id, via });
            next.run(request).await
        }
        presented => {
            let decision = auth.limiter.check_and_record(&client_id, Attempt::Failed);
            warn!(
                client_ip = %client_id,
                path = %request.uri().path(),
                method = %request.method(),
                credential_present = presented.is_some(),
                header_present = request.headers().contains_key(header::AUTHORIZATION),
                locked = !decision.is_allowed(),
                "Authentication failed"
            );
            AuthRejection::Unauthorized {
                realm: auth.realm.clone(),
            }
            .into_response()
        }
    }
}

/// Why a request was refused before reaching a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRejection {
    /// Missing or wrong credential
    Unauthorized {
        /// Realm advertised in `WWW-Authenticate`
        realm: String,
    },
    /// Client identifier is locked out
    Locked {
        /// Seconds advertised in `Retry-After`
        retry_after_secs: u64,
    },
    /// Per-client request quota exhausted
    Throttled,
}

impl AuthRejection {
    fn from_decision(decision: RateDecision) -> Self {
        Self::Locked {
            retry_after_secs: decision.retry_after_secs().unwrap_or(1),
        }
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthorized { realm } => {
                let challenge = HeaderValue::from_str(&format!("Bearer realm=\"{realm}\""))
                    .unwrap_or_else(|_| HeaderValue::from_static("Bearer"));
                (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, challenge)],
                    error_body("Unauthorized"),
                )
                    .into_response()
            }
            Self::Locked { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, HeaderValue::from(retry_after_secs))],
                error_body("Too many failed authentication attempts. Try again later."),
            )
                .into_response(),
            Self::Throttled => (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, HeaderValue::from_static("1"))],
                error_body("Rate limit exceeded. Try again later."),
            )
                .into_response(),
        }
    }
}

fn error_body(message: &str) -> Json<serde_json::Value> {
    Json(json!({
        "jsonrpc": "2.0",
        "error": {
            "code": rpc_codes::SERVER_ERROR_START,
            "message": message
        },
        "id": null
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer() -> Option<SocketAddr> {
        Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9)), 50123))
    }

    #[test]
    fn validator_accepts_only_exact_secret() {
        let validator = CredentialValidator::new("s3cret-token").unwrap();
        assert!(validator.verify("s3cret-token"));
        assert!(!validator.verify("s3cret-toke"));
        assert!(!validator.verify("s3cret-token "));
        assert!(!validator.verify(""));
    }

    #[test]
    fn validator_rejects_empty_secret() {
        assert!(matches!(CredentialValidator::new(""), Err(Error::Config(_))));
    }

    #[test]
    fn validator_debug_is_redacted() {
        let validator = CredentialValidator::new("s3cret-token").unwrap();
        assert!(!format!("{validator:?}").contains("s3cret"));
    }

    #[test]
    fn client_id_ignores_proxy_headers_by_default() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.5"));
        assert_eq!(client_id(&headers, peer(), false), "192.168.1.9");
    }

    #[test]
    fn client_id_prefers_real_ip_then_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.7, 172.16.0.1"));
        assert_eq!(client_id(&headers, peer(), true), "10.0.0.7");

        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.5"));
        assert_eq!(client_id(&headers, peer(), true), "10.0.0.5");
    }

    #[test]
    fn client_id_falls_back_to_unknown() {
        assert_eq!(client_id(&HeaderMap::new(), None, true), UNKNOWN_CLIENT);
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let request = Request::builder()
            .header("authorization", "bearer abc")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            presented_credential(&request),
            Some(("abc".to_string(), CredentialSource::Header))
        );
    }

    #[test]
    fn query_token_is_fallback() {
        let request = Request::builder()
            .uri("/mcp?token=abc")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            presented_credential(&request),
            Some(("abc".to_string(), CredentialSource::Query))
        );

        let request = Request::builder()
            .uri("/mcp?token=abc")
            .header("authorization", "Bearer xyz")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            presented_credential(&request).map(|(t, _)| t),
            Some("xyz".to_string())
        );
    }

    #[test]
    fn other_schemes_are_not_credentials() {
        let request = Request::builder()
            .header("authorization", "Basic YWxhZGRpbjpvcGVu")
            .body(Body::empty())
            .unwrap();
        assert_eq!(presented_credential(&request), None);
    }

    #[test]
    fn locked_rejection_advertises_retry_after() {
        let response = AuthRejection::Locked { retry_after_secs: 300 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "300");
    }

    #[test]
    fn unauthorized_rejection_carries_realm() {
        let response = AuthRejection::Unauthorized {
            realm: "toolgate".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            "Bearer realm=\"toolgate\""
        );
    }
}
