//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving `env:` references.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// TLS configuration
    pub tls: TlsConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Failed-authentication lockout and request throttling
    pub rate_limit: RateLimitConfig,
    /// Streaming (heartbeat) configuration
    pub streaming: StreamingConfig,
    /// Shutdown configuration
    pub shutdown: ShutdownConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Path of the multiplexed MCP endpoint
    pub mcp_path: String,
    /// Maximum time a client may take to send request headers
    #[serde(with = "humantime_serde")]
    pub header_read_timeout: Duration,
    /// Sessions without activity for this long are reclaimed
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Production mode: tool failures are reported without internal detail
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8443,
            mcp_path: "/mcp".to_string(),
            header_read_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60 * 60),
            max_body_size: 1024 * 1024,
            production: true,
        }
    }
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Serve HTTPS
    pub enabled: bool,
    /// PEM certificate chain
    pub cert_file: String,
    /// PEM private key
    pub key_file: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_file: "certs/server.crt".to_string(),
            key_file: "certs/server.key".to_string(),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret clients present as a bearer token.
    /// Supports: literal value, `env:VAR_NAME`, or `auto` (generates random token)
    pub bearer_token: Option<String>,
    /// Realm advertised in `WWW-Authenticate`
    pub realm: String,
    /// Derive the client identifier from `X-Real-IP` / `X-Forwarded-For`.
    /// Only enable behind a reverse proxy that overwrites these headers.
    pub trust_proxy_headers: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            bearer_token: None,
            realm: "toolgate".to_string(),
            trust_proxy_headers: false,
        }
    }
}

impl AuthConfig {
    /// Resolve the bearer token (expand env vars, generate if `auto`)
    #[must_use]
    pub fn resolve_bearer_token(&self) -> Option<String> {
        self.bearer_token.as_ref().map(|token| {
            if token == "auto" {
                generate_token()
            } else if let Some(var_name) = token.strip_prefix("env:") {
                env::var(var_name).unwrap_or_default()
            } else {
                token.clone()
            }
        })
    }
}

/// Generate a random shared secret (`tg_` + 32 random bytes, URL-safe base64)
#[must_use]
pub fn generate_token() -> String {
    use rand::RngExt;
    let random_bytes: [u8; 32] = rand::rng().random();
    format!(
        "tg_{}",
        base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, random_bytes)
    )
}

/// Failed-authentication lockout and request throttling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Failed attempts within `window` that trigger a lockout
    pub max_attempts: u32,
    /// Counting window for failed attempts
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// How long a client identifier stays locked out
    #[serde(with = "humantime_serde")]
    pub lockout: Duration,
    /// How often idle lockout entries are swept
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Authenticated requests per second per client IP (0 = unlimited)
    pub requests_per_second: u32,
    /// Burst size for the request throttle
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::from_secs(60),
            lockout: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
            requests_per_second: 0,
            burst_size: 20,
        }
    }
}

/// Streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Interval between heartbeat events on every open stream
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Outbound event buffer per session
    pub buffer_size: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            buffer_size: 64,
        }
    }
}

/// Shutdown configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Upper bound on draining in-flight work
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (TOOLGATE_ prefix)
        figment = figment.merge(Env::prefixed("TOOLGATE_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Check settings the gateway cannot run without
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        match self.auth.bearer_token.as_deref() {
            None | Some("") => {
                return Err(Error::Config(
                    "auth.bearer_token is required (literal, env:VAR or auto)".to_string(),
                ));
            }
            Some(_) => {}
        }
        if !self.server.mcp_path.starts_with('/') {
            return Err(Error::Config(format!(
                "server.mcp_path must start with '/': {}",
                self.server.mcp_path
            )));
        }
        if self.rate_limit.max_attempts == 0 {
            return Err(Error::Config("rate_limit.max_attempts must be > 0".to_string()));
        }
        for (name, value) in [
            ("rate_limit.window", self.rate_limit.window),
            ("rate_limit.lockout", self.rate_limit.lockout),
            ("rate_limit.sweep_interval", self.rate_limit.sweep_interval),
            ("streaming.heartbeat_interval", self.streaming.heartbeat_interval),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        for (name, value) in [
            ("server.header_read_timeout", self.server.header_read_timeout),
            ("server.idle_timeout", self.server.idle_timeout),
            ("rate_limit.window", self.rate_limit.window),
            ("rate_limit.lockout", self.rate_limit.lockout),
            ("rate_limit.sweep_interval", self.rate_limit.sweep_interval),
            ("streaming.heartbeat_interval", self.streaming.heartbeat_interval),
            ("shutdown.grace_period", self.shutdown.grace_period),
        ] {
            if value > MAX_DURATION {
                return Err(Error::Config(format!(
                    "{name} must not exceed {}s",
                    MAX_DURATION.as_secs()
                )));
            }
        }
        if self.tls.enabled && (self.tls.cert_file.is_empty() || self.tls.key_file.is_empty()) {
            return Err(Error::Config(
                "tls.enabled requires tls.cert_file and tls.key_file".to_string(),
            ));
        }
        Ok(())
    }
}

/// Upper bound for every configured duration (one year)
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "1h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "100ms", "30s", "5m", "1h" or a bare number of seconds
    ///
    /// # Errors
    ///
    /// Returns a message if the number is malformed or the duration overflows.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (digits, scale) = if let Some(ms) = s.strip_suffix("ms") {
            return number(ms, s).map(Duration::from_millis);
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, 1)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, 3600)
        } else {
            (s, 1)
        };
        number(digits, s)?
            .checked_mul(scale)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration out of range: {s}"))
    }

    fn number(digits: &str, input: &str) -> Result<u64, String> {
        digits
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("invalid duration {input:?}: {e}"))
    }
}
