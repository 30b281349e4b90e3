//! Toolgate
//!
//! Authenticated MCP gateway exposing registered tools over Streamable HTTP.
//!
//! # Features
//!
//! - **Bearer auth**: shared secret in `Authorization`, `?token=` fallback
//! - **Lockout**: repeated failed credentials lock a client IP out
//! - **Streaming**: per-session SSE streams with heartbeats (MCP 2025-03-26)
//! - **Tools**: schema-validated dispatch, cancellation and per-tool timeouts
//! - **Shutdown**: bounded by a grace period, in-flight work cancelled
//!
//! # Protocol Version
//!
//! Implements MCP protocol versions 2024-11-05 and 2025-03-26 (Streamable HTTP).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod gateway;
pub mod health;
pub mod protocol;
pub mod security;
pub mod tool;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::security::MaskingWriter;

/// Setup tracing/logging.
///
/// `RUST_LOG` overrides `level`. Output goes to stderr with credentials masked.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);
    let writer = || MaskingWriter::new(std::io::stderr());

    let installed = match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(writer))
            .try_init(),
        _ => subscriber.with(fmt::layer().with_writer(writer)).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
