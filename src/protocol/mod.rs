//! MCP Protocol types (version 2025-03-26)

mod messages;
mod types;

pub use messages::*;
pub use types::*;

/// MCP Protocol version spoken by the gateway
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Protocol versions the gateway accepts, newest first
pub const SUPPORTED_VERSIONS: &[&str] = &["2025-03-26", "2024-11-05"];

/// Pick the protocol version for a client.
///
/// Echoes the client's version when supported, otherwise falls back to
/// [`PROTOCOL_VERSION`].
#[must_use]
pub fn negotiate_version(client_version: Option<&str>) -> &'static str {
    client_version
        .and_then(|v| SUPPORTED_VERSIONS.iter().find(|s| **s == v).copied())
        .unwrap_or(PROTOCOL_VERSION)
}
