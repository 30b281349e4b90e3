//! Tools shipped with the gateway binary

use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::registry::{ToolContext, ToolDescriptor, ToolError, ToolHandler, ToolOutput};
use crate::protocol::PROTOCOL_VERSION;

/// Name of the built-in server information tool
pub const SERVER_INFO: &str = "server_info";

/// Reports gateway name, version, protocol and uptime
#[derive(Debug, Clone)]
pub struct ServerInfoTool {
    started_at: Instant,
}

impl ServerInfoTool {
    /// Tool whose uptime counts from `started_at`
    #[must_use]
    pub fn new(started_at: Instant) -> Self {
        Self { started_at }
    }

    /// Descriptor ready for registration
    #[must_use]
    pub fn descriptor(started_at: Instant) -> ToolDescriptor {
        ToolDescriptor::new(SERVER_INFO, Self::new(started_at))
            .with_description("Return gateway name, version, protocol version and uptime")
            .with_schema(json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }))
    }
}

#[async_trait]
impl ToolHandler for ServerInfoTool {
    async fn call(&self, _arguments: Value, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let uptime = self.started_at.elapsed().as_secs();
        Ok(ToolOutput::json(&json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "protocol": PROTOCOL_VERSION,
            "transport": "streamable-http",
            "uptime_secs": uptime,
            "session_id": ctx.session_id,
        })))
    }
}
