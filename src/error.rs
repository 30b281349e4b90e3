//! Error types for toolgate

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for toolgate
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tool name registered twice
    #[error("Duplicate tool registration: {0}")]
    DuplicateTool(String),

    /// Tool not registered
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Arguments rejected by the tool's input schema
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Tool handler returned an error or panicked
    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution {
        /// Tool name
        tool: String,
        /// Operator-facing detail (never sent to clients in production mode)
        message: String,
    },

    /// Tool exceeded its own timeout
    #[error("Tool timed out after {1:?}: {0}")]
    ToolTimeout(String, Duration),

    /// Invocation cancelled by client disconnect or shutdown
    #[error("Request cancelled")]
    Cancelled,

    /// Listener bind failure
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address that could not be bound
        addr: String,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },

    /// TLS material could not be loaded
    #[error("TLS error: {0}")]
    Tls(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a tool execution error
    pub fn tool_execution(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::ToolNotFound(_) => rpc_codes::METHOD_NOT_FOUND,
            Self::InvalidParams(_) => rpc_codes::INVALID_PARAMS,
            Self::Cancelled | Self::ToolTimeout(..) => rpc_codes::SERVER_ERROR_START,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }

    /// Message safe to return to a client.
    ///
    /// Execution and internal errors are reduced to a generic message when
    /// `production` is set; full detail stays in server-side logs.
    #[must_use]
    pub fn client_message(&self, production: bool) -> String {
        match self {
            Self::ToolExecution { tool, .. } if production => {
                format!("Tool execution failed: {tool}")
            }
            Self::Internal(_) | Self::Io(_) if production => "Internal error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Standard JSON-RPC error codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Implementation-defined server error (cancellation, timeout, lockout)
    pub const SERVER_ERROR_START: i32 = -32000;
}
