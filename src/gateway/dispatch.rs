//! `tools/call` dispatch
//!
//! Invocations run as tasks on a [`TaskTracker`] so shutdown can wait for
//! them and a panicking handler only fails its own call. Each invocation is
//! bound to a cancellation token that fires on client disconnect, tool
//! timeout or server shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info_span, warn};

use crate::error::rpc_codes;
use crate::protocol::{JsonRpcResponse, RequestId, ToolsCallParams, ToolsCallResult};
use crate::tool::schema_validator::format_violations;
use crate::tool::{
    ToolContext, ToolError, ToolHandler, ToolOutput, ToolRegistry, validate_arguments,
};
use crate::{Error, Result};

/// Routes tool calls to registered handlers
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    tracker: TaskTracker,
    production: bool,
}

impl Dispatcher {
    /// Create a dispatcher over `registry`.
    ///
    /// In `production` mode execution failures reach clients without detail.
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>, production: bool) -> Self {
        Self {
            registry,
            tracker: TaskTracker::new(),
            production,
        }
    }

    /// The tool registry
    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Tracker owning in-flight invocations
    #[must_use]
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Number of invocations still running
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Invoke `name` with `arguments`.
    ///
    /// Dropping the returned future cancels the invocation.
    pub async fn call(&self, name: &str, arguments: Value, ctx: ToolContext) -> Result<ToolOutput> {
        let tool = self
            .registry
            .get(name)
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))?;

        validate_arguments(&arguments, &tool.input_schema)
            .map_err(|violations| Error::InvalidParams(format_violations(&violations)))?;

        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let guard = ctx.cancel.clone().drop_guard();
        let span = info_span!("tool", tool = %tool.name, client_ip = %ctx.client_id);
        let task = self.tracker.spawn(
            run_tool(
                Arc::clone(&tool.handler),
                tool.name.clone(),
                arguments,
                ctx,
                tool.timeout,
            )
            .instrument(span),
        );

        let joined = task.await;
        guard.disarm();

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                error!(tool = %name, "Tool handler panicked");
                Err(Error::tool_execution(name, "handler panicked"))
            }
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Handle a `tools/call` request, producing its JSON-RPC response
    pub async fn handle_call(
        &self,
        id: RequestId,
        params: Option<Value>,
        ctx: ToolContext,
    ) -> JsonRpcResponse {
        let params: ToolsCallParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(params)) => params,
            Ok(None) => {
                return JsonRpcResponse::error(
                    Some(id),
                    rpc_codes::INVALID_PARAMS,
                    "Missing params",
                );
            }
            Err(e) => {
                return JsonRpcResponse::error(
                    Some(id),
                    rpc_codes::INVALID_PARAMS,
                    format!("Invalid params: {e}"),
                );
            }
        };

        match self.call(&params.name, params.arguments, ctx).await {
            Ok(output) => {
                let result = ToolsCallResult {
                    content: output.content,
                    is_error: false,
                };
                match serde_json::to_value(result) {
                    Ok(value) => JsonRpcResponse::success(id, value),
                    Err(e) => self.error_response(id, &Error::Json(e)),
                }
            }
            Err(e) => self.error_response(id, &e),
        }
    }

    fn error_response(&self, id: RequestId, error: &Error) -> JsonRpcResponse {
        match error {
            Error::ToolExecution { .. } | Error::Internal(_) | Error::Json(_) => {
                warn!(error = %error, "Tool call failed");
            }
            _ => debug!(error = %error, "Tool call rejected"),
        }
        JsonRpcResponse::error(Some(id), error.to_rpc_code(), error.client_message(self.production))
    }
}

async fn run_tool(
    handler: Arc<dyn ToolHandler>,
    name: String,
    arguments: Value,
    ctx: ToolContext,
    timeout: Option<Duration>,
) -> Result<ToolOutput> {
    let cancel = ctx.cancel.clone();
    let started = Instant::now();

    let outcome = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!(tool = %name, "Tool invocation cancelled");
            return Err(Error::Cancelled);
        }
        outcome = with_deadline(handler.call(arguments, ctx), timeout) => outcome,
    };

    match outcome {
        Some(Ok(output)) => {
            debug!(tool = %name, elapsed_ms = started.elapsed().as_millis(), "Tool completed");
            Ok(output)
        }
        Some(Err(ToolError::InvalidArguments(message))) => Err(Error::InvalidParams(message)),
        Some(Err(ToolError::Failed(message))) => Err(Error::tool_execution(name, message)),
        None => {
            cancel.cancel();
            let limit = timeout.unwrap_or_default();
            warn!(tool = %name, timeout_ms = limit.as_millis(), "Tool timed out");
            Err(Error::ToolTimeout(name, limit))
        }
    }
}

/// `None` when the deadline passed first
async fn with_deadline<F: Future>(fut: F, deadline: Option<Duration>) -> Option<F::Output> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}
