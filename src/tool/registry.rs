//! Tool registry: the fixed set of operations exposed to clients
//!
//! Tools are registered once through [`ToolRegistryBuilder`]; the built
//! [`ToolRegistry`] is immutable and shared behind an `Arc`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::protocol::{Content, Tool};
use crate::{Error, Result};

/// Per-invocation context handed to a [`ToolHandler`]
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Cancelled on client disconnect, tool timeout or server shutdown
    pub cancel: CancellationToken,
    /// Session the call arrived on
    pub session_id: Option<String>,
    /// Authenticated client identifier
    pub client_id: String,
}

impl ToolContext {
    /// Context with a fresh token and no session
    #[must_use]
    pub fn detached(client_id: impl Into<String>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            session_id: None,
            client_id: client_id.into(),
        }
    }
}

/// Successful tool output
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// Content items returned to the client
    pub content: Vec<Content>,
}

impl ToolOutput {
    /// Single text item
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
        }
    }

    /// Pretty-printed JSON as a single text item
    #[must_use]
    pub fn json(value: &Value) -> Self {
        Self::text(serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()))
    }
}

/// Error returned by a tool handler
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    /// Arguments were well-typed but semantically unusable
    #[error("{0}")]
    InvalidArguments(String),
    /// The tool ran and failed
    #[error("{0}")]
    Failed(String),
}

/// An invokable tool implementation
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool.
    ///
    /// Long-running handlers should watch `ctx.cancel` and return early once
    /// it fires.
    async fn call(
        &self,
        arguments: Value,
        ctx: ToolContext,
    ) -> std::result::Result<ToolOutput, ToolError>;
}

/// Adapter turning an async closure into a [`ToolHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<ToolOutput, ToolError>> + Send,
{
    async fn call(
        &self,
        arguments: Value,
        ctx: ToolContext,
    ) -> std::result::Result<ToolOutput, ToolError> {
        (self.0)(arguments, ctx).await
    }
}

/// A registered tool
#[derive(Clone)]
pub struct ToolDescriptor {
    /// Unique tool name
    pub name: String,
    /// Human-readable description
    pub description: Option<String>,
    /// JSON Schema for the arguments
    pub input_schema: Value,
    /// Optional per-call deadline
    pub timeout: Option<Duration>,
    /// Implementation
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDescriptor {
    /// Describe a tool backed by `handler`
    pub fn new(name: impl Into<String>, handler: impl ToolHandler + 'static) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: json!({"type": "object"}),
            timeout: None,
            handler: Arc::new(handler),
        }
    }

    /// Describe a tool backed by an async closure
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<ToolOutput, ToolError>> + Send + 'static,
    {
        Self::new(name, FnHandler(f))
    }

    /// Set the description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the input schema
    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Set a per-call deadline
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wire representation for `tools/list`
    #[must_use]
    pub fn to_tool(&self) -> Tool {
        Tool {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Collects tools before the registry is frozen
#[derive(Debug, Default)]
pub struct ToolRegistryBuilder {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistryBuilder {
    /// Empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool.
    ///
    /// # Errors
    ///
    /// `Error::DuplicateTool` if the name is taken, `Error::Config` if it is
    /// empty.
    pub fn register(&mut self, tool: ToolDescriptor) -> Result<&mut Self> {
        if tool.name.trim().is_empty() {
            return Err(Error::Config("tool name must not be empty".to_string()));
        }
        if self.tools.contains_key(&tool.name) {
            return Err(Error::DuplicateTool(tool.name));
        }
        self.tools.insert(tool.name.clone(), tool);
        Ok(self)
    }

    /// Freeze the registry
    #[must_use]
    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}

/// Immutable name → tool map
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    /// Start building a registry
    #[must_use]
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::new()
    }

    /// Exact-match lookup
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// All tools, sorted by name
    #[must_use]
    pub fn list(&self) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self.tools.values().map(ToolDescriptor::to_tool).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Number of tools
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
