//! Tool registry, argument validation and built-in tools

pub mod builtin;
pub mod registry;
pub mod schema_validator;

pub use builtin::ServerInfoTool;
pub use registry::{
    FnHandler, ToolContext, ToolDescriptor, ToolError, ToolHandler, ToolOutput, ToolRegistry,
    ToolRegistryBuilder,
};
pub use schema_validator::{Violation, validate_arguments};
