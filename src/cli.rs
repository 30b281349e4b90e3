//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Toolgate - authenticated MCP gateway for registered tools
#[derive(Parser, Debug)]
#[command(name = "toolgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TOOLGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "TOOLGATE_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "TOOLGATE_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "TOOLGATE_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TOOLGATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Print a freshly generated bearer token
    Token,

    /// Load and validate the configuration, then print it with secrets masked
    CheckConfig,
}
