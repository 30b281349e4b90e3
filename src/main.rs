//! Toolgate - authenticated MCP gateway for registered tools

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use toolgate::{
    cli::{Cli, Command},
    config::{Config, generate_token},
    gateway::Gateway,
    security::mask_value,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Some(Command::Token) => {
            println!("{}", generate_token());
            Ok(())
        }
        Some(Command::CheckConfig) => check_config(&cli),
        Some(Command::Serve) | None => run_server(&cli).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    Ok(config)
}

fn check_config(cli: &Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli)?;
    config.validate().context("Invalid configuration")?;

    if let Some(token) = config.auth.bearer_token.as_mut() {
        if token != "auto" && !token.starts_with("env:") {
            *token = mask_value(token);
        }
    }
    let yaml = serde_yaml::to_string(&config).context("Failed to render configuration")?;
    print!("{yaml}");
    Ok(())
}

async fn run_server(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        tls = config.tls.enabled,
        "Starting toolgate"
    );

    let gateway = Gateway::new(config).context("Failed to create gateway")?;
    gateway.run().await.context("Gateway error")?;

    info!("Gateway shutdown complete");
    Ok(())
}
