//! Beyond - identity-aware reverse proxy
//!
//! Browser logins over OpenID Connect, registry v2 token authentication and
//! per-host access policy in front of internal services.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use beyond::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    registry::TokenSigner,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    // Handle subcommands
    match cli.command {
        Some(Command::CheckConfig) => run_check_config(&cli),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Validate configuration and keys without starting the server
fn run_check_config(cli: &Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration invalid: {e}");
            return ExitCode::FAILURE;
        }
    };

    if config.registry.enabled {
        match TokenSigner::load(&config.registry) {
            Ok(signer) => println!("Registry signing key OK (kid {})", signer.key_id()),
            Err(e) => {
                eprintln!("Registry keys invalid: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    println!("Configuration OK");
    println!("  login host:     {}", config.server.base_url());
    println!("  health path:    {}", config.server.health_path);
    println!("  identity header {}", config.server.user_header());
    println!(
        "  policy:         {} whitelist, {} fence rule(s)",
        config.policy.whitelist.len(),
        config.policy.fence.len()
    );
    ExitCode::SUCCESS
}

async fn run_server(cli: Cli) -> ExitCode {
    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if cli.host.is_some() || cli.port.is_some() {
                config.server.listen = cli.listen_address(&config.server.listen);
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.server.listen,
        registry = config.registry.enabled,
        "Starting beyond"
    );

    // Create and run gateway
    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
