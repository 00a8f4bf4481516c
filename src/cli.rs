//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Beyond - identity-aware reverse proxy with registry token auth
#[derive(Parser, Debug)]
#[command(name = "beyond")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "BEYOND_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on (overrides `server.listen`)
    #[arg(short, long, env = "BEYOND_PORT")]
    pub port: Option<u16>,

    /// Address to bind to (overrides `server.listen`)
    #[arg(long, env = "BEYOND_BIND")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "BEYOND_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "BEYOND_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Validate the configuration and load the registry keys, then exit
    CheckConfig,
}

impl Cli {
    /// Listen address after applying `--host` / `--port` to `listen`.
    #[must_use]
    pub fn listen_address(&self, listen: &str) -> String {
        let (host, port) = listen.rsplit_once(':').unwrap_or((listen, "8080"));
        let host = self.host.as_deref().unwrap_or(host);
        let port = self.port.map_or_else(|| port.to_string(), |p| p.to_string());
        format!("{host}:{port}")
    }
}
