//! cyberdeck-server: single-user remote terminal.
//!
//! Serves one shell over WebSocket to one admitted client at a time. Clients
//! must come from an allowlisted network; the first session id to claim the
//! terminal holds it until its claim expires.

mod access;
mod config;
mod rooms;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::DeckServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Single-user remote terminal server
#[derive(Parser, Debug)]
#[command(name = "cyberdeck-server", version, about = "Single-user remote terminal server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.cyberdeck/config.toml")]
    config: String,

    /// Shell to run in the terminal
    #[arg(long)]
    shell: Option<String>,

    /// Session time-to-live in seconds
    #[arg(long)]
    session_ttl: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting cyberdeck-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        port: cli.port,
        bind: cli.bind.as_deref(),
        shell: cli.shell.as_deref(),
        session_ttl: cli.session_ttl,
    };
    let server_config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    info!(
        addr = %server_config.bind_addr,
        networks = server_config.allowed_networks.len(),
        "configuration loaded"
    );

    let server = Arc::new(DeckServer::new(server_config));

    tokio::select! {
        result = server.clone().run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            server.shutdown().await;
            // Connection tasks still need to write the shutdown frame.
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    info!("cyberdeck-server stopped");
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
