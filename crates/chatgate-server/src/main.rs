//! chatgate-server binary.

use chatgate_server::config::{Overrides, RelayPolicy, ServerConfig};
use chatgate_server::{GatewayServer, HttpVerifier};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// chatgate-server — authenticated WebSocket chat gateway
#[derive(Parser, Debug)]
#[command(name = "chatgate-server", version, about = "Authenticated WebSocket chat gateway")]
struct Cli {
    /// WebSocket listen address
    #[arg(long)]
    listen: Option<String>,

    /// Admin HTTP listen address
    #[arg(long)]
    admin_listen: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.chatgate/config.toml")]
    config: String,

    /// Where chat messages from a session are relayed
    #[arg(long, value_enum)]
    relay: Option<RelayPolicy>,

    /// Milliseconds a client has to answer the challenge
    #[arg(long)]
    auth_timeout_ms: Option<u64>,

    /// Base URL of the identity service
    #[arg(long)]
    identity_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting chatgate-server");

    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(
        Some(&config_path),
        Overrides {
            listen: cli.listen,
            admin_listen: cli.admin_listen,
            relay: cli.relay,
            auth_timeout_ms: cli.auth_timeout_ms,
            identity_url: cli.identity_url,
        },
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let verifier = match HttpVerifier::new(&config.identity_url, config.identity_timeout) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "failed to create identity verifier");
            std::process::exit(1);
        }
    };

    let server = GatewayServer::new(config, Arc::new(verifier));
    if let Err(e) = server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("chatgate-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
