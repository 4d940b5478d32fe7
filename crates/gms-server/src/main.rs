//! gms-server: game manager server.
//!
//! Listens for game clients and relays their authentication requests to the
//! client authentication server.

use anyhow::Context;
use clap::Parser;
use gms_core::tls::{load_client_tls, load_server_tls};
use gms_server::config::{ConfigOverrides, ServerConfig};
use gms_server::game_manager::GameManagerStructureFactory;
use gms_server::server::ServerMessenger;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, warn};

/// gms-server — game manager server
#[derive(Parser, Debug)]
#[command(name = "gms-server", version, about = "Game manager server")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.gms/server.toml")]
    config: String,

    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Client authentication server host
    #[arg(long)]
    auth_host: Option<String>,

    /// Client authentication server port
    #[arg(long)]
    auth_port: Option<u16>,

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

    if let Err(e) = run(cli).await {
        error!(error = format!("{e:#}"), "gms-server failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let overrides = ConfigOverrides {
        host: cli.host,
        port: cli.port,
        auth_host: cli.auth_host,
        auth_port: cli.auth_port,
    };
    let config = ServerConfig::load(Some(&PathBuf::from(&cli.config)), &overrides)
        .context("failed to load config")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.bind,
        auth_server = %config.auth_server,
        "starting gms-server"
    );

    let acceptor = match &config.tls {
        Some(paths) => Some(
            load_server_tls(&paths.cert, &paths.key).context("failed to load TLS certificate")?,
        ),
        None => None,
    };
    let connector = match &config.auth_root_cert {
        Some(path) => Some(
            load_client_tls(path).context("failed to load authentication server root certificate")?,
        ),
        None => None,
    };

    let factory = GameManagerStructureFactory::builder()
        .client_authentication(config.auth_factory(connector))
        .relay_timeout(config.relay_timeout)
        .build()
        .context("failed to build game manager")?;

    let server = ServerMessenger::new(
        config.socket_config(acceptor),
        config.endpoint_config(),
        factory,
    )
    .context("failed to create server")?;

    let addr = server
        .start_receiving()
        .await
        .context("failed to start listening")?;
    info!(addr = %addr, tls = config.tls.is_some(), "gms-server ready");

    tokio::select! {
        _ = heartbeat(&server, &config) => {}
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.stop_receiving().await;
    server.dispose().await;
    info!("gms-server stopped");
    Ok(())
}

/// Periodically log liveness. Never returns.
async fn heartbeat(server: &ServerMessenger<GameManagerStructureFactory>, config: &ServerConfig) {
    if !config.heartbeat_log {
        return std::future::pending().await;
    }
    let started = Instant::now();
    let mut interval = tokio::time::interval(config.heartbeat_interval);
    interval.tick().await;
    let mut index: u64 = 0;
    loop {
        interval.tick().await;
        index += 1;
        match server.active_connections().await {
            Ok(connections) => info!(
                index,
                elapsed_secs = started.elapsed().as_secs(),
                connections,
                "heartbeat"
            ),
            Err(e) => warn!(index, error = %e, "heartbeat could not count connections"),
        }
    }
}

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
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
