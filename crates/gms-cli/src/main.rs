//! gms — game manager service client CLI.
//!
//! Runs a client authentication attempt against a game manager server and
//! prints the URL to visit and the outcome.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

/// gms — game manager client
#[derive(Parser)]
#[command(name = "gms", version, about = "Game manager client")]
struct Cli {
    /// Server host
    #[arg(long, global = true, default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(short, long, global = true, default_value_t = 35125)]
    port: u16,

    /// Root certificate (PEM) of the server; enables TLS
    #[arg(long, global = true)]
    root_cert: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Authenticate this client through the game manager
    Authenticate {
        /// Seconds to wait for the outcome
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("gms_cli=debug,gms_client=debug,gms_core=debug")
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("gms_cli=warn,gms_client=warn,gms_core=warn")
            .with_target(false)
            .init();
    }

    let target = commands::Target {
        host: cli.host,
        port: cli.port,
        root_cert: cli.root_cert,
    };

    let result = match cli.command {
        Command::Authenticate { timeout } => commands::authenticate::run(&target, timeout).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("gms: {e:#}");
        std::process::exit(1);
    }
}
