//! Workspace Execution Agent
//!
//! A per-node service that gives each user an isolated container for
//! importing, editing, building, previewing and version-controlling a web
//! project. One reusable container per user, a managed run engine for
//! dev/build/install tasks, realtime status and terminal channels, idle
//! reaping and orphan garbage collection, behind an HMAC-signed internal
//! API.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cmd;

#[derive(Parser)]
#[command(name = "workspace-agent")]
#[command(about = "Per-node workspace execution agent")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

    /// Path to configuration file
    #[arg(short, long, default_value = "agent.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("workspace_agent={}", log_level).into()),
        )
        .init();

    info!("Starting Workspace Agent v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(cmd::Commands::Diagnostics) => {
            cmd::diagnostics::run(&cli.config).await?;
        }
        None => {
            if let Err(e) = cmd::root::run(&cli.config).await {
                error!("Agent error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
