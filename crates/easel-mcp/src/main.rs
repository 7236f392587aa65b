//! Easel MCP Server
//!
//! This binary runs the Easel sandbox as an MCP server over stdio.
//! It exposes an `execute` tool that runs JavaScript snippets against a
//! canvas workspace.

use std::path::PathBuf;

use clap::Parser;
use easel::EaselConfig;
use easel_mcp::EaselServer;
use rmcp::ServiceExt;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Easel MCP Server - JavaScript sandbox for canvas workspaces
#[derive(Parser, Debug)]
#[command(name = "easel-mcp")]
#[command(about = "MCP server exposing the Easel workspace sandbox")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the data directory from the configuration
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Workspace used when a call names none; created if missing
    #[arg(long, default_value = "default")]
    workspace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Output to stderr so it doesn't interfere with MCP stdio
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let mut config = EaselConfig::load(args.config.as_deref())?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    tracing::info!(data_dir = %config.data_dir.display(), workspace = %args.workspace, "Starting Easel MCP server");

    let server = EaselServer::new(&config, args.workspace).await?;

    let service = server
        .serve(rmcp::transport::stdio())
        .await
        .inspect_err(|e| {
            tracing::error!("Failed to start MCP service: {}", e);
        })?;

    tracing::info!("Easel MCP server running");

    service.waiting().await?;

    tracing::info!("Easel MCP server shutting down");

    Ok(())
}
