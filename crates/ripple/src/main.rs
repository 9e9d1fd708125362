//! # ripple
//!
//! Broker binary — loads settings, wires the server together, and runs
//! until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ripple_server::{metrics, RippleServer};

/// Pusher-compatible real-time pub/sub broker.
#[derive(Parser, Debug)]
#[command(name = "ripple", about = "Real-time pub/sub broker")]
struct Cli {
    /// Path to the settings JSON file.
    #[arg(long, default_value = "ripple.json")]
    settings: PathBuf,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings; 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut settings = ripple_server::load_settings(&args.settings)
        .with_context(|| format!("failed to load settings from {}", args.settings.display()))?;
    if let Some(host) = args.host {
        settings.host = host;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    info!(
        apps = settings.apps.len(),
        host = %settings.host,
        port = settings.port,
        "settings loaded"
    );

    let handle = metrics::install_recorder();
    let server = RippleServer::new(settings, Some(handle));
    let listener = server.bind().await.context("failed to bind listen address")?;

    // Ctrl-C initiates the graceful stop; a second Ctrl-C kills the
    // process the usual way once the handler task is gone.
    let shutdown = server.shutdown_token();
    let _ = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    server.run(listener).await.context("server error")?;
    Ok(())
}
