//! # Horizon Chat Server
//!
//! Demo server for the `horizon_net` networking layer. Clients connect over
//! TCP or WebSocket, perform the handshake and join a shared chat room.
//!
//! ## Usage
//!
//! ```bash
//! # Start with default configuration
//! horizon
//!
//! # Custom listen address over WebSocket
//! horizon --listen 0.0.0.0:3250 --ws
//!
//! # Custom config file with debug logging
//! horizon --config my_config.toml --debug
//! ```

mod chat;
mod cli;
mod config;
mod logging;
mod signals;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use cli::Args;
use config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load_from_file(&args.config).await?;
    config.apply_args(&args);

    let level = if args.debug { "debug".to_string() } else { config.logging.level.clone() };
    logging::setup_logging(&level, config.logging.json_format)?;

    if let Err(e) = config.validate() {
        error!("❌ Invalid configuration: {}", e);
        anyhow::bail!("invalid configuration: {e}");
    }

    info!("🎮 Horizon chat server v{}", env!("CARGO_PKG_VERSION"));
    info!("📂 Config: {}", args.config.display());

    let (server, _room) = chat::build_server(config.to_server_config()?)?;
    let server = Arc::new(server);

    let signal_server = server.clone();
    tokio::spawn(async move {
        if let Err(e) = signals::wait_for_shutdown().await {
            error!("❌ Signal handling failed: {}", e);
        }
        info!("🛑 Shutdown requested");
        signal_server.shutdown();
    });

    server.start().await?;

    info!("✅ Horizon chat server stopped");
    Ok(())
}
