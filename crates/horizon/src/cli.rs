//! Command-line argument parsing
//!
//! Flags given here override the matching configuration file settings.

use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments for the Horizon chat server
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    ///
    /// If the file doesn't exist, a default configuration will be created.
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Server listen address
    ///
    /// Format: "IP:PORT" (e.g., "127.0.0.1:3250" or "0.0.0.0:3250")
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Accept WebSocket connections instead of raw TCP
    #[arg(long)]
    pub ws: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Output logs in JSON format
    #[arg(long)]
    pub json_logs: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: PathBuf::from("config.toml"),
            listen: None,
            ws: false,
            debug: false,
            json_logs: false,
        }
    }
}
