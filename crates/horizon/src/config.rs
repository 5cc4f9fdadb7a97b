//! Configuration management for the Horizon chat server.
//!
//! Loads the TOML configuration file, applies command-line overrides and
//! converts the result into the networking layer's [`ServerConfig`].

use crate::cli::Args;
use anyhow::{Context, Result};
use horizon_net::{ServerConfig, TransportKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

fn default_ws_path() -> String {
    "/".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_timer_precision_ms() -> u64 {
    1000
}

fn default_write_backlog() -> usize {
    16
}

fn default_task_backlog_warn() -> usize {
    1024
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

/// Network and scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address to listen on (e.g., "127.0.0.1:3250")
    pub listen_address: String,
    /// "tcp" or "websocket"
    #[serde(default)]
    pub transport: TransportKind,
    /// Request path accepted for WebSocket upgrades
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Timer sweep precision in milliseconds
    #[serde(default = "default_timer_precision_ms")]
    pub timer_precision_ms: u64,
    /// Outbound queue capacity per connection
    #[serde(default = "default_write_backlog")]
    pub write_backlog: usize,
    /// Scheduler backlog that triggers overload warnings
    #[serde(default = "default_task_backlog_warn")]
    pub task_backlog_warn: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                listen_address: "127.0.0.1:3250".to_string(),
                transport: TransportKind::Tcp,
                ws_path: default_ws_path(),
                heartbeat_secs: default_heartbeat_secs(),
                timer_precision_ms: default_timer_precision_ms(),
                write_backlog: default_write_backlog(),
                task_backlog_warn: default_task_backlog_warn(),
            },
            logging: LoggingSettings {
                level: "info".to_string(),
                json_format: false,
            },
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, a default configuration file is written at
    /// `path` and the defaults are returned.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: AppConfig =
                toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Applies command-line overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(listen) = &args.listen {
            self.server.listen_address = listen.clone();
        }
        if args.ws {
            self.server.transport = TransportKind::WebSocket;
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
    }

    /// Checks values that would otherwise fail at startup.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.listen_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!("Invalid listen address: {}", &self.server.listen_address));
        }
        if self.server.heartbeat_secs == 0 {
            return Err("Heartbeat interval must be at least one second".to_string());
        }
        if self.server.write_backlog == 0 {
            return Err("Write backlog must be positive".to_string());
        }
        if !self.server.ws_path.starts_with('/') {
            return Err(format!("WebSocket path must start with '/': {}", self.server.ws_path));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }

    /// Converts into the networking layer's configuration.
    pub fn to_server_config(&self) -> Result<ServerConfig> {
        Ok(ServerConfig {
            listen_addr: self
                .server
                .listen_address
                .parse()
                .with_context(|| format!("invalid listen address {}", self.server.listen_address))?,
            transport: self.server.transport,
            ws_path: self.server.ws_path.clone(),
            heartbeat: Duration::from_secs(self.server.heartbeat_secs),
            timer_precision: Duration::from_millis(self.server.timer_precision_ms),
            write_backlog: self.server.write_backlog,
            task_backlog_warn: self.server.task_backlog_warn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_from_nonexistent_file_writes_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.server.listen_address, "127.0.0.1:3250");
        assert!(path.exists());

        // the written file loads back to the same values
        let again = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(again.server.heartbeat_secs, 30);
        assert_eq!(again.server.transport, TransportKind::Tcp);
    }

    #[tokio::test]
    async fn test_load_with_defaults_filled_in() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(
            &path,
            r#"
[server]
listen_address = "0.0.0.0:4000"
transport = "websocket"
ws_path = "/ws"

[logging]
level = "debug"
"#,
        )
        .await
        .unwrap();

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.server.transport, TransportKind::WebSocket);
        assert_eq!(config.server.ws_path, "/ws");
        assert_eq!(config.server.heartbeat_secs, 30);
        assert_eq!(config.server.write_backlog, 16);
        assert!(!config.logging.json_format);

        let server = config.to_server_config().unwrap();
        assert_eq!(server.listen_addr.port(), 4000);
        assert_eq!(server.heartbeat, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_invalid_toml_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[server\nlisten_address = ").await.unwrap();

        assert!(AppConfig::load_from_file(&path).await.is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.server.listen_address = "not-an-address".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.ws_path = "ws".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_args() {
        let mut config = AppConfig::default();
        let args = Args {
            listen: Some("0.0.0.0:5000".to_string()),
            ws: true,
            json_logs: true,
            ..Args::default()
        };
        config.apply_args(&args);

        assert_eq!(config.server.listen_address, "0.0.0.0:5000");
        assert_eq!(config.server.transport, TransportKind::WebSocket);
        assert!(config.logging.json_format);
    }
}
