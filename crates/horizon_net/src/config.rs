//! Server configuration.

use crate::error::NetError;
use crate::scheduler::{DEFAULT_TASK_BACKLOG_WARN, DEFAULT_TIMER_PRECISION};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Capacity of each connection's outbound queue.
pub const AGENT_WRITE_BACKLOG: usize = 16;

/// Default heartbeat interval advertised to clients.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Which transport the server accepts connections on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Raw packets over TCP
    #[default]
    Tcp,
    /// Packets carried in binary WebSocket messages
    WebSocket,
}

/// Runtime settings of a [`NetServer`](crate::server::NetServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub listen_addr: SocketAddr,
    pub transport: TransportKind,
    /// Request path accepted for WebSocket upgrades
    pub ws_path: String,
    /// Heartbeat interval; a connection silent for twice this long is dropped
    pub heartbeat: Duration,
    /// Tick of the timer sweep
    pub timer_precision: Duration,
    /// Capacity of each connection's outbound queue
    pub write_backlog: usize,
    /// Scheduler backlog that triggers overload warnings
    pub task_backlog_warn: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3250)),
            transport: TransportKind::Tcp,
            ws_path: "/".to_string(),
            heartbeat: DEFAULT_HEARTBEAT,
            timer_precision: DEFAULT_TIMER_PRECISION,
            write_backlog: AGENT_WRITE_BACKLOG,
            task_backlog_warn: DEFAULT_TASK_BACKLOG_WARN,
        }
    }
}

impl ServerConfig {
    /// Rejects settings the agent and scheduler cannot run with.
    pub fn validate(&self) -> Result<(), NetError> {
        if self.heartbeat.is_zero() {
            return Err(NetError::InvalidConfig("heartbeat must be non-zero"));
        }
        if self.write_backlog == 0 {
            return Err(NetError::InvalidConfig("write backlog must be positive"));
        }
        if !self.ws_path.starts_with('/') {
            return Err(NetError::InvalidConfig("websocket path must start with '/'"));
        }
        Ok(())
    }
}
