//! # Horizon Net - Game Server Networking
//!
//! Networking foundation for session-oriented multiplayer game servers. The
//! crate owns everything between the socket and the game logic: packet
//! framing, message encoding, per-connection state, handler dispatch and
//! scheduling. Game code only registers handlers and talks to clients through
//! sessions.
//!
//! ## Architecture Overview
//!
//! * **Packet codec** ([`codec`], [`packet`]) - 4-byte header framing over a byte stream
//! * **Message layer** ([`message`]) - request/notify/response/push with optional route compression
//! * **Connection agent** ([`agent`], [`transport`]) - handshake, heartbeat and the read/write tasks
//! * **Sessions** ([`session`]) - what handlers see of a client, with key/value state
//! * **Dispatcher** ([`handler`], [`component`]) - `"Service.Method"` routing to typed closures
//! * **Scheduler** ([`scheduler`]) - serialized execution of handlers, lanes and timers
//! * **Groups** ([`group`]) - broadcast and multicast to sets of sessions
//! * **Cluster glue** ([`cluster`]) - forwarding routes hosted on other nodes
//!
//! ### Message Flow
//!
//! 1. The read task decodes packets from the transport
//! 2. Data packets are decoded into messages and run through the inbound pipeline
//! 3. The payload is deserialized and the handler call is queued on a scheduler
//! 4. The handler responds or pushes through its [`Session`]
//! 5. The write task encodes queued messages and writes them to the transport
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use horizon_net::{component::Service, NetServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), horizon_net::NetError> {
//!     let server = NetServer::builder(ServerConfig::default())
//!         .service(Service::new("Echo").handle("Ping", |session, text: String| {
//!             session.response(&format!("pong: {}", text))
//!         }))
//!         .build()?;
//!     server.start().await
//! }
//! ```

pub mod agent;
pub mod client;
pub mod cluster;
pub mod codec;
pub mod component;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod group;
pub mod handler;
pub mod message;
pub mod mock;
pub mod packet;
pub mod pipeline;
pub mod scheduler;
pub mod serializer;
pub mod server;
pub mod session;
pub mod transport;

pub use client::Connector;
pub use component::{Component, Service, ServiceOptions};
pub use config::{ServerConfig, TransportKind};
pub use context::ServerContext;
pub use error::NetError;
pub use group::Group;
pub use message::{Message, MessageType, RouteDictionary};
pub use packet::{Packet, PacketType};
pub use server::{NetServer, ServerBuilder};
pub use session::{Lifetime, NetworkEntity, Session};
