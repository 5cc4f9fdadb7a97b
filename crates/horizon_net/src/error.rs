//! Error types for the networking framework.
//!
//! Every fallible operation in the crate returns [`NetError`]. The variants are
//! grouped by the layer that produces them so callers can decide whether an error
//! is fatal to a connection (protocol and transport errors) or something to handle
//! locally (capacity and state errors).

use thiserror::Error;

/// Errors that can occur anywhere in the networking stack.
#[derive(Debug, Error)]
pub enum NetError {
    // ------------------------------------------------------------------
    // Packet layer
    // ------------------------------------------------------------------
    /// Attempted to encode a packet with a type outside the valid range
    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),
    /// Decoded a packet header carrying an unknown type
    #[error("wrong packet type: {0}")]
    WrongPacketType(u8),
    /// Packet payload exceeds the maximum frame size
    #[error("packet size exceeded: {0} bytes")]
    PacketSizeExceeded(usize),

    // ------------------------------------------------------------------
    // Message layer
    // ------------------------------------------------------------------
    /// Message header carries an unknown message type
    #[error("wrong message type: {0}")]
    WrongMessageType(u8),
    /// Message bytes are truncated or otherwise malformed
    #[error("invalid message")]
    InvalidMessage,
    /// A compressed route code has no entry in the route dictionary
    #[error("route info not found in dictionary: {0}")]
    RouteInfoNotFound(u16),
    /// Route strings are length-prefixed by a single byte
    #[error("route too long: {0} bytes")]
    RouteTooLong(usize),
    /// Route is not of the form `Service.Method`
    #[error("invalid route: {0}")]
    InvalidRoute(String),

    // ------------------------------------------------------------------
    // Session and agent state
    // ------------------------------------------------------------------
    /// The connection behind a session has been closed
    #[error("broken low-level pipe")]
    BrokenPipe,
    /// The outbound queue of a connection is full
    #[error("session send buffer exceeded")]
    BufferExceeded,
    /// Tried to respond while the last inbound message was a notify
    #[error("current session working on notify mode")]
    NotifyMode,
    /// Uids must be positive
    #[error("illegal uid: {0}")]
    IllegalUid(i64),
    /// Close was called on something that is already closed
    #[error("{0} already closed")]
    AlreadyClosed(&'static str),
    /// A packet arrived that is not valid in the connection's current state
    #[error("unexpected packet: {0}")]
    UnexpectedPacket(String),
    /// The handshake validator rejected the client's handshake payload
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------
    /// Operation on a group that has been closed
    #[error("group closed")]
    ClosedGroup,
    /// Session is not a member of the group
    #[error("member not found in the group: {0}")]
    MemberNotFound(i64),

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------
    /// A service with the same name is already registered
    #[error("service already defined: {0}")]
    DuplicateService(String),
    /// No handler registered for a route
    #[error("handler not found: {0}")]
    HandlerNotFound(String),
    /// A handler reported a failure
    #[error("handler execution error: {0}")]
    HandlerExecution(String),
    /// An inbound or outbound pipeline stage rejected a message
    #[error("pipeline error: {0}")]
    Pipeline(String),
    /// No remote node provides the requested service
    #[error("no remote address for service: {0}")]
    RemoteUnavailable(String),
    /// Timer parameters are invalid
    #[error("invalid timer: {0}")]
    InvalidTimer(&'static str),

    // ------------------------------------------------------------------
    // Serialization and I/O
    // ------------------------------------------------------------------
    /// Serialization or deserialization of a payload failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Low-level I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// WebSocket protocol failure
    #[error("websocket error: {0}")]
    WebSocket(String),
    /// Network setup failures such as binding a listener
    #[error("network error: {0}")]
    Network(String),
    /// A [`ServerConfig`](crate::config::ServerConfig) value cannot be used
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

impl NetError {
    /// Shorthand used by handlers to report a failure with a message.
    pub fn handler(msg: impl Into<String>) -> Self {
        NetError::HandlerExecution(msg.into())
    }

    /// Whether this error means the connection can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NetError::InvalidPacketType(_)
                | NetError::WrongPacketType(_)
                | NetError::PacketSizeExceeded(_)
                | NetError::WrongMessageType(_)
                | NetError::InvalidMessage
                | NetError::RouteInfoNotFound(_)
                | NetError::UnexpectedPacket(_)
                | NetError::HandshakeRejected(_)
                | NetError::BrokenPipe
                | NetError::Io(_)
                | NetError::WebSocket(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_errors_are_not_fatal() {
        assert!(!NetError::BufferExceeded.is_fatal());
        assert!(!NetError::NotifyMode.is_fatal());
        assert!(NetError::WrongPacketType(9).is_fatal());
        assert!(NetError::BrokenPipe.is_fatal());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            NetError::DuplicateService("Echo".into()).to_string(),
            "service already defined: Echo"
        );
        assert_eq!(NetError::AlreadyClosed("agent").to_string(), "agent already closed");
    }
}
