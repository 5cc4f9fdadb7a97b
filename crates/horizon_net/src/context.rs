//! Shared state of one server instance.
//!
//! Everything the connection agents and the dispatcher need lives here rather
//! than in process globals, so several servers (or tests) can run side by side
//! in one process.

use crate::cluster::RemoteDispatcher;
use crate::codec;
use crate::config::ServerConfig;
use crate::connection::ConnectionService;
use crate::error::NetError;
use crate::message::RouteDictionary;
use crate::packet::PacketType;
use crate::pipeline::Pipeline;
use crate::scheduler::{LocalScheduler, Scheduler};
use crate::serializer::{JsonSerializer, Serializer};
use crate::session::Lifetime;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;

/// Checks the payload of a client handshake. Returning an error rejects the
/// connection.
pub type HandshakeValidator = Arc<dyn Fn(&[u8]) -> Result<(), NetError> + Send + Sync>;

/// Server-wide state handed to every connection.
pub struct ServerContext {
    config: ServerConfig,
    serializer: Arc<dyn Serializer>,
    pipeline: Arc<Pipeline>,
    dictionary: Arc<RouteDictionary>,
    lifetime: Arc<Lifetime>,
    connections: ConnectionService,
    validator: Option<HandshakeValidator>,
    remote: Option<Arc<dyn RemoteDispatcher>>,
    scheduler: Arc<Scheduler>,
    lanes: DashMap<String, Arc<dyn LocalScheduler>>,
    handshake_response: Bytes,
    heartbeat_packet: Bytes,
}

impl ServerContext {
    /// Creates a context with the JSON serializer, empty pipelines and no route
    /// compression.
    ///
    /// Fails with [`NetError::InvalidConfig`] when `config` does not validate.
    pub fn new(config: ServerConfig) -> Result<Self, NetError> {
        config.validate()?;

        // whole seconds stay integers on the wire
        let heartbeat = if config.heartbeat.subsec_nanos() == 0 {
            json!(config.heartbeat.as_secs())
        } else {
            json!(config.heartbeat.as_secs_f64())
        };
        let handshake = json!({
            "code": 200,
            "sys": { "heartbeat": heartbeat },
        });
        let handshake_response = codec::encode(PacketType::Handshake, &serde_json::to_vec(&handshake)?)?;
        let heartbeat_packet = codec::encode(PacketType::Heartbeat, &[])?;
        let scheduler = Arc::new(Scheduler::new(config.timer_precision, config.task_backlog_warn));

        Ok(Self {
            config,
            serializer: Arc::new(JsonSerializer::new()),
            pipeline: Arc::new(Pipeline::new()),
            dictionary: Arc::new(RouteDictionary::new()),
            lifetime: Arc::new(Lifetime::new()),
            connections: ConnectionService::new(),
            validator: None,
            remote: None,
            scheduler,
            lanes: DashMap::new(),
            handshake_response,
            heartbeat_packet,
        })
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_pipeline(mut self, pipeline: Arc<Pipeline>) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_dictionary(mut self, dictionary: RouteDictionary) -> Self {
        self.dictionary = Arc::new(dictionary);
        self
    }

    pub fn with_validator(mut self, validator: HandshakeValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteDispatcher>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn dictionary(&self) -> &RouteDictionary {
        &self.dictionary
    }

    /// Session lifecycle hooks.
    pub fn lifetime(&self) -> &Arc<Lifetime> {
        &self.lifetime
    }

    pub fn connections(&self) -> &ConnectionService {
        &self.connections
    }

    pub fn validator(&self) -> Option<&HandshakeValidator> {
        self.validator.as_ref()
    }

    pub fn remote(&self) -> Option<&Arc<dyn RemoteDispatcher>> {
        self.remote.as_ref()
    }

    /// The global scheduler.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Registers a named execution lane for services that ask for it.
    pub fn add_lane(&self, name: impl Into<String>, lane: Arc<dyn LocalScheduler>) {
        self.lanes.insert(name.into(), lane);
    }

    pub fn lane(&self, name: &str) -> Option<Arc<dyn LocalScheduler>> {
        self.lanes.get(name).map(|lane| lane.value().clone())
    }

    /// Encoded handshake response packet, computed once.
    pub(crate) fn handshake_response(&self) -> &Bytes {
        &self.handshake_response
    }

    pub(crate) fn heartbeat_packet(&self) -> &Bytes {
        &self.heartbeat_packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decoder;
    use std::time::Duration;

    #[test]
    fn test_handshake_response_advertises_heartbeat() {
        let config = ServerConfig {
            heartbeat: Duration::from_secs(10),
            ..ServerConfig::default()
        };
        let ctx = ServerContext::new(config).unwrap();

        let packets = Decoder::new().decode(ctx.handshake_response()).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].kind, PacketType::Handshake);
        let body: serde_json::Value = serde_json::from_slice(&packets[0].data).unwrap();
        assert_eq!(body["code"], 200);
        assert_eq!(body["sys"]["heartbeat"], 10);

        assert_eq!(ctx.heartbeat_packet().as_ref(), &[3, 0, 0, 0]);
    }

    #[test]
    fn test_sub_second_heartbeat_is_advertised_as_fraction() {
        let config = ServerConfig {
            heartbeat: Duration::from_millis(300),
            ..ServerConfig::default()
        };
        let ctx = ServerContext::new(config).unwrap();

        let packets = Decoder::new().decode(ctx.handshake_response()).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&packets[0].data).unwrap();
        assert_eq!(body["sys"]["heartbeat"].as_f64(), Some(0.3));
    }

    #[test]
    fn test_zero_heartbeat_is_rejected() {
        let config = ServerConfig {
            heartbeat: Duration::ZERO,
            ..ServerConfig::default()
        };
        assert!(matches!(
            ServerContext::new(config),
            Err(NetError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_named_lanes() {
        let ctx = ServerContext::new(ServerConfig::default()).unwrap();
        assert!(ctx.lane("room").is_none());
        ctx.add_lane("room", ctx.scheduler().clone());
        assert!(ctx.lane("room").is_some());
    }
}
