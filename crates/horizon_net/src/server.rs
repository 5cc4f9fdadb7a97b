//! Server runtime: builder, accept loop and lifecycle.
//!
//! [`NetServer`] wires a [`ServerContext`] and a [`HandlerService`] together,
//! accepts TCP or WebSocket connections and hands each one to a connection
//! agent. Startup and shutdown drive the registered components' lifecycle
//! hooks.
//!
//! ```rust,no_run
//! use horizon_net::{NetServer, ServerConfig, component::Service};
//!
//! # async fn run() -> Result<(), horizon_net::NetError> {
//! let server = NetServer::builder(ServerConfig::default())
//!     .service(Service::new("Echo").handle("Ping", |session, text: String| {
//!         session.response(&text)
//!     }))
//!     .build()?;
//! server.start().await
//! # }
//! ```

use crate::agent;
use crate::cluster::RemoteDispatcher;
use crate::component::{Component, Components, Service, ServiceOptions};
use crate::config::{ServerConfig, TransportKind};
use crate::context::{HandshakeValidator, ServerContext};
use crate::error::NetError;
use crate::handler::HandlerService;
use crate::message::RouteDictionary;
use crate::pipeline::Pipeline;
use crate::scheduler::{signalled, LocalScheduler};
use crate::serializer::Serializer;
use crate::transport::split_websocket;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Decides whether a WebSocket upgrade with the given `Origin` header is
/// accepted.
pub type OriginCheck = Arc<dyn Fn(Option<&str>) -> bool + Send + Sync>;

/// Collects everything a [`NetServer`] is built from.
pub struct ServerBuilder {
    config: ServerConfig,
    serializer: Option<Arc<dyn Serializer>>,
    pipeline: Option<Arc<Pipeline>>,
    validator: Option<HandshakeValidator>,
    dictionary: Option<RouteDictionary>,
    remote: Option<Arc<dyn RemoteDispatcher>>,
    check_origin: Option<OriginCheck>,
    lanes: Vec<(String, Arc<dyn LocalScheduler>)>,
    components: Components,
    services: Vec<Service>,
}

impl ServerBuilder {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            serializer: None,
            pipeline: None,
            validator: None,
            dictionary: None,
            remote: None,
            check_origin: None,
            lanes: Vec::new(),
            components: Components::new(),
            services: Vec::new(),
        }
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn pipeline(mut self, pipeline: Arc<Pipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Checks every client handshake payload before it is answered.
    pub fn handshake_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&[u8]) -> Result<(), NetError> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Enables route compression for the routes in `dictionary`.
    pub fn route_dictionary(mut self, dictionary: RouteDictionary) -> Self {
        self.dictionary = Some(dictionary);
        self
    }

    pub fn remote_dispatcher(mut self, remote: Arc<dyn RemoteDispatcher>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Filters WebSocket upgrades by their `Origin` header. All origins are
    /// accepted by default.
    pub fn check_origin<F>(mut self, check: F) -> Self
    where
        F: Fn(Option<&str>) -> bool + Send + Sync + 'static,
    {
        self.check_origin = Some(Arc::new(check));
        self
    }

    /// Registers a named lane for services declaring that scheduler name.
    pub fn lane(mut self, name: impl Into<String>, lane: Arc<dyn LocalScheduler>) -> Self {
        self.lanes.push((name.into(), lane));
        self
    }

    /// Registers a component. Options given here replace any set on the
    /// component's service.
    pub fn component(mut self, component: Arc<dyn Component>, options: ServiceOptions) -> Self {
        self.components.register(component, options);
        self
    }

    /// Registers a service with no lifecycle hooks.
    pub fn service(mut self, service: Service) -> Self {
        self.services.push(service);
        self
    }

    /// Runs component startup hooks and registers every service.
    ///
    /// Fails on the first duplicate service name.
    pub fn build(self) -> Result<NetServer, NetError> {
        let mut ctx = ServerContext::new(self.config)?;
        if let Some(serializer) = self.serializer {
            ctx = ctx.with_serializer(serializer);
        }
        if let Some(pipeline) = self.pipeline {
            ctx = ctx.with_pipeline(pipeline);
        }
        if let Some(validator) = self.validator {
            ctx = ctx.with_validator(validator);
        }
        if let Some(dictionary) = self.dictionary {
            ctx = ctx.with_dictionary(dictionary);
        }
        if let Some(remote) = self.remote {
            ctx = ctx.with_remote(remote);
        }
        for (name, lane) in self.lanes {
            ctx.add_lane(name, lane);
        }

        let handlers = Arc::new(HandlerService::new(Arc::new(ctx)));

        for (component, _) in self.components.list() {
            component.init();
        }
        for (component, _) in self.components.list() {
            component.after_init();
        }
        for (component, options) in self.components.list() {
            handlers.register(component.service().with_options(options.clone()))?;
        }
        for service in self.services {
            handlers.register(service)?;
        }

        let (shutdown, _) = watch::channel(false);
        Ok(NetServer {
            handlers,
            components: self.components,
            check_origin: self.check_origin,
            shutdown,
        })
    }
}

/// A game server instance.
pub struct NetServer {
    handlers: Arc<HandlerService>,
    components: Components,
    check_origin: Option<OriginCheck>,
    shutdown: watch::Sender<bool>,
}

impl NetServer {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        self.handlers.context()
    }

    pub fn handlers(&self) -> &Arc<HandlerService> {
        &self.handlers
    }

    /// Binds the configured listen address.
    pub fn listen(&self) -> Result<TcpListener, NetError> {
        bind(self.context().config().listen_addr)
    }

    /// Accepts connections on `listener` until [`shutdown`](Self::shutdown) is
    /// called, then runs the shutdown hooks.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), NetError> {
        let ctx = self.context().clone();
        ctx.scheduler().start();

        let local_addr = listener.local_addr()?;
        info!(
            "🚀 Server listening on {} ({:?}), {} service(s)",
            local_addr,
            ctx.config().transport,
            self.handlers.services().len()
        );

        let stop = signalled(self.shutdown.subscribe());
        tokio::pin!(stop);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_connection(stream, addr),
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        break;
                    }
                },
                _ = &mut stop => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Binds and serves.
    pub async fn start(&self) -> Result<(), NetError> {
        let listener = self.listen()?;
        self.serve(listener).await
    }

    /// Asks the accept loop to stop. Safe to call before [`serve`](Self::serve).
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let handlers = self.handlers.clone();
        match self.context().config().transport {
            TransportKind::Tcp => {
                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    agent::serve(handlers, reader, writer, Some(addr)).await;
                });
            }
            TransportKind::WebSocket => {
                let path = self.context().config().ws_path.clone();
                let check_origin = self.check_origin.clone();
                tokio::spawn(async move {
                    match accept_websocket(stream, &path, check_origin).await {
                        Ok(ws) => {
                            let (reader, writer) = split_websocket(ws);
                            agent::serve(handlers, reader, writer, Some(addr)).await;
                        }
                        Err(e) => warn!("WebSocket upgrade from {} failed: {}", addr, e),
                    }
                });
            }
        }
    }

    async fn stop(&self) {
        info!("🧹 Performing server cleanup...");
        let comps = self.components.list();
        for (component, _) in comps.iter().rev() {
            component.before_shutdown();
        }
        for (component, _) in comps.iter().rev() {
            component.shutdown();
        }
        self.context().scheduler().close().await;
        info!("✅ Server stopped");
    }
}

fn bind(addr: SocketAddr) -> Result<TcpListener, NetError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| NetError::Network(format!("Socket creation failed: {e}")))?;
    if let Err(e) = socket.set_reuse_address(true) {
        warn!("Failed to set SO_REUSEADDR: {}", e);
    }
    socket
        .bind(&addr.into())
        .map_err(|e| NetError::Network(format!("Bind failed: {e}")))?;
    socket
        .listen(1024)
        .map_err(|e| NetError::Network(format!("Listen failed: {e}")))?;

    let std_listener: StdTcpListener = socket.into();
    std_listener
        .set_nonblocking(true)
        .map_err(|e| NetError::Network(format!("Set nonblocking failed: {e}")))?;
    TcpListener::from_std(std_listener)
        .map_err(|e| NetError::Network(format!("Tokio listener creation failed: {e}")))
}

fn reject(status: StatusCode) -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = status;
    response
}

async fn accept_websocket(
    stream: TcpStream,
    path: &str,
    check_origin: Option<OriginCheck>,
) -> Result<WebSocketStream<TcpStream>, NetError> {
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() != path {
            return Err(reject(StatusCode::NOT_FOUND));
        }
        let origin = req.headers().get("origin").and_then(|v| v.to_str().ok());
        match &check_origin {
            Some(check) if !check(origin) => Err(reject(StatusCode::FORBIDDEN)),
            _ => Ok(resp),
        }
    };

    tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| NetError::WebSocket(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Component for Recorder {
        fn init(&self) {
            self.log.lock().push(format!("init {}", self.name));
        }
        fn after_init(&self) {
            self.log.lock().push(format!("after_init {}", self.name));
        }
        fn before_shutdown(&self) {
            self.log.lock().push(format!("before_shutdown {}", self.name));
        }
        fn shutdown(&self) {
            self.log.lock().push(format!("shutdown {}", self.name));
        }
        fn service(&self) -> Service {
            Service::new(self.name).handle_raw("Noop", |_, _| Ok(()))
        }
    }

    fn local_config() -> ServerConfig {
        ServerConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_component_lifecycle_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let server = NetServer::builder(local_config())
            .component(
                Arc::new(Recorder { name: "A", log: log.clone() }),
                ServiceOptions::new(),
            )
            .component(
                Arc::new(Recorder { name: "B", log: log.clone() }),
                ServiceOptions::new(),
            )
            .build()
            .unwrap();
        assert!(server.handlers().has_handler("A.Noop"));
        assert!(server.handlers().has_handler("B.Noop"));

        let listener = server.listen().unwrap();
        server.shutdown();
        server.serve(listener).await.unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "init A",
                "init B",
                "after_init A",
                "after_init B",
                "before_shutdown B",
                "before_shutdown A",
                "shutdown B",
                "shutdown A",
            ]
        );
    }

    #[test]
    fn test_duplicate_service_fails_build() {
        let result = NetServer::builder(local_config())
            .service(Service::new("Echo"))
            .service(Service::new("Echo"))
            .build();
        assert!(matches!(result, Err(NetError::DuplicateService(_))));
    }
}
