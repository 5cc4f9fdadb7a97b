//! Cluster glue: forwarding messages for services hosted on other nodes.
//!
//! The dispatcher only knows the [`RemoteDispatcher`] trait. [`ClusterDispatcher`]
//! is the bundled implementation: it resolves which member hosts the service,
//! keeps a small pool of connections per member address and forwards each
//! message as a [`RemoteEnvelope`]. The actual RPC transport is supplied by the
//! application through [`Dialer`] and [`RemoteConnection`].

use crate::error::NetError;
use crate::message::{Message, MessageType};
use crate::session::Session;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Connections opened to each member address.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Forwards messages with no local handler.
pub trait RemoteDispatcher: Send + Sync {
    /// Forwards `msg` received on `session`. With `no_copy` the payload buffer
    /// is shared instead of copied.
    fn remote_process(&self, session: &Arc<Session>, msg: Message, no_copy: bool) -> Result<(), NetError>;
}

/// A node of the cluster and the services it hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub label: String,
    pub service_addr: String,
    pub services: Vec<String>,
}

/// Known cluster members.
#[derive(Debug, Default)]
pub struct MemberRegistry {
    members: RwLock<Vec<MemberInfo>>,
}

impl MemberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a member, replacing any previous entry with the same address.
    pub fn add(&self, member: MemberInfo) {
        let mut members = self.members.write();
        members.retain(|m| m.service_addr != member.service_addr);
        info!("🌐 Member {} joined at {}", member.label, member.service_addr);
        members.push(member);
    }

    pub fn remove(&self, addr: &str) -> Option<MemberInfo> {
        let mut members = self.members.write();
        let index = members.iter().position(|m| m.service_addr == addr)?;
        Some(members.remove(index))
    }

    /// Members hosting `service`, in join order.
    pub fn members_for(&self, service: &str) -> Vec<MemberInfo> {
        self.members
            .read()
            .iter()
            .filter(|m| m.services.iter().any(|s| s == service))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Picks the member that serves a session's request.
pub trait MemberSelector: Send + Sync {
    fn select(&self, session: &Session, service: &str, members: &[MemberInfo]) -> Option<String>;
}

/// Selects the first member hosting the service.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstMember;

impl MemberSelector for FirstMember {
    fn select(&self, _: &Session, _: &str, members: &[MemberInfo]) -> Option<String> {
        members.first().map(|m| m.service_addr.clone())
    }
}

/// A message forwarded to another node, with the session identity it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEnvelope {
    pub session_id: i64,
    pub uid: i64,
    pub kind: MessageType,
    pub id: u64,
    pub route: String,
    pub data: Bytes,
}

/// One connection to a member.
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    async fn send(&self, envelope: RemoteEnvelope) -> Result<(), NetError>;
}

/// Opens connections to members.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn RemoteConnection>, NetError>;
}

/// Fixed set of connections to one address, handed out round-robin.
pub struct ConnectionPool {
    addr: String,
    conns: Vec<Arc<dyn RemoteConnection>>,
    index: AtomicUsize,
}

impl ConnectionPool {
    /// Dials `size` connections to `addr`.
    pub async fn connect(dialer: &dyn Dialer, addr: &str, size: usize) -> Result<Self, NetError> {
        let mut conns = Vec::with_capacity(size.max(1));
        for _ in 0..size.max(1) {
            conns.push(dialer.dial(addr).await?);
        }
        debug!("Connection pool to {} ready with {} connection(s)", addr, conns.len());
        Ok(Self {
            addr: addr.to_string(),
            conns,
            index: AtomicUsize::new(0),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Next connection in round-robin order.
    pub fn get(&self) -> Arc<dyn RemoteConnection> {
        let i = self.index.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        self.conns[i].clone()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

struct ClusterInner {
    registry: Arc<MemberRegistry>,
    selector: Arc<dyn MemberSelector>,
    dialer: Arc<dyn Dialer>,
    pool_size: usize,
    pools: Mutex<HashMap<String, Arc<ConnectionPool>>>,
}

impl ClusterInner {
    async fn pool(&self, addr: &str) -> Result<Arc<ConnectionPool>, NetError> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(addr) {
            return Ok(pool.clone());
        }
        let pool = Arc::new(ConnectionPool::connect(self.dialer.as_ref(), addr, self.pool_size).await?);
        pools.insert(addr.to_string(), pool.clone());
        Ok(pool)
    }

    async fn forward(&self, addr: &str, envelope: RemoteEnvelope) -> Result<(), NetError> {
        self.pool(addr).await?.get().send(envelope).await
    }
}

/// [`RemoteDispatcher`] routing by service name over a [`MemberRegistry`].
#[derive(Clone)]
pub struct ClusterDispatcher {
    inner: Arc<ClusterInner>,
}

impl ClusterDispatcher {
    pub fn new(registry: Arc<MemberRegistry>, dialer: Arc<dyn Dialer>) -> Self {
        Self::with_options(registry, dialer, Arc::new(FirstMember), DEFAULT_POOL_SIZE)
    }

    pub fn with_options(
        registry: Arc<MemberRegistry>,
        dialer: Arc<dyn Dialer>,
        selector: Arc<dyn MemberSelector>,
        pool_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                registry,
                selector,
                dialer,
                pool_size,
                pools: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<MemberRegistry> {
        &self.inner.registry
    }

    /// Address of the member that should serve `service` for `session`.
    ///
    /// A sticky binding on the session's router wins over the selector.
    pub fn resolve(&self, session: &Session, service: &str) -> Result<String, NetError> {
        if let Some(addr) = session.router().find(service) {
            return Ok(addr);
        }

        let members = self.inner.registry.members_for(service);
        if members.is_empty() {
            return Err(NetError::RemoteUnavailable(service.to_string()));
        }
        self.inner
            .selector
            .select(session, service, &members)
            .ok_or_else(|| NetError::RemoteUnavailable(service.to_string()))
    }
}

impl RemoteDispatcher for ClusterDispatcher {
    fn remote_process(&self, session: &Arc<Session>, msg: Message, no_copy: bool) -> Result<(), NetError> {
        let Some((service, _)) = msg.route.rsplit_once('.') else {
            return Err(NetError::InvalidRoute(msg.route.clone()));
        };
        let addr = self.resolve(session, service)?;

        let data = if no_copy {
            msg.data
        } else {
            Bytes::copy_from_slice(&msg.data)
        };
        let envelope = RemoteEnvelope {
            session_id: session.id(),
            uid: session.uid(),
            kind: msg.kind,
            id: msg.id,
            route: msg.route,
            data,
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let route = envelope.route.clone();
            if let Err(e) = inner.forward(&addr, envelope).await {
                warn!("Forward {} to {} failed: {}", route, addr, e);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEntity;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ChannelConnection {
        index: usize,
        tx: mpsc::UnboundedSender<(usize, RemoteEnvelope)>,
    }

    #[async_trait]
    impl RemoteConnection for ChannelConnection {
        async fn send(&self, envelope: RemoteEnvelope) -> Result<(), NetError> {
            self.tx
                .send((self.index, envelope))
                .map_err(|e| NetError::Network(e.to_string()))
        }
    }

    struct ChannelDialer {
        dials: AtomicUsize,
        tx: mpsc::UnboundedSender<(usize, RemoteEnvelope)>,
    }

    #[async_trait]
    impl Dialer for ChannelDialer {
        async fn dial(&self, _addr: &str) -> Result<Arc<dyn RemoteConnection>, NetError> {
            let index = self.dials.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ChannelConnection {
                index,
                tx: self.tx.clone(),
            }))
        }
    }

    fn member(addr: &str, services: &[&str]) -> MemberInfo {
        MemberInfo {
            label: format!("node-{}", addr),
            service_addr: addr.to_string(),
            services: services.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_registry_replaces_same_address() {
        let registry = MemberRegistry::new();
        registry.add(member("10.0.0.1:4000", &["Room"]));
        registry.add(member("10.0.0.1:4000", &["Room", "Chat"]));
        registry.add(member("10.0.0.2:4000", &["Chat"]));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.members_for("Chat").len(), 2);
        assert!(registry.remove("10.0.0.1:4000").is_some());
        assert!(registry.members_for("Room").is_empty());
    }

    #[tokio::test]
    async fn test_sticky_route_wins_over_selector() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = Arc::new(MemberRegistry::new());
        registry.add(member("a:1", &["Room"]));
        let dispatcher = ClusterDispatcher::new(
            registry,
            Arc::new(ChannelDialer {
                dials: AtomicUsize::new(0),
                tx,
            }),
        );
        let (_entity, session) = MockEntity::session(1);

        assert_eq!(dispatcher.resolve(&session, "Room").unwrap(), "a:1");
        session.router().bind("Room", "b:2");
        assert_eq!(dispatcher.resolve(&session, "Room").unwrap(), "b:2");
        assert!(matches!(
            dispatcher.resolve(&session, "Mail"),
            Err(NetError::RemoteUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_round_robins_pool() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = Arc::new(MemberRegistry::new());
        registry.add(member("a:1", &["game.Room"]));
        let dispatcher = ClusterDispatcher::with_options(
            registry,
            Arc::new(ChannelDialer {
                dials: AtomicUsize::new(0),
                tx,
            }),
            Arc::new(FirstMember),
            2,
        );
        let (_entity, session) = MockEntity::session(5);
        session.bind(42).unwrap();

        let mut seen = Vec::new();
        for i in 0..3u64 {
            let msg = Message::request(i + 1, "game.Room.Join", Bytes::from_static(b"{}"));
            dispatcher.remote_process(&session, msg, false).unwrap();
            // wait for each forward so the pool is created once
            let (index, envelope) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(envelope.session_id, 5);
            assert_eq!(envelope.uid, 42);
            assert_eq!(envelope.route, "game.Room.Join");
            assert_eq!(envelope.id, i + 1);
            seen.push(index);
        }
        assert_eq!(seen, vec![0, 1, 0]);
    }

    #[test]
    fn test_route_without_service_is_invalid() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let dispatcher = ClusterDispatcher::new(
            Arc::new(MemberRegistry::new()),
            Arc::new(ChannelDialer {
                dials: AtomicUsize::new(0),
                tx,
            }),
        );
        let (_entity, session) = MockEntity::session(1);
        let result = dispatcher.remote_process(&session, Message::notify("ping", Bytes::new()), true);
        assert!(matches!(result, Err(NetError::InvalidRoute(_))));
    }
}
