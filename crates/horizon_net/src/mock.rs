//! In-memory [`NetworkEntity`] for tests.
//!
//! Records every push and response instead of writing to a socket, so session
//! and group behaviour can be checked without a server.

use crate::error::NetError;
use crate::serializer::{JsonSerializer, Serializer};
use crate::session::{NetworkEntity, Session};
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Recording network entity.
#[derive(Debug, Default)]
pub struct MockEntity {
    pushes: Mutex<Vec<(String, Vec<u8>)>>,
    responses: Mutex<Vec<(u64, Vec<u8>)>>,
    kicks: Mutex<Vec<Vec<u8>>>,
    last_mid: AtomicU64,
    closed: AtomicBool,
}

impl MockEntity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an entity and a JSON session bound to it.
    ///
    /// The session only holds a weak reference: keep the entity alive for as
    /// long as sends should succeed.
    pub fn session(id: i64) -> (Arc<MockEntity>, Arc<Session>) {
        Self::session_with(id, Arc::new(JsonSerializer::new()))
    }

    pub fn session_with(id: i64, serializer: Arc<dyn Serializer>) -> (Arc<MockEntity>, Arc<Session>) {
        let entity = Arc::new(MockEntity::new());
        let weak: Weak<dyn NetworkEntity> = Arc::downgrade(&entity) as Weak<dyn NetworkEntity>;
        let session = Arc::new(Session::new(id, weak, serializer));
        (entity, session)
    }

    pub fn set_last_mid(&self, mid: u64) {
        self.last_mid.store(mid, Ordering::SeqCst);
    }

    pub fn pushes(&self) -> Vec<(String, Vec<u8>)> {
        self.pushes.lock().clone()
    }

    pub fn responses(&self) -> Vec<(u64, Vec<u8>)> {
        self.responses.lock().clone()
    }

    pub fn kicks(&self) -> Vec<Vec<u8>> {
        self.kicks.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), NetError> {
        if self.is_closed() {
            return Err(NetError::BrokenPipe);
        }
        Ok(())
    }
}

impl NetworkEntity for MockEntity {
    fn push(&self, route: &str, data: Bytes) -> Result<(), NetError> {
        self.ensure_open()?;
        self.pushes.lock().push((route.to_string(), data.to_vec()));
        Ok(())
    }

    fn response(&self, data: Bytes) -> Result<(), NetError> {
        self.response_mid(self.last_mid(), data)
    }

    fn response_mid(&self, mid: u64, data: Bytes) -> Result<(), NetError> {
        self.ensure_open()?;
        if mid == 0 {
            return Err(NetError::NotifyMode);
        }
        self.responses.lock().push((mid, data.to_vec()));
        Ok(())
    }

    fn kick(&self, data: Bytes) -> Result<(), NetError> {
        self.ensure_open()?;
        self.kicks.lock().push(data.to_vec());
        Ok(())
    }

    fn close(&self) -> Result<(), NetError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(NetError::AlreadyClosed("mock entity"));
        }
        Ok(())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn last_mid(&self) -> u64 {
        self.last_mid.load(Ordering::SeqCst)
    }
}
