//! Application-facing sessions.
//!
//! A [`Session`] is what handler code sees of a client: an identity, a
//! key/value store and a way to talk back. It is bound one-to-one to a
//! transport through the [`NetworkEntity`] trait, so handlers never touch
//! sockets, queues or codecs directly.
//!
//! # Ownership
//!
//! The transport owns its session and the session only holds a weak reference
//! back. Once a connection is gone every send through the session fails with
//! [`NetError::BrokenPipe`] instead of keeping the connection alive.

pub mod lifetime;
pub mod router;

pub use lifetime::{Lifetime, LifetimeHandler};
pub use router::Router;

use crate::error::NetError;
use crate::serializer::{self, Serializer};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

/// Value stored in a session's key/value map.
pub type SessionValue = Arc<dyn Any + Send + Sync>;

/// Transport abstraction a session talks through.
///
/// Implemented by the connection agent; tests use
/// [`MockEntity`](crate::mock::MockEntity).
pub trait NetworkEntity: Send + Sync {
    /// Queues a push message for `route`.
    fn push(&self, route: &str, data: Bytes) -> Result<(), NetError>;

    /// Queues a response to the last request received on this connection.
    fn response(&self, data: Bytes) -> Result<(), NetError>;

    /// Queues a response to the request with id `mid`.
    fn response_mid(&self, mid: u64, data: Bytes) -> Result<(), NetError>;

    /// Queues a kick packet; the connection is closed after it is written.
    fn kick(&self, data: Bytes) -> Result<(), NetError>;

    /// Closes the underlying connection.
    fn close(&self) -> Result<(), NetError>;

    /// Address of the remote peer, when known.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Id of the last request received, 0 after a notify.
    fn last_mid(&self) -> u64;
}

/// Per-connection identity and key/value store.
pub struct Session {
    id: i64,
    uid: AtomicI64,
    data: RwLock<HashMap<String, SessionValue>>,
    router: Router,
    entity: Weak<dyn NetworkEntity>,
    serializer: Arc<dyn Serializer>,
    closed: AtomicBool,
}

macro_rules! typed_getters {
    ($($(#[$doc:meta])* $name:ident => $ty:ty),* $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $name(&self, key: &str) -> $ty {
                self.get::<$ty>(key).unwrap_or_default()
            }
        )*
    };
}

impl Session {
    /// Creates a session for `entity`.
    ///
    /// `id` must be unique within the process; servers allocate it from their
    /// [`ConnectionService`](crate::connection::ConnectionService).
    pub fn new(id: i64, entity: Weak<dyn NetworkEntity>, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            id,
            uid: AtomicI64::new(0),
            data: RwLock::new(HashMap::new()),
            router: Router::new(),
            entity,
            serializer,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Uid bound to this session, 0 when unbound.
    pub fn uid(&self) -> i64 {
        self.uid.load(Ordering::Acquire)
    }

    /// Binds a user id to this session. Rebinding overwrites the previous uid.
    pub fn bind(&self, uid: i64) -> Result<(), NetError> {
        if uid < 1 {
            return Err(NetError::IllegalUid(uid));
        }
        self.uid.store(uid, Ordering::Release);
        Ok(())
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    fn entity(&self) -> Result<Arc<dyn NetworkEntity>, NetError> {
        self.entity.upgrade().ok_or(NetError::BrokenPipe)
    }

    /// Pushes `v` to the client on `route`.
    pub fn push<T: Serialize + ?Sized>(&self, route: &str, v: &T) -> Result<(), NetError> {
        let data = serializer::serialize(self.serializer.as_ref(), v)?;
        self.push_raw(route, data)
    }

    /// Pushes already-encoded bytes to the client on `route`.
    pub fn push_raw(&self, route: &str, data: Bytes) -> Result<(), NetError> {
        self.entity()?.push(route, data)
    }

    /// Responds to the last request received on this session.
    pub fn response<T: Serialize + ?Sized>(&self, v: &T) -> Result<(), NetError> {
        let data = serializer::serialize(self.serializer.as_ref(), v)?;
        self.response_raw(data)
    }

    pub fn response_raw(&self, data: Bytes) -> Result<(), NetError> {
        self.entity()?.response(data)
    }

    /// Responds to the request with id `mid`.
    pub fn response_mid<T: Serialize + ?Sized>(&self, mid: u64, v: &T) -> Result<(), NetError> {
        if mid == 0 {
            return Err(NetError::NotifyMode);
        }
        let data = serializer::serialize(self.serializer.as_ref(), v)?;
        self.entity()?.response_mid(mid, data)
    }

    /// Sends a kick packet carrying `v`, then closes the connection.
    pub fn kick<T: Serialize + ?Sized>(&self, v: &T) -> Result<(), NetError> {
        let data = serializer::serialize(self.serializer.as_ref(), v)?;
        self.entity()?.kick(data)
    }

    /// Closes the underlying connection.
    pub fn close(&self) -> Result<(), NetError> {
        match self.entity.upgrade() {
            Some(entity) => entity.close(),
            None => Err(NetError::AlreadyClosed("session")),
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.entity.upgrade().and_then(|entity| entity.remote_addr())
    }

    /// Id of the last request received, 0 when the last message was a notify.
    pub fn last_mid(&self) -> u64 {
        self.entity.upgrade().map(|entity| entity.last_mid()).unwrap_or(0)
    }

    // Returns true only on the first call
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Key/value store
    // ------------------------------------------------------------------

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.data.write().insert(key.into(), Arc::new(value));
    }

    /// Stores an already shared value under `key`.
    pub fn set_value(&self, key: impl Into<String>, value: SessionValue) {
        self.data.write().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) {
        self.data.write().remove(key);
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    /// Raw stored value for `key`.
    pub fn value(&self, key: &str) -> Option<SessionValue> {
        self.data.read().get(key).cloned()
    }

    /// Value for `key` when it is stored as exactly `T`.
    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.data
            .read()
            .get(key)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    typed_getters! {
        /// `isize` value for `key`, 0 when missing or of another type.
        int => isize,
        int8 => i8,
        int16 => i16,
        int32 => i32,
        int64 => i64,
        /// `usize` value for `key`, 0 when missing or of another type.
        uint => usize,
        uint8 => u8,
        uint16 => u16,
        uint32 => u32,
        uint64 => u64,
        float32 => f32,
        float64 => f64,
        /// `String` value for `key`, empty when missing or of another type.
        string => String,
        boolean => bool,
    }

    /// Snapshot of the key/value store.
    pub fn state(&self) -> HashMap<String, SessionValue> {
        self.data.read().clone()
    }

    /// Replaces the key/value store with a previous snapshot.
    pub fn restore(&self, data: HashMap<String, SessionValue>) {
        *self.data.write() = data;
    }

    /// Wipes stored values and the bound uid.
    pub fn clear(&self) {
        self.data.write().clear();
        self.uid.store(0, Ordering::Release);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("uid", &self.uid())
            .field("closed", &self.is_closed())
            .finish()
    }
}
