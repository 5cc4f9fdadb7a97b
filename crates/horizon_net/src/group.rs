//! Session groups for broadcast and multicast.
//!
//! A [`Group`] is a named set of sessions, typically a room or a channel.
//! Fan-out serializes the payload once and pushes it to every member; a member
//! whose connection is gone is logged and skipped so the rest still receive the
//! message.
//!
//! Groups hold shared references only. A closing session is not removed from
//! its groups automatically; register a [`Lifetime`](crate::session::Lifetime)
//! hook that calls [`Group::leave`].

use crate::error::NetError;
use crate::serializer::{self, Serializer};
use crate::session::Session;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Decides whether a member receives a multicast.
pub type SessionFilter<'a> = &'a dyn Fn(&Session) -> bool;

/// A named set of sessions.
pub struct Group {
    name: String,
    members: RwLock<HashMap<i64, Arc<Session>>>,
    closed: AtomicBool,
    serializer: Arc<dyn Serializer>,
}

impl Group {
    /// Creates a group that serializes payloads with `serializer`.
    pub fn new(name: impl Into<String>, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            name: name.into(),
            members: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            serializer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn ensure_open(&self) -> Result<(), NetError> {
        if self.is_closed() {
            return Err(NetError::ClosedGroup);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Member with session id `sid`.
    pub fn member(&self, sid: i64) -> Option<Arc<Session>> {
        self.members.read().get(&sid).cloned()
    }

    /// Session ids of every member.
    pub fn members(&self) -> Vec<i64> {
        self.members.read().keys().copied().collect()
    }

    pub fn contains(&self, sid: i64) -> bool {
        self.members.read().contains_key(&sid)
    }

    pub fn count(&self) -> usize {
        self.members.read().len()
    }

    /// Adds `session`; adding an existing member replaces it.
    pub fn add(&self, session: Arc<Session>) -> Result<(), NetError> {
        self.ensure_open()?;
        debug!("Add session to group {}, ID={}, UID={}", self.name, session.id(), session.uid());
        self.members.write().insert(session.id(), session);
        Ok(())
    }

    /// Removes the member with session id `sid`.
    pub fn leave(&self, sid: i64) -> Result<(), NetError> {
        self.ensure_open()?;
        match self.members.write().remove(&sid) {
            Some(_) => Ok(()),
            None => Err(NetError::MemberNotFound(sid)),
        }
    }

    /// Removes every member.
    pub fn leave_all(&self) -> Result<(), NetError> {
        self.ensure_open()?;
        self.members.write().clear();
        Ok(())
    }

    /// Pushes `v` on `route` to every member.
    pub fn broadcast<T: Serialize + ?Sized>(&self, route: &str, v: &T) -> Result<(), NetError> {
        self.ensure_open()?;
        let data = serializer::serialize(self.serializer.as_ref(), v)?;
        self.fan_out(route, data, |_| true);
        Ok(())
    }

    /// Pushes `v` on `route` to the members accepted by `filter`.
    pub fn multicast<T: Serialize + ?Sized>(
        &self,
        route: &str,
        v: &T,
        filter: SessionFilter<'_>,
    ) -> Result<(), NetError> {
        self.ensure_open()?;
        let data = serializer::serialize(self.serializer.as_ref(), v)?;
        self.fan_out(route, data, filter);
        Ok(())
    }

    /// Pushes already-encoded bytes to every member.
    pub fn broadcast_raw(&self, route: &str, data: Bytes) -> Result<(), NetError> {
        self.ensure_open()?;
        self.fan_out(route, data, |_| true);
        Ok(())
    }

    fn fan_out(&self, route: &str, data: Bytes, filter: impl Fn(&Session) -> bool) {
        // Snapshot so a slow push never holds the member lock
        let members: Vec<Arc<Session>> = self.members.read().values().cloned().collect();

        debug!("Type=Broadcast Group={} Route={}, Members={}", self.name, route, members.len());
        for session in &members {
            if !filter(session.as_ref()) {
                continue;
            }
            if let Err(e) = session.push_raw(route, data.clone()) {
                warn!(
                    "Push to session {} in group {} failed: {}",
                    session.id(),
                    self.name,
                    e
                );
            }
        }
    }

    /// Closes the group and releases every member.
    pub fn close(&self) -> Result<(), NetError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(NetError::AlreadyClosed("group"));
        }
        self.members.write().clear();
        Ok(())
    }
}
