//! Sticky service routing for a session.

use dashmap::DashMap;

/// Remembers which remote address serves a given service for one session.
///
/// Once a session has been bound to a node for a service, every later message
/// for that service is forwarded to the same node.
#[derive(Debug, Default)]
pub struct Router {
    routes: DashMap<String, String>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `service` to `address`, replacing any earlier binding.
    pub fn bind(&self, service: impl Into<String>, address: impl Into<String>) {
        self.routes.insert(service.into(), address.into());
    }

    /// Looks up the address bound to `service`.
    pub fn find(&self, service: &str) -> Option<String> {
        self.routes.get(service).map(|entry| entry.value().clone())
    }

    /// Drops the binding for `service`.
    pub fn unbind(&self, service: &str) -> Option<String> {
        self.routes.remove(service).map(|(_, address)| address)
    }
}
