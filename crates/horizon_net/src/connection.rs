//! Connection bookkeeping: live connection count and session id allocation.

use std::sync::atomic::{AtomicI64, Ordering};

/// Tracks live connections and hands out process-unique session ids.
#[derive(Debug, Default)]
pub struct ConnectionService {
    count: AtomicI64,
    sid: AtomicI64,
}

impl ConnectionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections currently open.
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Records a new connection.
    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Records a closed connection.
    pub fn decrement(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Allocates the next session id, starting at 1.
    pub fn session_id(&self) -> i64 {
        self.sid.fetch_add(1, Ordering::SeqCst) + 1
    }
}
