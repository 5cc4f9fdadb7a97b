//! Session lifetime hooks.

use super::Session;
use parking_lot::RwLock;
use std::sync::Arc;

/// Callback fired when a session's connection goes away.
pub type LifetimeHandler = Arc<dyn Fn(&Arc<Session>) + Send + Sync>;

/// Ordered list of callbacks run when a session closes.
///
/// Each server context owns one `Lifetime`; components register their cleanup
/// (leaving rooms, saving state) in `after_init`.
#[derive(Default)]
pub struct Lifetime {
    on_closed: RwLock<Vec<LifetimeHandler>>,
}

impl Lifetime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for closed sessions.
    pub fn on_closed<F>(&self, handler: F)
    where
        F: Fn(&Arc<Session>) + Send + Sync + 'static,
    {
        self.on_closed.write().push(Arc::new(handler));
    }

    /// Runs every registered callback for `session`, at most once per session.
    pub fn close(&self, session: &Arc<Session>) {
        if !session.mark_closed() {
            return;
        }

        // Snapshot so callbacks can register further hooks without deadlocking
        let handlers: Vec<LifetimeHandler> = self.on_closed.read().clone();
        for handler in handlers {
            handler(session);
        }
    }

    pub fn len(&self) -> usize {
        self.on_closed.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
