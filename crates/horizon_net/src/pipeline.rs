//! Message transform chains run on inbound and outbound traffic.
//!
//! A stage receives the session and a message and returns the (possibly
//! rewritten) message. The first failing stage stops the chain and the message
//! is dropped.

use crate::error::NetError;
use crate::message::Message;
use crate::session::Session;
use parking_lot::RwLock;
use std::sync::Arc;

/// A single pipeline stage.
pub type Stage = Arc<dyn Fn(&Session, Message) -> Result<Message, NetError> + Send + Sync>;

/// Ordered list of stages for one direction.
#[derive(Default)]
pub struct Channel {
    stages: RwLock<Vec<Stage>>,
}

impl Channel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a stage that runs before all existing ones.
    pub fn push_front<F>(&self, stage: F)
    where
        F: Fn(&Session, Message) -> Result<Message, NetError> + Send + Sync + 'static,
    {
        self.stages.write().insert(0, Arc::new(stage));
    }

    /// Appends a stage that runs after all existing ones.
    pub fn push_back<F>(&self, stage: F)
    where
        F: Fn(&Session, Message) -> Result<Message, NetError> + Send + Sync + 'static,
    {
        self.stages.write().push(Arc::new(stage));
    }

    /// Runs every stage in order.
    pub fn process(&self, session: &Session, msg: Message) -> Result<Message, NetError> {
        let stages = self.stages.read().clone();
        stages.iter().try_fold(msg, |msg, stage| stage(session, msg))
    }

    pub fn len(&self) -> usize {
        self.stages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Inbound and outbound stage chains.
#[derive(Default)]
pub struct Pipeline {
    inbound: Channel,
    outbound: Channel,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages applied to messages received from clients, before dispatch.
    pub fn inbound(&self) -> &Channel {
        &self.inbound
    }

    /// Stages applied to messages sent to clients, before encoding.
    pub fn outbound(&self) -> &Channel {
        &self.outbound
    }
}
