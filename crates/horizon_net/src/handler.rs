//! Message dispatch.
//!
//! [`HandlerService`] owns the route table built from registered services and
//! turns each inbound message into a task on the right scheduler. Routes with
//! no local handler go to the configured
//! [`RemoteDispatcher`](crate::cluster::RemoteDispatcher).

use crate::agent::Agent;
use crate::component::{Handler, Service};
use crate::context::ServerContext;
use crate::error::NetError;
use crate::message::{Message, MessageType};
use crate::scheduler::{LocalScheduler, Task};
use crate::session::Session;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
struct LocalHandler {
    sched_name: Option<String>,
    handler: Arc<dyn Handler>,
}

/// Route table and dispatcher of one server.
pub struct HandlerService {
    context: Arc<ServerContext>,
    // service name -> registered method count
    services: DashMap<String, usize>,
    handlers: DashMap<String, LocalHandler>,
}

impl HandlerService {
    pub fn new(context: Arc<ServerContext>) -> Self {
        Self {
            context,
            services: DashMap::new(),
            handlers: DashMap::new(),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Adds every handler of `service` under `"Service.Method"`.
    pub fn register(&self, service: Service) -> Result<(), NetError> {
        let name = service.name().to_string();
        match self.services.entry(name.clone()) {
            Entry::Occupied(_) => return Err(NetError::DuplicateService(name)),
            Entry::Vacant(entry) => {
                entry.insert(service.handlers.len());
            }
        }

        let sched_name = service.sched_name().map(str::to_string);
        for (method, handler) in &service.handlers {
            let route = format!("{}.{}", name, service.method_name(method));
            debug!("Register local handler {}", route);
            self.handlers.insert(
                route,
                LocalHandler {
                    sched_name: sched_name.clone(),
                    handler: handler.clone(),
                },
            );
        }

        info!("📋 Registered service {} with {} handler(s)", name, service.handlers.len());
        Ok(())
    }

    pub fn has_handler(&self, route: &str) -> bool {
        self.handlers.contains_key(route)
    }

    /// Names of the registered services.
    pub fn services(&self) -> Vec<String> {
        self.services.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Dispatches a message received by `agent`.
    pub(crate) fn process_message(&self, agent: &Arc<Agent>, msg: Message) {
        let mid = match msg.kind {
            MessageType::Request => msg.id,
            MessageType::Notify => 0,
            other => {
                warn!("Invalid message type: {}", other);
                return;
            }
        };

        let Some(local) = self.handlers.get(&msg.route).map(|h| h.value().clone()) else {
            self.remote_process(agent.session(), msg);
            return;
        };

        let session = agent.session().clone();
        let route = msg.route.clone();
        let msg = match self.context.pipeline().inbound().process(&session, msg) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Inbound pipeline rejected {} on session {}: {}", route, session.id(), e);
                return;
            }
        };

        let call = match local
            .handler
            .prepare(self.context.serializer().as_ref(), session.clone(), msg.data)
        {
            Ok(call) => call,
            Err(e) => {
                warn!("Deserialize payload of {} failed: {}", route, e);
                return;
            }
        };

        debug!("UID={}, Message={}, Route={}, Mid={}", session.uid(), msg.kind, route, mid);

        let agent = agent.clone();
        let task: Task = Box::new(move || {
            agent.set_last_mid(mid);
            if let Err(e) = call() {
                error!("Handler {} failed: {}", route, e);
            }
        });
        self.schedule(&session, local.sched_name.as_deref(), task);
    }

    fn schedule(&self, session: &Session, sched_name: Option<&str>, task: Task) {
        let Some(name) = sched_name else {
            self.context.scheduler().push_task(task);
            return;
        };

        // per-session lane first, then the server-wide one
        if let Some(lane) = session.get::<Arc<dyn LocalScheduler>>(name) {
            lane.schedule(task);
        } else if let Some(lane) = self.context.lane(name) {
            lane.schedule(task);
        } else {
            warn!(
                "Scheduler {} not found for session {}, message dropped",
                name,
                session.id()
            );
        }
    }

    fn remote_process(&self, session: &Arc<Session>, msg: Message) {
        let Some(remote) = self.context.remote() else {
            warn!("No handler for route {}, message dropped", msg.route);
            return;
        };

        let route = msg.route.clone();
        if let Err(e) = remote.remote_process(session, msg, false) {
            warn!("Forward {} to remote failed: {}", route, e);
        }
    }
}
