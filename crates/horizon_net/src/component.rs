//! Components and the services they expose.
//!
//! A [`Service`] is a named set of handlers reachable as `"Service.Method"`.
//! Handlers are plain closures: typed handlers receive their argument already
//! deserialized by the server's serializer, raw handlers receive the payload
//! bytes untouched.
//!
//! ```rust,no_run
//! use horizon_net::component::Service;
//! use horizon_net::NetError;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct JoinRequest { room: String }
//!
//! let service = Service::new("Room").handle("Join", |session, req: JoinRequest| {
//!     session.set("room", req.room);
//!     session.response(&serde_json::json!({ "code": 0 }))
//! });
//! # let _ = service;
//! ```
//!
//! A [`Component`] bundles a service with lifecycle hooks the server calls at
//! startup and shutdown.

use crate::error::NetError;
use crate::serializer::{self, Serializer};
use crate::session::Session;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// A handler call with its argument bound, ready to run on a scheduler.
pub(crate) type Invocation = Box<dyn FnOnce() -> Result<(), NetError> + Send + 'static>;

/// Type-erased handler stored in the dispatcher.
pub(crate) trait Handler: Send + Sync {
    /// Decodes `data` and binds it with `session` into a call.
    fn prepare(
        &self,
        serializer: &dyn Serializer,
        session: Arc<Session>,
        data: Bytes,
    ) -> Result<Invocation, NetError>;
}

struct TypedHandler<T, F> {
    handler: Arc<F>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T, F> Handler for TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(&Arc<Session>, T) -> Result<(), NetError> + Send + Sync + 'static,
{
    fn prepare(
        &self,
        serializer: &dyn Serializer,
        session: Arc<Session>,
        data: Bytes,
    ) -> Result<Invocation, NetError> {
        let arg: T = serializer::deserialize(serializer, &data)?;
        let handler = self.handler.clone();
        Ok(Box::new(move || handler(&session, arg)))
    }
}

struct RawHandler<F> {
    handler: Arc<F>,
}

impl<F> Handler for RawHandler<F>
where
    F: Fn(&Arc<Session>, Bytes) -> Result<(), NetError> + Send + Sync + 'static,
{
    fn prepare(&self, _: &dyn Serializer, session: Arc<Session>, data: Bytes) -> Result<Invocation, NetError> {
        let handler = self.handler.clone();
        Ok(Box::new(move || handler(&session, data)))
    }
}

/// Rewrites method names at registration time.
pub type NameFunc = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Registration options of a service.
#[derive(Clone, Default)]
pub struct ServiceOptions {
    pub(crate) name: Option<String>,
    pub(crate) name_func: Option<NameFunc>,
    pub(crate) sched_name: Option<String>,
}

impl ServiceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the service under `name` instead of its own.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Rewrites every method name, e.g. to lower-case the first letter.
    pub fn with_name_func<F>(mut self, func: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.name_func = Some(Arc::new(func));
        self
    }

    /// Runs the service's handlers on the lane called `name` rather than the
    /// global scheduler.
    pub fn with_sched_name(mut self, name: impl Into<String>) -> Self {
        self.sched_name = Some(name.into());
        self
    }
}

impl fmt::Debug for ServiceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceOptions")
            .field("name", &self.name)
            .field("name_func", &self.name_func.is_some())
            .field("sched_name", &self.sched_name)
            .finish()
    }
}

/// A named set of handlers.
pub struct Service {
    name: String,
    pub(crate) handlers: HashMap<String, Arc<dyn Handler>>,
    pub(crate) options: ServiceOptions,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: HashMap::new(),
            options: ServiceOptions::default(),
        }
    }

    /// Adds a handler whose argument is deserialized into `T`.
    pub fn handle<T, F>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(&Arc<Session>, T) -> Result<(), NetError> + Send + Sync + 'static,
    {
        let handler = TypedHandler {
            handler: Arc::new(handler),
            _phantom: PhantomData,
        };
        self.handlers.insert(method.into(), Arc::new(handler));
        self
    }

    /// Adds a handler that receives the payload bytes as they arrived.
    pub fn handle_raw<F>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Arc<Session>, Bytes) -> Result<(), NetError> + Send + Sync + 'static,
    {
        let handler = RawHandler {
            handler: Arc::new(handler),
        };
        self.handlers.insert(method.into(), Arc::new(handler));
        self
    }

    pub fn with_options(mut self, options: ServiceOptions) -> Self {
        self.options = options;
        self
    }

    /// Name the service registers under, after options are applied.
    pub fn name(&self) -> &str {
        self.options.name.as_deref().unwrap_or(&self.name)
    }

    /// Method names as registered, after options are applied.
    pub fn methods(&self) -> Vec<String> {
        self.handlers.keys().map(|m| self.method_name(m)).collect()
    }

    pub(crate) fn method_name(&self, method: &str) -> String {
        match &self.options.name_func {
            Some(func) => func(method),
            None => method.to_string(),
        }
    }

    pub fn sched_name(&self) -> Option<&str> {
        self.options.sched_name.as_deref()
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name())
            .field("methods", &self.methods())
            .field("sched_name", &self.sched_name())
            .finish()
    }
}

/// A unit of game logic with lifecycle hooks.
///
/// Hooks run in registration order at startup (`init` for every component,
/// then `after_init` for every component) and in reverse order at shutdown.
pub trait Component: Send + Sync + 'static {
    fn init(&self) {}
    fn after_init(&self) {}
    fn before_shutdown(&self) {}
    fn shutdown(&self) {}

    /// The service exposing this component's handlers.
    fn service(&self) -> Service;
}

/// Ordered list of registered components.
#[derive(Default)]
pub struct Components {
    comps: Vec<(Arc<dyn Component>, ServiceOptions)>,
}

impl Components {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, component: Arc<dyn Component>, options: ServiceOptions) {
        self.comps.push((component, options));
    }

    pub fn list(&self) -> &[(Arc<dyn Component>, ServiceOptions)] {
        &self.comps
    }

    pub fn len(&self) -> usize {
        self.comps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comps.is_empty()
    }
}
