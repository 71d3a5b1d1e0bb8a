//! Message routing: maps a `msg_id` to the handler that serves it.
//!
//! A `Router` is an owned value built before the server runs and frozen when
//! the server takes it, so concurrent dispatch never observes a registration.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use framewire_core::Message;

use crate::concurrent::SessionId;
use crate::network::session::Session;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Errors a handler may report. They are logged by the server; the session
/// stays open.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Result of handling one message: an optional reply sent back on the
/// same session.
pub type HandlerResult = Result<Option<Message>, HandlerError>;

/// Per-call view of the session a message arrived on.
pub struct HandlerContext {
    session: Session,
}

impl HandlerContext {
    pub(crate) fn new(session: Session) -> Self {
        Self { session }
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    /// Marks the session as (un)authenticated, unlocking guarded routes.
    pub fn set_authenticated(&self, authenticated: bool) {
        self.session.set_authenticated(authenticated);
    }

    /// See [`Session::attribute`].
    #[must_use]
    pub fn attribute<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.session.attribute(key)
    }

    pub fn set_attribute<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.session.set_attribute(key, value);
    }

    pub fn remove_attribute(&self, key: &str) -> bool {
        self.session.remove_attribute(key)
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("session_id", &self.session_id())
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

/// Synchronous message handler. Runs on the session's dispatch loop, so it
/// must not block.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: &HandlerContext, payload: Bytes) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&HandlerContext, Bytes) -> HandlerResult + Send + Sync + 'static,
{
    fn call(&self, ctx: &HandlerContext, payload: Bytes) -> HandlerResult {
        self(ctx, payload)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Who may invoke a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Any session.
    Public,
    /// Only sessions marked authenticated; others are disconnected.
    Authenticated,
}

#[derive(Clone)]
pub struct Route {
    pub access: Access,
    pub handler: Arc<dyn Handler>,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route").field("access", &self.access).finish_non_exhaustive()
    }
}

/// Route table keyed by message id.
#[derive(Debug, Default)]
pub struct Router {
    routes: HashMap<u16, Route>,
    heartbeat: Option<u16>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a public route.
    ///
    /// # Panics
    ///
    /// Panics if `msg_id` is already registered.
    pub fn register<H: Handler>(&mut self, msg_id: u16, handler: H) {
        self.insert(msg_id, Access::Public, Arc::new(handler));
    }

    /// Registers a route only authenticated sessions may use.
    ///
    /// # Panics
    ///
    /// Panics if `msg_id` is already registered.
    pub fn register_guarded<H: Handler>(&mut self, msg_id: u16, handler: H) {
        self.insert(msg_id, Access::Authenticated, Arc::new(handler));
    }

    /// Registers the heartbeat route. Its handler also produces the
    /// server-initiated heartbeat message sent on every timer tick.
    ///
    /// # Panics
    ///
    /// Panics if `msg_id` is already registered.
    pub fn register_heartbeat<H: Handler>(&mut self, msg_id: u16, handler: H) {
        self.insert(msg_id, Access::Public, Arc::new(handler));
        self.heartbeat = Some(msg_id);
    }

    fn insert(&mut self, msg_id: u16, access: Access, handler: Arc<dyn Handler>) {
        assert!(
            !self.routes.contains_key(&msg_id),
            "trying to register message {msg_id} twice"
        );
        self.routes.insert(msg_id, Route { access, handler });
    }

    #[must_use]
    pub fn get(&self, msg_id: u16) -> Option<&Route> {
        self.routes.get(&msg_id)
    }

    /// The heartbeat route's id and handler, if one is registered.
    #[must_use]
    pub fn heartbeat(&self) -> Option<(u16, Arc<dyn Handler>)> {
        let msg_id = self.heartbeat?;
        self.routes
            .get(&msg_id)
            .map(|route| (msg_id, Arc::clone(&route.handler)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
