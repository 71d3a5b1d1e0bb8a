//! TCP server with a deferred startup lifecycle.
//!
//! 1. `new()` allocates the registry and lifecycle controller.
//! 2. Routes and hooks are registered through `&mut Server`.
//! 3. `start()` validates the configuration and binds the listener.
//! 4. `run()` consumes the server, freezes the route table and accepts
//!    connections until [`ServerHandle::stop`] is called.
//!
//! Everything that must work while the server runs (sending, broadcasting,
//! heartbeats, stopping) lives on the clonable [`ServerHandle`].

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use framewire_core::{AtomicBoolean, FrameCodec, Message};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backoff::{is_temporary, AcceptBackoff};
use super::config::ServerConfig;
use super::session::{Session, SessionError};
use super::shutdown::{shutdown_signalled, ServerState, ShutdownController};
use crate::concurrent::{SequentialIds, SessionId, SessionIdGenerator, ShardedRegistry};
use crate::service::router::{Access, Handler, HandlerContext, Router};
use crate::timer::{Repeat, TaskId, TimerError, TimerWheel};
use crate::traits::{MessageBus, ServiceDiscovery};

/// Errors returned by [`ServerHandle`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("server is not running")]
    NotRunning,

    #[error("no heartbeat route registered")]
    NoHeartbeatRoute,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Timer(#[from] TimerError),
}

/// Outcome of one accept attempt.
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// The server is stopping; the listener is being closed.
    #[error("listener closed")]
    Closed,

    #[error("accept failed: {0}")]
    Io(#[from] io::Error),
}

/// Observer invoked with a session when it connects or closes.
pub type SessionHook = Arc<dyn Fn(&Session) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    on_connect: Option<SessionHook>,
    on_close: Option<SessionHook>,
}

/// State that only exists once `run()` has frozen the configuration.
struct Running {
    router: Router,
    hooks: Hooks,
    timer: TimerWheel,
}

struct ServerCore {
    config: ServerConfig,
    codec: FrameCodec,
    registry: ShardedRegistry<Session>,
    ids: Arc<dyn SessionIdGenerator>,
    shutdown: ShutdownController,
    running: OnceLock<Running>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: OnceLock<SocketAddr>,
    stopping: AtomicBoolean,
}

/// Server under construction. See the module docs for the lifecycle.
pub struct Server {
    router: Router,
    hooks: Hooks,
    core: Arc<ServerCore>,
}

impl Server {
    /// Creates a server handing out sequential session ids from 1.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self::with_id_generator(config, Arc::new(SequentialIds::new()))
    }

    /// Creates a server with a custom session id source.
    #[must_use]
    pub fn with_id_generator(config: ServerConfig, ids: Arc<dyn SessionIdGenerator>) -> Self {
        let codec = config.codec();
        Self {
            router: Router::new(),
            hooks: Hooks::default(),
            core: Arc::new(ServerCore {
                config,
                codec,
                registry: ShardedRegistry::new(),
                ids,
                shutdown: ShutdownController::new(),
                running: OnceLock::new(),
                listener: Mutex::new(None),
                local_addr: OnceLock::new(),
                stopping: AtomicBoolean::new(false),
            }),
        }
    }

    /// Registers a public route.
    ///
    /// # Panics
    ///
    /// Panics if `msg_id` is already registered.
    pub fn register_route<H: Handler>(&mut self, msg_id: u16, handler: H) -> &mut Self {
        self.router.register(msg_id, handler);
        self
    }

    /// Registers a route reserved for authenticated sessions.
    ///
    /// # Panics
    ///
    /// Panics if `msg_id` is already registered.
    pub fn register_guarded_route<H: Handler>(&mut self, msg_id: u16, handler: H) -> &mut Self {
        self.router.register_guarded(msg_id, handler);
        self
    }

    /// Registers the heartbeat route and message generator.
    ///
    /// # Panics
    ///
    /// Panics if `msg_id` is already registered.
    pub fn register_heartbeat<H: Handler>(&mut self, msg_id: u16, handler: H) -> &mut Self {
        self.router.register_heartbeat(msg_id, handler);
        self
    }

    /// Called after a session is registered, before its loops start.
    pub fn on_connect<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        self.hooks.on_connect = Some(Arc::new(hook));
        self
    }

    /// Called once a session has closed and left the registry.
    pub fn on_close<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        self.hooks.on_close = Some(Arc::new(hook));
        self
    }

    /// Clonable handle for interacting with the server while it runs.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            core: Arc::clone(&self.core),
        }
    }

    /// Validates the configuration and binds the listener.
    ///
    /// Returns the bound address; with port 0 the OS picks the port.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the address
    /// cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        self.core.config.validate()?;
        let listener = TcpListener::bind(self.core.config.bind_address()).await?;
        let addr = listener.local_addr()?;
        let _ = self.core.local_addr.set(addr);
        info!(%addr, network = %self.core.config.network, "listener bound");
        *self.core.listener.lock() = Some(listener);
        Ok(addr)
    }

    /// Accepts connections until the server is stopped.
    ///
    /// Consumes `self`: the route table and hooks are frozen from here on.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; accept failures are logged and retried.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `run()`.
    pub async fn run(self) -> anyhow::Result<()> {
        let core = self.core;
        let listener = core.listener.lock().take();
        let Some(listener) = listener else {
            // `stop()` releases the listener of a server that never ran.
            assert!(
                core.shutdown.is_shutting_down(),
                "start() must be called before run()"
            );
            info!("stopped before run");
            return Ok(());
        };
        if core.shutdown.is_shutting_down() {
            info!("stopped before run");
            return Ok(());
        }
        let _ = core.running.set(Running {
            router: self.router,
            hooks: self.hooks,
            timer: TimerWheel::start(),
        });
        // A `stop()` racing the set above may have missed the timer.
        if core.shutdown.is_shutting_down() {
            if let Some(running) = core.running.get() {
                running.timer.stop().await;
            }
            info!("stopped before run");
            return Ok(());
        }
        core.shutdown.set_running();
        info!(routes = core.router().map_or(0, Router::len), "server running");

        let mut shutdown = core.shutdown.subscribe();
        let mut backoff = AcceptBackoff::new();
        loop {
            match core.accept(&listener, &mut shutdown, &mut backoff).await {
                Ok((stream, peer)) => core.on_connection(stream, peer),
                Err(AcceptError::Closed) => break,
                Err(AcceptError::Io(e)) => {
                    metrics::counter!("framewire_accept_errors_total").increment(1);
                    let delay = backoff.next_delay();
                    error!(error = %e, retry_in = ?delay, "accept failed");
                    if !pause_unless_shutdown(&mut shutdown, delay).await {
                        break;
                    }
                }
            }
        }

        drop(listener);
        info!("listener closed");
        Ok(())
    }
}

impl ServerCore {
    fn router(&self) -> Option<&Router> {
        self.running.get().map(|r| &r.router)
    }

    /// Accepts one connection, retrying transient errors with backoff.
    async fn accept(
        &self,
        listener: &TcpListener,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut AcceptBackoff,
    ) -> Result<(TcpStream, SocketAddr), AcceptError> {
        loop {
            let result = tokio::select! {
                biased;
                () = shutdown_signalled(shutdown) => return Err(AcceptError::Closed),
                result = listener.accept() => result,
            };
            match result {
                Ok(conn) => {
                    backoff.reset();
                    return Ok(conn);
                }
                Err(e) if is_temporary(&e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in = ?delay, "temporary accept error");
                    if !pause_unless_shutdown(shutdown, delay).await {
                        return Err(AcceptError::Closed);
                    }
                }
                Err(e) => return Err(AcceptError::Io(e)),
            }
        }
    }

    fn on_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "failed to set TCP_NODELAY");
        }
        let id = self.ids.next_id();
        let session = Session::new(id, stream, Some(peer), &self.config.session, self.codec);
        if let Err(e) = self.registry.set(id, session.clone()) {
            warn!(session_id = %id, %peer, error = %e, "rejecting connection");
            session.close();
            return;
        }

        let weak = Arc::downgrade(self);
        session.set_on_recv({
            let weak = weak.clone();
            move |s: &Session, msg: Message| {
                if let Some(core) = weak.upgrade() {
                    core.dispatch(s, msg);
                }
            }
        });
        session.set_on_close(move |s| {
            if let Some(core) = weak.upgrade() {
                core.on_session_closed(s);
            }
        });

        metrics::counter!("framewire_sessions_accepted_total").increment(1);
        self.record_active();
        info!(session_id = %id, %peer, "session accepted");

        if let Some(hook) = self.running.get().and_then(|r| r.hooks.on_connect.as_ref()) {
            hook(&session);
        }
        if !session.start() {
            return;
        }

        let heartbeat_route = self.router().and_then(Router::heartbeat).is_some();
        if let (Some(interval), true) = (self.config.heartbeat_interval, heartbeat_route) {
            if let Err(e) = self.enable_heartbeat(id, interval) {
                warn!(session_id = %id, error = %e, "failed to enable heartbeat");
            }
        }
    }

    fn dispatch(&self, session: &Session, msg: Message) {
        let Some(router) = self.router() else { return };
        let _guard = self.shutdown.in_flight_guard();
        let msg_id = msg.msg_id;

        let Some(route) = router.get(msg_id) else {
            metrics::counter!("framewire_unknown_route_total").increment(1);
            warn!(session_id = %session.id(), msg_id, "no route for message");
            return;
        };
        if route.access == Access::Authenticated && !session.is_authenticated() {
            warn!(session_id = %session.id(), msg_id, "guarded route used before authentication");
            session.close();
            return;
        }

        let ctx = HandlerContext::new(session.clone());
        match catch_unwind(AssertUnwindSafe(|| route.handler.call(&ctx, msg.payload))) {
            Ok(Ok(Some(reply))) => {
                if let Err(e) = session.send(&reply) {
                    warn!(session_id = %session.id(), msg_id, error = %e, "reply not sent");
                }
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                warn!(session_id = %session.id(), msg_id, error = %e, "handler failed");
            }
            Err(panic) => {
                metrics::counter!("framewire_handler_panics_total").increment(1);
                error!(
                    session_id = %session.id(),
                    msg_id,
                    panic = panic_message(panic.as_ref()),
                    "handler panicked"
                );
            }
        }
    }

    fn on_session_closed(&self, session: &Session) {
        if let Some(task) = session.replace_heartbeat_task(None) {
            if let Some(running) = self.running.get() {
                running.timer.cancel(task);
            }
        }
        self.registry.remove(session.id());
        metrics::counter!("framewire_sessions_closed_total").increment(1);
        self.record_active();

        if let Some(hook) = self.running.get().and_then(|r| r.hooks.on_close.as_ref()) {
            hook(session);
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_active(&self) {
        metrics::gauge!("framewire_sessions_active").set(self.registry.len() as f64);
    }

    fn session(&self, id: SessionId) -> Result<Session, ServerError> {
        self.registry.get(id).ok_or(ServerError::SessionNotFound(id))
    }

    fn enable_heartbeat(&self, id: SessionId, interval: Duration) -> Result<TaskId, ServerError> {
        let running = self.running.get().ok_or(ServerError::NotRunning)?;
        let session = self.session(id)?;
        let (msg_id, handler) = running.router.heartbeat().ok_or(ServerError::NoHeartbeatRoute)?;

        let target = session.clone();
        let task = running.timer.add_task(interval, Repeat::Forever, move || {
            if !target.is_open() {
                return;
            }
            let ctx = HandlerContext::new(target.clone());
            match handler.call(&ctx, Bytes::new()) {
                Ok(Some(beat)) => {
                    if let Err(e) = target.send(&beat) {
                        debug!(session_id = %target.id(), error = %e, "heartbeat not sent");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(session_id = %target.id(), error = %e, "heartbeat handler failed"),
            }
        })?;

        if let Some(previous) = session.replace_heartbeat_task(Some(task)) {
            running.timer.cancel(previous);
        }
        // Closed between lookup and attach: the close callback has already run.
        if !session.is_open() {
            if let Some(task) = session.replace_heartbeat_task(None) {
                running.timer.cancel(task);
            }
            return Err(ServerError::Session(SessionError::Closed));
        }
        debug!(session_id = %id, msg_id, ?interval, task_id = %task, "heartbeat enabled");
        Ok(task)
    }

    fn broadcast_to<I>(&self, sessions: I, msg: &Message) -> Vec<SessionId>
    where
        I: IntoIterator<Item = (SessionId, Option<Session>)>,
    {
        let packed = msg.pack(self.codec.byte_order());
        let failed: Vec<_> = sessions
            .into_iter()
            .filter_map(|(id, session)| match session {
                Some(s) if s.send_packed(packed.clone()).is_ok() => None,
                _ => Some(id),
            })
            .collect();
        if !failed.is_empty() {
            metrics::counter!("framewire_broadcast_failures_total").increment(failed.len() as u64);
            debug!(msg_id = msg.msg_id, failed = failed.len(), "broadcast partially failed");
        }
        failed
    }

    fn broadcast_all(&self, msg: &Message) -> Vec<SessionId> {
        let sessions = self.registry.values().into_iter().map(|s| (s.id(), Some(s)));
        self.broadcast_to(sessions, msg)
    }
}

/// Sleeps for `delay` unless shutdown is signalled first.
///
/// Returns `false` when interrupted by shutdown.
async fn pause_unless_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        biased;
        () = shutdown_signalled(shutdown) => false,
        () = tokio::time::sleep(delay) => true,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

// ---------------------------------------------------------------------------
// ServerHandle
// ---------------------------------------------------------------------------

/// Shared handle to a server, valid before, during and after `run()`.
#[derive(Clone)]
pub struct ServerHandle {
    core: Arc<ServerCore>,
}

impl ServerHandle {
    /// Address the listener is bound to, once `start()` has succeeded.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr.get().copied()
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        self.core.shutdown.state()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.core.registry.len()
    }

    /// Whether `id` is registered and open.
    #[must_use]
    pub fn check(&self, id: SessionId) -> bool {
        self.core.registry.get(id).is_some_and(|s| s.is_open())
    }

    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.core.registry.get(id)
    }

    /// Queues `msg` on one session without waiting.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` for unknown ids, otherwise the session's send error.
    pub fn send_to_session(&self, id: SessionId, msg: &Message) -> Result<(), ServerError> {
        self.core.session(id)?.send(msg)?;
        Ok(())
    }

    /// Sends `msg` to each of `ids`, packing it once.
    ///
    /// Returns the ids that could not be reached (unknown, closed or blocked).
    #[must_use]
    pub fn broadcast(&self, ids: &[SessionId], msg: &Message) -> Vec<SessionId> {
        let sessions = ids.iter().map(|&id| (id, self.core.registry.get(id)));
        self.core.broadcast_to(sessions, msg)
    }

    /// Sends `msg` to every registered session; returns the failed ids.
    #[must_use]
    pub fn broadcast_all(&self, msg: &Message) -> Vec<SessionId> {
        self.core.broadcast_all(msg)
    }

    /// Forcibly disconnects a session.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` for unknown ids.
    pub fn disable_session(&self, id: SessionId) -> Result<(), ServerError> {
        let session = self.core.session(id)?;
        info!(session_id = %id, "disabling session");
        session.close();
        Ok(())
    }

    /// Marks a session as (un)authenticated from outside a handler.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` for unknown ids.
    pub fn set_authenticated(&self, id: SessionId, authenticated: bool) -> Result<(), ServerError> {
        self.core.session(id)?.set_authenticated(authenticated);
        Ok(())
    }

    /// Starts sending heartbeat messages to a session every `interval`,
    /// replacing any previous heartbeat for it. Cancelled automatically when
    /// the session closes.
    ///
    /// # Errors
    ///
    /// `NotRunning` before `run()`, `SessionNotFound`, `NoHeartbeatRoute`,
    /// or `Timer` once the server is stopping.
    pub fn enable_heartbeat(&self, id: SessionId, interval: Duration) -> Result<TaskId, ServerError> {
        self.core.enable_heartbeat(id, interval)
    }

    /// Stops a session's heartbeat. Returns whether one was active.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` for unknown ids.
    pub fn disable_heartbeat(&self, id: SessionId) -> Result<bool, ServerError> {
        let session = self.core.session(id)?;
        let Some(task) = session.replace_heartbeat_task(None) else {
            return Ok(false);
        };
        if let Some(running) = self.core.running.get() {
            running.timer.cancel(task);
        }
        Ok(true)
    }

    /// Publishes this server's bound address under `key`.
    ///
    /// # Errors
    ///
    /// Fails if the server is not bound yet or the registry call fails.
    pub async fn announce(
        &self,
        discovery: &dyn ServiceDiscovery,
        key: &str,
        ttl: Duration,
    ) -> anyhow::Result<()> {
        let addr = self
            .local_addr()
            .ok_or_else(|| anyhow::anyhow!("server is not bound"))?;
        discovery.register(key, &addr.to_string(), ttl).await?;
        info!(key, %addr, "announced");
        Ok(())
    }

    /// Forwards every message published on `topic` to all sessions as
    /// `msg_id`, until the bus closes the topic or the server stops.
    ///
    /// # Errors
    ///
    /// Fails if subscribing fails.
    pub async fn relay_topic(
        &self,
        bus: &dyn MessageBus,
        topic: &str,
        msg_id: u16,
    ) -> anyhow::Result<JoinHandle<()>> {
        let mut rx = bus.subscribe(topic).await?;
        let mut shutdown = self.core.shutdown.subscribe();
        let core = Arc::clone(&self.core);
        let topic = topic.to_string();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = shutdown_signalled(&mut shutdown) => break,
                    payload = rx.recv() => {
                        let Some(payload) = payload else { break };
                        core.broadcast_all(&Message::new(msg_id, payload));
                    }
                }
            }
            debug!(topic, "topic relay stopped");
        }))
    }

    /// Stops the server: closes the listener, closes and drains every
    /// session, waits for in-flight handlers, then stops the timer wheel.
    ///
    /// Only the first call does anything.
    pub async fn stop(&self) {
        let core = &self.core;
        if !core.stopping.compare_and_set(false, true) {
            return;
        }
        info!(sessions = core.registry.len(), "stopping server");
        core.shutdown.trigger_shutdown();
        // Only present when `run()` never took it.
        if core.listener.lock().take().is_some() {
            info!("listener closed");
        }
        core.registry.dispose().await;
        core.record_active();
        if let Some(running) = core.running.get() {
            running.timer.stop().await;
        }
        if !core.shutdown.wait_for_drain(core.config.drain_timeout).await {
            warn!(
                in_flight = core.shutdown.in_flight_count(),
                "drain timeout expired with handlers still running"
            );
        }
        info!("server stopped");
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr())
            .field("state", &self.state())
            .field("sessions", &self.session_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
