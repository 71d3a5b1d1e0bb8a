//! One framed connection and its three cooperating loops.
//!
//! A session is created idle. Callers install `on_recv` / `on_close` and
//! then call [`Session::start`], which spawns:
//!
//! - the **recv loop**, decoding frames from the transport into the bounded
//!   inbound queue (blocking when the queue is full);
//! - the **dispatch loop**, handing each frame to `on_recv` and counting
//!   idle periods, closing the session once too many pass without traffic;
//! - the **send loop**, draining the bounded outbound queue onto the
//!   transport, with every write bounded by `send_timeout`.
//!
//! Any loop that fails closes the whole session. Closing is idempotent: the
//! `Open -> Closing` CAS admits exactly one closer, which cancels the loops,
//! drops the outbound queue and runs `on_close` once.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use framewire_core::{AtomicBoolean, AtomicInt32, AtomicInt64, CodecError, FrameCodec, Message};
use futures_util::future::join_all;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::SessionConfig;
use crate::concurrent::{Disposable, SessionId};
use crate::timer::TaskId;

/// Error returned when queueing an outbound message fails.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,

    #[error("send queue is full")]
    Blocked,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

const OPEN: i32 = 0;
const CLOSING: i32 = 1;
const CLOSED: i32 = 2;

/// Any byte stream a session can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type BoxedTransport = Box<dyn Transport>;

/// Invoked on the dispatch loop for every inbound message.
pub type RecvCallback = Arc<dyn Fn(&Session, Message) + Send + Sync>;

/// Invoked exactly once, by whichever caller closes the session.
pub type CloseCallback = Box<dyn FnOnce(&Session) + Send>;

type Attribute = Arc<dyn Any + Send + Sync>;

struct Idle {
    reader: FramedRead<ReadHalf<BoxedTransport>, FrameCodec>,
    writer: FramedWrite<WriteHalf<BoxedTransport>, FrameCodec>,
    send_rx: mpsc::Receiver<Bytes>,
}

struct Inner {
    id: SessionId,
    peer: Option<SocketAddr>,
    config: SessionConfig,
    codec: FrameCodec,
    state: AtomicInt32,
    idle_periods: AtomicInt64,
    authenticated: AtomicBoolean,
    attributes: RwLock<HashMap<String, Attribute>>,
    shutdown: CancellationToken,
    send_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    idle: Mutex<Option<Idle>>,
    on_recv: RwLock<Option<RecvCallback>>,
    on_close: Mutex<Option<CloseCallback>>,
    heartbeat: Mutex<Option<TaskId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheaply clonable handle to a session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Wraps `io` in a session without starting any loop.
    pub fn new<T>(
        id: SessionId,
        io: T,
        peer: Option<SocketAddr>,
        config: &SessionConfig,
        codec: FrameCodec,
    ) -> Self
    where
        T: Transport,
    {
        let (read_half, write_half) = tokio::io::split(Box::new(io) as BoxedTransport);
        let (send_tx, send_rx) = mpsc::channel(config.send_queue_size);
        let idle = Idle {
            reader: FramedRead::new(read_half, codec),
            writer: FramedWrite::new(write_half, codec),
            send_rx,
        };

        Self {
            inner: Arc::new(Inner {
                id,
                peer,
                config: config.clone(),
                codec,
                state: AtomicInt32::new(OPEN),
                idle_periods: AtomicInt64::new(0),
                authenticated: AtomicBoolean::new(false),
                attributes: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                send_tx: Mutex::new(Some(send_tx)),
                idle: Mutex::new(Some(idle)),
                on_recv: RwLock::new(None),
                on_close: Mutex::new(None),
                heartbeat: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Opens an outbound TCP connection and wraps it in an idle session.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from connecting.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        id: SessionId,
        config: &SessionConfig,
        codec: FrameCodec,
    ) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        Ok(Self::new(id, stream, peer, config, codec))
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    #[must_use]
    pub fn codec(&self) -> FrameCodec {
        self.inner.codec
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        match self.inner.state.get() {
            OPEN => SessionState::Open,
            CLOSING => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.state.get() == OPEN
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.get()
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.inner.authenticated.set(authenticated);
    }

    /// Typed value stored under `key`, if present and of type `T`.
    #[must_use]
    pub fn attribute<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let value = self.inner.attributes.read().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set_attribute<T>(&self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.inner
            .attributes
            .write()
            .insert(key.into(), Arc::new(value));
    }

    /// Removes `key`. Returns whether it was present.
    pub fn remove_attribute(&self, key: &str) -> bool {
        self.inner.attributes.write().remove(key).is_some()
    }

    pub fn clear_attributes(&self) {
        self.inner.attributes.write().clear();
    }

    #[must_use]
    pub fn attribute_count(&self) -> usize {
        self.inner.attributes.read().len()
    }

    /// Heartbeat timer currently attached to this session.
    #[must_use]
    pub fn heartbeat_task(&self) -> Option<TaskId> {
        *self.inner.heartbeat.lock()
    }

    /// Attaches (or detaches, with `None`) a heartbeat timer, returning the previous one.
    pub fn replace_heartbeat_task(&self, task: Option<TaskId>) -> Option<TaskId> {
        std::mem::replace(&mut *self.inner.heartbeat.lock(), task)
    }

    pub fn set_on_recv<F>(&self, f: F)
    where
        F: Fn(&Session, Message) + Send + Sync + 'static,
    {
        *self.inner.on_recv.write() = Some(Arc::new(f));
    }

    pub fn set_on_close<F>(&self, f: F)
    where
        F: FnOnce(&Session) + Send + 'static,
    {
        *self.inner.on_close.lock() = Some(Box::new(f));
    }

    /// Spawns the recv, dispatch and send loops.
    ///
    /// Returns `false` if the session was already started or closed.
    pub fn start(&self) -> bool {
        let Some(idle) = self.inner.idle.lock().take() else {
            return false;
        };
        let (recv_tx, recv_rx) = mpsc::channel(self.inner.config.recv_queue_size);
        let handles = vec![
            tokio::spawn(recv_loop(self.clone(), idle.reader, recv_tx)),
            tokio::spawn(dispatch_loop(self.clone(), recv_rx)),
            tokio::spawn(send_loop(self.clone(), idle.writer, idle.send_rx)),
        ];
        self.inner.tasks.lock().extend(handles);
        debug!(session_id = %self.inner.id, peer = ?self.inner.peer, "session started");
        true
    }

    /// Queues `msg` for sending without waiting.
    ///
    /// # Errors
    ///
    /// `Closed` if the session is closing or closed, `Blocked` if the send
    /// queue is full, `Codec` if the packed message exceeds the send limit.
    pub fn send(&self, msg: &Message) -> Result<(), SessionError> {
        self.send_packed(msg.pack(self.inner.codec.byte_order()))
    }

    /// Queues an already packed `[msg_id][payload]` buffer.
    ///
    /// Broadcasts pack once and hand the same `Bytes` to every session.
    ///
    /// # Errors
    ///
    /// As [`Session::send`].
    pub fn send_packed(&self, packed: Bytes) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::Closed);
        }
        self.inner.codec.check_send(packed.len())?;
        let guard = self.inner.send_tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(SessionError::Closed);
        };
        tx.try_send(packed).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::Blocked,
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        })
    }

    /// Closes the session. Only the first call has any effect and returns `true`.
    pub fn close(&self) -> bool {
        if !self.inner.state.compare_and_set(OPEN, CLOSING) {
            return false;
        }
        self.inner.shutdown.cancel();
        self.inner.send_tx.lock().take();
        // Never started: dropping the halves closes the transport.
        self.inner.idle.lock().take();
        self.inner.state.set(CLOSED);
        info!(session_id = %self.inner.id, peer = ?self.inner.peer, "session closed");

        let callback = self.inner.on_close.lock().take();
        if let Some(callback) = callback {
            callback(self);
        }
        // Cleared after `on_close` so the callback can still read them.
        self.clear_attributes();
        true
    }

    /// Waits until every loop of this session has exited.
    pub async fn wait_closed(&self) {
        let handles = std::mem::take(&mut *self.inner.tasks.lock());
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(session_id = %self.inner.id, error = %e, "session task failed");
            }
        }
    }

    fn dispatch(&self, msg: Message) {
        let callback = self.inner.on_recv.read().clone();
        if let Some(callback) = callback {
            callback(self, msg);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Disposable for Session {
    async fn dispose(&self) {
        self.close();
        self.wait_closed().await;
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

async fn recv_loop(
    session: Session,
    mut reader: FramedRead<ReadHalf<BoxedTransport>, FrameCodec>,
    recv_tx: mpsc::Sender<Bytes>,
) {
    let token = session.inner.shutdown.clone();
    let id = session.inner.id;
    loop {
        let next = tokio::select! {
            biased;
            () = token.cancelled() => break,
            next = reader.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    sent = recv_tx.send(frame) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Some(Err(CodecError::Io(e))) => {
                debug!(session_id = %id, error = %e, "transport read failed");
                break;
            }
            Some(Err(e)) => {
                warn!(session_id = %id, error = %e, "invalid frame");
                break;
            }
            None => {
                debug!(session_id = %id, "peer closed connection");
                break;
            }
        }
    }
    session.close();
}

async fn dispatch_loop(session: Session, mut recv_rx: mpsc::Receiver<Bytes>) {
    let token = session.inner.shutdown.clone();
    let id = session.inner.id;
    let order = session.inner.codec.byte_order();
    let read_timeout = session.inner.config.read_timeout;
    let allowed = i64::from(session.inner.config.read_timeout_times);
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            frame = recv_rx.recv() => {
                let Some(frame) = frame else { break };
                match Message::parse(frame, order) {
                    Ok(msg) => {
                        session.inner.idle_periods.set(0);
                        session.dispatch(msg);
                    }
                    Err(e) => {
                        warn!(session_id = %id, error = %e, "dropping session on malformed message");
                        break;
                    }
                }
            }
            () = tokio::time::sleep(read_timeout) => {
                let idle = session.inner.idle_periods.increment_and_get();
                if idle > allowed {
                    warn!(session_id = %id, idle_periods = idle, "read idle budget exhausted");
                    break;
                }
                debug!(session_id = %id, idle_periods = idle, "read idle");
            }
        }
    }
    session.close();
}

async fn send_loop(
    session: Session,
    mut writer: FramedWrite<WriteHalf<BoxedTransport>, FrameCodec>,
    mut send_rx: mpsc::Receiver<Bytes>,
) {
    let token = session.inner.shutdown.clone();
    let id = session.inner.id;
    let send_timeout = session.inner.config.send_timeout;
    loop {
        let packed = tokio::select! {
            biased;
            () = token.cancelled() => break,
            packed = send_rx.recv() => match packed {
                Some(packed) => packed,
                None => break,
            },
        };
        match tokio::time::timeout(send_timeout, writer.send(packed)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(session_id = %id, error = %e, "write failed");
                break;
            }
            Err(_) => {
                warn!(session_id = %id, timeout = ?send_timeout, "write timed out");
                break;
            }
        }
    }
    session.close();
    let _ = tokio::time::timeout(send_timeout, writer.close()).await;
}
