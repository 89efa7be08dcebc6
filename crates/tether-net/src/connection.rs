//! A single bidirectional message channel over TCP.
//!
//! A [`Connection`] is created disconnected, then either connects out with
//! [`Connection::connect`] or is handed an accepted stream by the
//! [`crate::ConnectionRegistry`]. Once live it owns two background tasks:
//!
//! - the **read task** feeds socket bytes into a [`MessageReassembler`],
//!   decodes every completed frame and raises [`ConnectionEvent::DataReceived`]
//!   on that same task;
//! - the **write task** drains an unbounded queue of encoded frames, so
//!   [`Connection::send`] never blocks and can be called from event handlers.
//!
//! Whatever ends the connection (peer close, I/O error, framing error, or
//! [`Connection::disconnect`]) goes through one close path that raises
//! [`ConnectionEvent::Disconnected`] exactly once. A closed connection is
//! terminal; create a new one to reconnect.
//!
//! Events are raised under a per-connection delivery lock, and closing takes
//! the same lock. Once `disconnect` returns, no handler of that connection is
//! running and none will run again. Handlers may call back into their own
//! connection, but a handler must not wait on another connection whose
//! handler waits on this one.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};

use crate::codec::{CodecError, MessageCodec};
use crate::events::{ObserverList, SubscriptionId, lock};
use crate::framing::{FrameError, encode_frame};
use crate::platform::{SocketConfig, configure_stream};
use crate::reassembly::MessageReassembler;

/// Identifier of a connection. Registries hand out unique ids; outgoing
/// client connections use [`ConnectionId::CLIENT`] unless given one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Default id of outgoing connections.
    pub const CLIENT: ConnectionId = ConnectionId(0);
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected: before `connect`, after a failed connect, or after close.
    Disconnected,
    /// TCP handshake in progress.
    Connecting,
    /// Transport established; messages flow.
    Connected,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    /// Set the current state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_replace(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }
}

/// Notification raised by a [`Connection`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent<M> {
    /// The transport is established.
    Connected,
    /// A complete frame arrived and decoded into a message.
    DataReceived(M),
    /// The connection closed. Raised once per connection that was connected.
    Disconnected,
}

/// Errors returned by connection operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// `connect` was already called on this instance.
    #[error("connection instance was already used; create a new one to reconnect")]
    AlreadyUsed,

    /// The connection has been closed.
    #[error("connection is closed")]
    Closed,

    /// The TCP connect failed.
    #[error("failed to connect to {target}: {source}")]
    Connect {
        /// `address:port` that was dialed.
        target: String,
        /// Underlying transport error.
        #[source]
        source: std::io::Error,
    },

    /// The message could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The encoded message could not be framed.
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
}

/// Tunables for a connection's transport.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Socket options applied once the stream exists.
    pub socket: SocketConfig,
    /// Size of the buffer each socket read fills. Default: 4096.
    pub read_buffer_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            socket: SocketConfig::default(),
            read_buffer_size: 4096,
        }
    }
}

struct Shared<C: MessageCodec> {
    id: ConnectionId,
    codec: Arc<C>,
    options: ConnectionOptions,
    state: ConnectionStateWatch,
    used: AtomicBool,
    closed: AtomicBool,
    was_connected: AtomicBool,
    disconnect_raised: AtomicBool,
    target: Mutex<Option<String>>,
    peer: Mutex<Option<SocketAddr>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    observers: ObserverList<ConnectionEvent<C::Message>>,
    delivery: Mutex<()>,
    delivery_owner: Mutex<Option<ThreadId>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Clears the delivery owner when the holder finishes, even by unwinding.
struct OwnerReset<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for OwnerReset<'_> {
    fn drop(&mut self) {
        *lock(self.0) = None;
    }
}

impl<C: MessageCodec> Shared<C> {
    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.state.current() == ConnectionState::Connected
    }

    /// Run `f` holding the delivery lock. Re-entrant on the thread that
    /// already holds it, so handlers can close their own connection.
    fn serialized<R>(&self, f: impl FnOnce() -> R) -> R {
        let me = thread::current().id();
        if *lock(&self.delivery_owner) == Some(me) {
            return f();
        }
        let _delivery = lock(&self.delivery);
        *lock(&self.delivery_owner) = Some(me);
        let _reset = OwnerReset(&self.delivery_owner);
        f()
    }

    fn deliver(&self, payload: &[u8]) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let message = match self.codec.decode(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    "Connection {} dropped an undecodable {}-byte frame: {e}",
                    self.id,
                    payload.len()
                );
                return;
            }
        };
        self.serialized(|| {
            if !self.closed.load(Ordering::SeqCst) {
                self.observers.emit(&ConnectionEvent::DataReceived(message));
            }
        });
    }

    /// The single close path. Idempotent.
    fn close(&self) {
        self.serialized(|| {
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            self.shutdown_tx.send_replace(true);
            lock(&self.outbound).take();
            self.state.set(ConnectionState::Disconnected);

            if self.was_connected.load(Ordering::SeqCst)
                && !self.disconnect_raised.swap(true, Ordering::SeqCst)
            {
                tracing::info!("Connection {} disconnected", self.id);
                self.observers.emit(&ConnectionEvent::Disconnected);
            }
            self.observers.clear();
        });
    }
}

/// Handle to a message channel. Cloning yields another handle to the same
/// connection.
pub struct Connection<C: MessageCodec> {
    shared: Arc<Shared<C>>,
}

impl<C: MessageCodec> Clone for Connection<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: MessageCodec> std::fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state.current())
            .field("target", &self.target_address())
            .finish()
    }
}

/// Non-owning handle, used by event handlers that refer back to their
/// connection without keeping it alive.
pub struct WeakConnection<C: MessageCodec> {
    shared: Weak<Shared<C>>,
}

impl<C: MessageCodec> WeakConnection<C> {
    /// Get a strong handle if the connection still exists.
    pub fn upgrade(&self) -> Option<Connection<C>> {
        self.shared.upgrade().map(|shared| Connection { shared })
    }
}

impl<C: MessageCodec> Clone for WeakConnection<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<C: MessageCodec> Connection<C> {
    /// Create a disconnected client connection with default options.
    pub fn new(codec: Arc<C>) -> Self {
        Self::with_options(codec, ConnectionId::CLIENT, ConnectionOptions::default())
    }

    /// Create a disconnected connection with an explicit id and options.
    pub fn with_options(codec: Arc<C>, id: ConnectionId, options: ConnectionOptions) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                id,
                codec,
                options,
                state: ConnectionStateWatch::new(),
                used: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                was_connected: AtomicBool::new(false),
                disconnect_raised: AtomicBool::new(false),
                target: Mutex::new(None),
                peer: Mutex::new(None),
                outbound: Mutex::new(None),
                observers: ObserverList::new(),
                delivery: Mutex::new(()),
                delivery_owner: Mutex::new(None),
                shutdown_tx,
            }),
        }
    }

    /// Connect to `address:port`.
    ///
    /// Waits for the TCP handshake. On success the state becomes
    /// [`ConnectionState::Connected`] and [`ConnectionEvent::Connected`] is
    /// raised before this returns. On failure no event is raised and the
    /// connection stays disconnected.
    pub async fn connect(&self, address: &str, port: u16) -> Result<(), ConnectionError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        if self.shared.used.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::AlreadyUsed);
        }

        let target = format!("{address}:{port}");
        *lock(&self.shared.target) = Some(target.clone());
        self.shared.state.set(ConnectionState::Connecting);
        tracing::debug!("Connection {} connecting to {target}", self.shared.id);

        match TcpStream::connect((address, port)).await {
            Ok(stream) => self.start(stream),
            Err(source) => {
                self.shared.state.set(ConnectionState::Disconnected);
                tracing::warn!("Failed to connect to {target}: {source}");
                Err(ConnectionError::Connect { target, source })
            }
        }
    }

    /// Take over a stream accepted by a listener.
    pub(crate) fn accept(&self, stream: TcpStream) -> Result<(), ConnectionError> {
        if self.shared.used.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::AlreadyUsed);
        }
        if let Ok(peer) = stream.peer_addr() {
            *lock(&self.shared.target) = Some(peer.to_string());
        }
        self.start(stream)
    }

    fn start(&self, stream: TcpStream) -> Result<(), ConnectionError> {
        let shared = &self.shared;
        if let Err(e) = configure_stream(&stream, &shared.options.socket) {
            tracing::warn!("Connection {} socket options not applied: {e}", shared.id);
        }
        *lock(&shared.peer) = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();

        // A close racing with startup either wins (nothing is announced) or
        // waits until Connected has been raised.
        shared.serialized(|| {
            if shared.closed.load(Ordering::SeqCst) {
                shared.state.set(ConnectionState::Disconnected);
                return Err(ConnectionError::Closed);
            }

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            *lock(&shared.outbound) = Some(outbound_tx);
            shared.was_connected.store(true, Ordering::SeqCst);
            shared.state.set(ConnectionState::Connected);

            tokio::spawn(Self::write_loop(
                Arc::clone(shared),
                writer,
                outbound_rx,
                shared.shutdown_tx.subscribe(),
            ));

            tracing::info!(
                "Connection {} established with {}",
                shared.id,
                self.target_address().unwrap_or_default()
            );
            shared.observers.emit(&ConnectionEvent::Connected);
            Ok(())
        })?;

        tokio::spawn(Self::read_loop(
            Arc::clone(&self.shared),
            reader,
            self.shared.shutdown_tx.subscribe(),
        ));
        Ok(())
    }

    /// Encode `message` and queue it for sending.
    ///
    /// Sending on a connection that is not connected is a silent no-op.
    /// Only encoding failures are reported.
    pub fn send(&self, message: &C::Message) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            tracing::trace!("Connection {} not connected, dropping send", self.shared.id);
            return Ok(());
        }
        let payload = self.shared.codec.encode(message)?;
        let frame = encode_frame(&payload)?;
        self.send_frame(frame);
        Ok(())
    }

    /// Queue an already framed message. Returns `false` if the connection
    /// can no longer send.
    pub(crate) fn send_frame(&self, frame: Vec<u8>) -> bool {
        match lock(&self.shared.outbound).as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Close the connection.
    ///
    /// Idempotent. Raises [`ConnectionEvent::Disconnected`] if the connection
    /// was live, before returning. Waits for a handler that is running on the
    /// read task to finish; no event fires afterwards. Frames already
    /// queued by [`Connection::send`] are still flushed to the socket.
    pub fn disconnect(&self) {
        self.shared.close();
    }

    /// Register an event handler. It runs on the connection's read task for
    /// [`ConnectionEvent::DataReceived`], so it should not block.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ConnectionEvent<C::Message>) + Send + Sync + 'static,
    {
        self.shared.observers.subscribe(handler)
    }

    /// Remove an event handler.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.observers.unsubscribe(id)
    }

    /// Receive every event through a channel instead of a callback.
    pub fn event_channel(&self) -> mpsc::UnboundedReceiver<ConnectionEvent<C::Message>> {
        self.shared.observers.channel().1
    }

    /// Whether messages can currently be sent and received.
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Whether this connection has been closed for good.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// `address:port` that was dialed, or the peer address of an accepted
    /// connection.
    pub fn target_address(&self) -> Option<String> {
        lock(&self.shared.target).clone()
    }

    /// Resolved address of the remote peer once connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.peer)
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Observable lifecycle state.
    pub fn state(&self) -> &ConnectionStateWatch {
        &self.shared.state
    }

    /// Non-owning handle for use inside event handlers.
    pub fn downgrade(&self) -> WeakConnection<C> {
        WeakConnection {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Read bytes until the connection ends, emitting decoded messages.
    async fn read_loop(
        shared: Arc<Shared<C>>,
        mut reader: OwnedReadHalf,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut reassembler = MessageReassembler::new();
        let mut buf = vec![0u8; shared.options.read_buffer_size.max(1)];

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                result = reader.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("Connection {} closed by peer", shared.id);
                            break;
                        }
                        Err(e) => {
                            tracing::debug!("Connection {} read failed: {e}", shared.id);
                            break;
                        }
                        Ok(n) => {
                            tracing::trace!("Connection {} received {n} bytes", shared.id);
                            let fed = reassembler.feed_with(&buf[..n], |payload| {
                                shared.deliver(&payload);
                            });
                            if let Err(e) = fed {
                                tracing::warn!("Connection {} framing error, closing: {e}", shared.id);
                                break;
                            }
                        }
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        shared.close();
    }

    /// Write queued frames in order until the queue closes or shutdown is
    /// signalled, then flush what is left and shut the socket down.
    async fn write_loop(
        shared: Arc<Shared<C>>,
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut failed = false;
        loop {
            if *shutdown_rx.borrow_and_update() {
                while let Ok(frame) = outbound.try_recv() {
                    if writer.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = writer.write_all(&frame).await {
                        tracing::warn!("Connection {} write failed: {e}", shared.id);
                        failed = true;
                        break;
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        let _ = writer.shutdown().await;
        if failed {
            shared.close();
        }
    }
}
