//! Server side: accepts clients and tracks their connections.
//!
//! [`ConnectionRegistry`] listens on a port, wraps every accepted stream in a
//! [`Connection`], and re-raises each connection's events as
//! [`RegistryEvent`]s tagged with the connection they came from. The set of
//! live connections is the only state shared between the accept task and the
//! connections' own tasks; it sits behind a single mutex that is never held
//! while connections are closed or handlers run.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::codec::MessageCodec;
use crate::connection::{
    Connection, ConnectionError, ConnectionEvent, ConnectionId, ConnectionOptions, IdGenerator,
};
use crate::events::{ObserverList, SubscriptionId, lock};
use crate::framing::encode_frame;
use crate::platform::{any_address, create_listener};

/// Configuration for [`ConnectionRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum concurrent connections. Default: 256.
    pub max_connections: usize,
    /// Listen on `[::]` (IPv4 and IPv6) instead of `0.0.0.0`. Default: false.
    pub dual_stack: bool,
    /// Options applied to every accepted connection.
    pub connection: ConnectionOptions,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 256,
            dual_stack: false,
            connection: ConnectionOptions::default(),
        }
    }
}

/// Notification raised by a [`ConnectionRegistry`].
pub enum RegistryEvent<C: MessageCodec> {
    /// A client was accepted and registered.
    ClientConnected(Connection<C>),
    /// A registered client sent a message.
    ClientDataReceived(Connection<C>, C::Message),
    /// A registered client disconnected and was removed.
    ClientDisconnected(Connection<C>),
}

impl<C: MessageCodec> RegistryEvent<C> {
    /// The connection this event concerns.
    pub fn connection(&self) -> &Connection<C> {
        match self {
            RegistryEvent::ClientConnected(connection)
            | RegistryEvent::ClientDataReceived(connection, _)
            | RegistryEvent::ClientDisconnected(connection) => connection,
        }
    }
}

impl<C: MessageCodec> Clone for RegistryEvent<C> {
    fn clone(&self) -> Self {
        match self {
            RegistryEvent::ClientConnected(c) => RegistryEvent::ClientConnected(c.clone()),
            RegistryEvent::ClientDataReceived(c, m) => {
                RegistryEvent::ClientDataReceived(c.clone(), m.clone())
            }
            RegistryEvent::ClientDisconnected(c) => RegistryEvent::ClientDisconnected(c.clone()),
        }
    }
}

impl<C: MessageCodec> std::fmt::Debug for RegistryEvent<C>
where
    C::Message: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryEvent::ClientConnected(c) => f.debug_tuple("ClientConnected").field(&c.id()).finish(),
            RegistryEvent::ClientDataReceived(c, m) => f
                .debug_tuple("ClientDataReceived")
                .field(&c.id())
                .field(m)
                .finish(),
            RegistryEvent::ClientDisconnected(c) => {
                f.debug_tuple("ClientDisconnected").field(&c.id()).finish()
            }
        }
    }
}

/// Errors returned by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// `start` was called while already listening.
    #[error("registry is already listening on port {0}")]
    AlreadyRunning(u16),

    /// The registry was shut down and cannot be restarted.
    #[error("registry has been shut down")]
    ShutDown,

    /// The listen port could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was bound.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// No registered connection has this id.
    #[error("no connection {0}")]
    UnknownConnection(ConnectionId),

    /// The message could not be prepared for sending.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Outcome of [`ConnectionRegistry::broadcast`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the message was queued on.
    pub delivered: usize,
    /// Connections that could no longer send; the rest were unaffected.
    pub failed: Vec<ConnectionId>,
}

struct Inner<C: MessageCodec> {
    codec: Arc<C>,
    config: RegistryConfig,
    connections: Mutex<HashMap<ConnectionId, Connection<C>>>,
    observers: ObserverList<RegistryEvent<C>>,
    id_gen: IdGenerator,
    running: AtomicBool,
    shut_down: AtomicBool,
    listen_port: AtomicU16,
    shutdown_tx: watch::Sender<bool>,
}

/// Multi-client TCP server. Cloning yields another handle to the same registry.
pub struct ConnectionRegistry<C: MessageCodec> {
    inner: Arc<Inner<C>>,
}

impl<C: MessageCodec> Clone for ConnectionRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: MessageCodec> ConnectionRegistry<C> {
    /// Create a stopped registry.
    pub fn new(codec: Arc<C>, config: RegistryConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                codec,
                config,
                connections: Mutex::new(HashMap::new()),
                observers: ObserverList::new(),
                id_gen: IdGenerator::new(),
                running: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                listen_port: AtomicU16::new(0),
                shutdown_tx,
            }),
        }
    }

    /// Bind `listen_port` on all interfaces and start accepting clients.
    ///
    /// Port 0 binds an ephemeral port; [`ConnectionRegistry::listen_port`]
    /// reports the real one. Bind failures are returned, never swallowed.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, listen_port: u16) -> Result<(), RegistryError> {
        self.check_startable()?;
        let addr = any_address(listen_port, self.inner.config.dual_stack);
        let listener = create_listener(addr, &self.inner.config.connection.socket)
            .map_err(|source| RegistryError::Bind { addr, source })?;
        self.start_with_listener(listener)
    }

    /// Start accepting on a pre-bound listener (useful for tests).
    pub fn start_with_listener(&self, listener: TcpListener) -> Result<(), RegistryError> {
        self.check_startable()?;
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RegistryError::AlreadyRunning(self.listen_port()));
        }
        self.inner.listen_port.store(port, Ordering::SeqCst);
        tracing::info!("Registry listening on port {port}");

        tokio::spawn(Self::accept_loop(
            Arc::downgrade(&self.inner),
            listener,
            self.inner.shutdown_tx.subscribe(),
        ));
        Ok(())
    }

    fn check_startable(&self) -> Result<(), RegistryError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(RegistryError::ShutDown);
        }
        if self.inner.running.load(Ordering::SeqCst) {
            return Err(RegistryError::AlreadyRunning(self.listen_port()));
        }
        Ok(())
    }

    /// Whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Port the registry listens on, 0 before `start`.
    pub fn listen_port(&self) -> u16 {
        self.inner.listen_port.load(Ordering::SeqCst)
    }

    /// Number of registered connections right now.
    pub fn number_of_connected_clients(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    /// Look up a registered connection.
    pub fn connection(&self, id: ConnectionId) -> Option<Connection<C>> {
        lock(&self.inner.connections).get(&id).cloned()
    }

    /// Snapshot of all registered connections.
    pub fn connections(&self) -> Vec<Connection<C>> {
        lock(&self.inner.connections).values().cloned().collect()
    }

    /// Register an event handler. Data and disconnect events run on the
    /// originating connection's read task.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&RegistryEvent<C>) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(handler)
    }

    /// Remove an event handler.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.observers.unsubscribe(id)
    }

    /// Receive every registry event through a channel.
    pub fn event_channel(&self) -> mpsc::UnboundedReceiver<RegistryEvent<C>> {
        self.inner.observers.channel().1
    }

    /// Send `message` to one registered connection.
    pub fn send_to(&self, id: ConnectionId, message: &C::Message) -> Result<(), RegistryError> {
        let connection = self
            .connection(id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        connection.send(message)?;
        Ok(())
    }

    /// Send `message` to every registered connection.
    ///
    /// The message is encoded once. A connection that can no longer send is
    /// listed in the report and does not stop delivery to the others.
    pub fn broadcast(&self, message: &C::Message) -> Result<BroadcastReport, RegistryError> {
        let payload = self
            .inner
            .codec
            .encode(message)
            .map_err(ConnectionError::from)?;
        let frame = encode_frame(&payload).map_err(ConnectionError::from)?;

        let mut report = BroadcastReport::default();
        for connection in self.connections() {
            if connection.send_frame(frame.clone()) {
                report.delivered += 1;
            } else {
                tracing::warn!("Broadcast skipped connection {}", connection.id());
                report.failed.push(connection.id());
            }
        }
        tracing::debug!(
            "Broadcast {} bytes to {} clients ({} failed)",
            frame.len(),
            report.delivered,
            report.failed.len()
        );
        Ok(report)
    }

    /// Stop accepting and close every connection.
    ///
    /// Idempotent. The connection set is copied under the lock and the copies
    /// are closed after releasing it, because each close re-enters the
    /// registry to remove itself.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown_tx.send_replace(true);
        self.inner.running.store(false, Ordering::SeqCst);

        let closing = self.connections();
        tracing::info!("Registry shutting down, closing {} connections", closing.len());
        for connection in closing {
            connection.disconnect();
        }
    }

    async fn accept_loop(
        inner: Weak<Inner<C>>,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                result = listener.accept() => {
                    let Some(inner) = inner.upgrade() else { break };
                    match result {
                        Ok((stream, peer_addr)) => Self::register(&inner, stream, peer_addr),
                        Err(e) => {
                            tracing::warn!("Accept failed: {e}");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(inner) = inner.upgrade() {
            inner.running.store(false, Ordering::SeqCst);
        }
        tracing::info!("Registry stopped accepting");
    }

    fn register(inner: &Arc<Inner<C>>, stream: TcpStream, peer_addr: SocketAddr) {
        let id = inner.id_gen.next_id();
        let connection = Connection::with_options(
            Arc::clone(&inner.codec),
            id,
            inner.config.connection.clone(),
        );

        {
            let mut connections = lock(&inner.connections);
            if inner.shut_down.load(Ordering::SeqCst) {
                return;
            }
            if connections.len() >= inner.config.max_connections {
                tracing::warn!(
                    "Connection limit {} reached, rejecting {peer_addr}",
                    inner.config.max_connections
                );
                return;
            }
            connections.insert(id, connection.clone());
        }

        let registry = Arc::downgrade(inner);
        let source = connection.downgrade();
        connection.subscribe(move |event| {
            let (Some(registry), Some(connection)) = (registry.upgrade(), source.upgrade()) else {
                return;
            };
            match event {
                ConnectionEvent::Connected => registry
                    .observers
                    .emit(&RegistryEvent::ClientConnected(connection)),
                ConnectionEvent::DataReceived(message) => registry
                    .observers
                    .emit(&RegistryEvent::ClientDataReceived(connection, message.clone())),
                ConnectionEvent::Disconnected => Self::unregister(&registry, connection),
            }
        });

        tracing::info!("Accepted connection {id} from {peer_addr}");
        if let Err(e) = connection.accept(stream) {
            // Closed by a concurrent shutdown before it started; nothing was announced.
            tracing::debug!("Connection {id} closed before it started: {e}");
            lock(&inner.connections).remove(&id);
        }
    }

    /// Remove a connection and announce it. Only the call that actually
    /// removes the entry raises the event.
    fn unregister(inner: &Inner<C>, connection: Connection<C>) {
        let removed = lock(&inner.connections).remove(&connection.id()).is_some();
        if removed {
            tracing::info!("Connection {} removed from registry", connection.id());
            inner
                .observers
                .emit(&RegistryEvent::ClientDisconnected(connection));
        }
    }
}
