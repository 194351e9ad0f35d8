//! # Network Server
//!
//! Accepts connections, assigns client ids and keeps the table of active
//! connections.
//!
//! ```text
//! Stopped ─start()─▶ Starting ─▶ Running ─stop()─▶ Stopping ─▶ Stopped
//!                       └─bind failed, retry─▶ Restarting ─▶ Starting
//! ```
//!
//! Each accepted socket goes through its own admission task: TLS handshake,
//! the cancellable `IncomingConnection` event, id assignment, registration,
//! then the `ClientIdPacket` is sent. Ids come from a counter starting at 1
//! and are never reused, not even across restarts.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::core::packet::{Packet, Side};
use crate::error::{ProtocolError, Result};
use crate::protocol::event::{emit, DisconnectCause, Event, EventSink, NetworkEvent, NoopSink};
use crate::protocol::registry::PacketRegistry;
use crate::protocol::system::ClientIdPacket;
use crate::service::connection::{Connection, ConnectionOwner, ConnectionParams};
use crate::transport::tls::{server_handshake, TlsServerConfig};
use crate::transport::BoxedStream;
use crate::utils::metrics::global_metrics;
use crate::utils::retry::RetryPolicy;
use crate::utils::timeout::{self, ACCEPT_ERROR_PAUSE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Stopped,
    Starting,
    Restarting,
    Running,
    Stopping,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServerState::Starting,
            2 => ServerState::Restarting,
            3 => ServerState::Running,
            4 => ServerState::Stopping,
            _ => ServerState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ServerState::Stopped => 0,
            ServerState::Starting => 1,
            ServerState::Restarting => 2,
            ServerState::Running => 3,
            ServerState::Stopping => 4,
        }
    }
}

struct Listening {
    local_addr: SocketAddr,
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Inbound side of the link. Cheap to clone; clones share one listener.
///
/// Call [`stop`](Self::stop) before dropping the last handle; the accept
/// task keeps the server alive until then.
#[derive(Clone)]
pub struct NetworkServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    bind_address: String,
    registry: Arc<PacketRegistry>,
    sink: Arc<dyn EventSink>,
    read_timeout: Duration,
    handshake_timeout: Duration,
    nodelay: bool,
    policy: RetryPolicy,
    acceptor: Option<TlsAcceptor>,
    connections: RwLock<BTreeMap<i32, Arc<Connection>>>,
    next_client_id: AtomicI32,
    state: AtomicU8,
    listening: Mutex<Option<Listening>>,
    // token of a start() still binding, so stop() can interrupt it
    pending_start: Mutex<Option<CancellationToken>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for NetworkServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkServer")
            .field("bind_address", &self.inner.bind_address)
            .field("local_addr", &self.local_addr())
            .field("state", &self.state())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl NetworkServer {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Bind and start accepting. Returns `Ok(false)` if already running.
    ///
    /// A [`stop`](Self::stop) issued while bind retries are pending ends
    /// them with [`ProtocolError::ConnectionClosed`].
    #[instrument(skip(self), fields(address = %self.inner.bind_address))]
    pub async fn start(&self) -> Result<bool> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.is_running() {
            return Ok(false);
        }

        let token = CancellationToken::new();
        self.inner.set_pending_start(Some(token.clone()));
        self.inner.set_state(ServerState::Starting);
        let bound = self.inner.bind(&token).await;
        self.inner.set_pending_start(None);

        let listener = match bound {
            Ok(_) if token.is_cancelled() => {
                debug!("Start interrupted by stop");
                self.inner.set_state(ServerState::Stopped);
                return Err(ProtocolError::ConnectionClosed);
            }
            Ok(listener) => listener,
            Err(err) => {
                error!(error = %err, "Server failed to start");
                self.inner.set_state(ServerState::Stopped);
                return Err(err);
            }
        };
        let local_addr = listener.local_addr()?;

        let task = tokio::spawn(Arc::clone(&self.inner).accept_loop(listener, token.clone()));
        if let Ok(mut slot) = self.inner.listening.lock() {
            *slot = Some(Listening {
                local_addr,
                token,
                task,
            });
        }

        self.inner.set_state(ServerState::Running);
        info!(%local_addr, tls = self.inner.acceptor.is_some(), "Server started");
        emit(self.inner.sink.as_ref(), NetworkEvent::Started { local_addr });
        Ok(true)
    }

    /// Stop accepting and disconnect every client with a graceful notice.
    /// Also interrupts a [`start`](Self::start) that is still retrying its
    /// bind. Returns `false` if the server was neither running nor starting.
    #[instrument(skip(self), fields(address = %self.inner.bind_address))]
    pub async fn stop(&self) -> bool {
        let interrupted = self.inner.cancel_pending_start();
        let _guard = self.inner.lifecycle.lock().await;
        let listening = match self.inner.listening.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(listening) = listening else {
            return interrupted;
        };

        self.inner.set_state(ServerState::Stopping);
        listening.token.cancel();
        // the listener is dropped when the accept task returns
        if let Err(err) = listening.task.await {
            warn!(error = %err, "Accept task ended abnormally");
        }

        let drained: Vec<Arc<Connection>> = match self.inner.connections.write() {
            Ok(mut table) => std::mem::take(&mut *table).into_values().collect(),
            Err(_) => Vec::new(),
        };
        let closed = drained.len();
        join_all(
            drained
                .iter()
                .map(|connection| connection.close_with(true, DisconnectCause::ServerStopped)),
        )
        .await;

        self.inner.set_state(ServerState::Stopped);
        info!(local_addr = %listening.local_addr, closed, "Server stopped");
        emit(
            self.inner.sink.as_ref(),
            NetworkEvent::Stopped {
                local_addr: listening.local_addr,
            },
        );
        true
    }

    /// [`stop`](Self::stop) followed by [`start`](Self::start).
    pub async fn restart(&self) -> Result<bool> {
        self.stop().await;
        self.start().await
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .listening
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    pub fn state(&self) -> ServerState {
        self.inner.state()
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .listening
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|l| l.local_addr))
    }

    /// Send to one client. `false` if the id is unknown or the send failed.
    pub async fn send_packet<P: Packet>(&self, client_id: i32, packet: P) -> bool {
        match self.connection(client_id) {
            Some(connection) => connection.send_packet(packet).await,
            None => false,
        }
    }

    /// Send to every client connected when the call starts. Returns the
    /// number of successful sends.
    pub async fn broadcast_packet<P: Packet>(&self, packet: P) -> usize {
        let packet: Arc<dyn Packet> = Arc::new(packet);
        let mut delivered = 0;
        for connection in self.connections() {
            if connection.send_shared(Arc::clone(&packet)).await {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn connection(&self, client_id: i32) -> Option<Arc<Connection>> {
        self.inner
            .connections
            .read()
            .ok()
            .and_then(|table| table.get(&client_id).cloned())
    }

    /// Snapshot of the active connections, ordered by client id.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner
            .connections
            .read()
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.inner.registry
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.policy
    }
}

impl ServerInner {
    fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ServerState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn set_pending_start(&self, token: Option<CancellationToken>) {
        if let Ok(mut slot) = self.pending_start.lock() {
            *slot = token;
        }
    }

    fn cancel_pending_start(&self) -> bool {
        let pending = match self.pending_start.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        match pending {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Next client id, or `None` once the positive range is used up.
    fn allocate_client_id(&self) -> Option<i32> {
        self.next_client_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| id.checked_add(1))
            .ok()
    }

    async fn bind(&self, token: &CancellationToken) -> Result<TcpListener> {
        let mut retries: u32 = 0;
        loop {
            let err = match TcpListener::bind(&self.bind_address).await {
                Ok(listener) => return Ok(listener),
                Err(err) => err,
            };
            global_metrics().connection_error();

            if !self.policy.should_retry(retries) {
                return Err(ProtocolError::BindFailure {
                    address: self.bind_address.clone(),
                    attempts: retries + 1,
                    source: err,
                });
            }

            retries += 1;
            self.set_state(ServerState::Restarting);
            warn!(attempt = retries, delay_ms = self.policy.delay().as_millis() as u64, error = %err, "Bind failed, retrying");
            global_metrics().restart_attempt();
            emit(
                self.sink.as_ref(),
                NetworkEvent::RestartScheduled {
                    attempt: retries,
                    delay: self.policy.delay(),
                    error: err.to_string(),
                },
            );
            tokio::select! {
                _ = token.cancelled() => return Err(ProtocolError::ConnectionClosed),
                _ = tokio::time::sleep(self.policy.delay()) => {}
            }
            self.set_state(ServerState::Starting);
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, token: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer)) => {
                    if let Err(err) = socket.set_nodelay(self.nodelay) {
                        debug!(%peer, error = %err, "Failed to set TCP_NODELAY");
                    }
                    tokio::spawn(Arc::clone(&self).admit(socket, peer, token.clone()));
                }
                Err(err) => {
                    global_metrics().connection_error();
                    warn!(error = %err, "Accept failed");
                    emit(
                        self.sink.as_ref(),
                        NetworkEvent::AcceptFailed {
                            error: err.to_string(),
                        },
                    );
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_PAUSE) => {}
                    }
                }
            }
        }
        debug!("Accept loop finished");
    }

    async fn admit(self: Arc<Self>, socket: TcpStream, peer: SocketAddr, token: CancellationToken) {
        let stream: BoxedStream = match &self.acceptor {
            Some(acceptor) => match server_handshake(acceptor, socket, self.handshake_timeout).await {
                Ok(tls) => Box::new(tls),
                Err(err) => {
                    global_metrics().handshake_failed();
                    warn!(%peer, error = %err, "TLS handshake failed");
                    emit(
                        self.sink.as_ref(),
                        NetworkEvent::HandshakeFailed {
                            side: Side::Server,
                            peer,
                            error: err.to_string(),
                        },
                    );
                    return;
                }
            },
            None => Box::new(socket),
        };

        if token.is_cancelled() {
            return;
        }

        let mut incoming = Event::new(NetworkEvent::IncomingConnection { peer });
        self.sink.emit(&mut incoming);
        if incoming.is_cancelled() {
            debug!(%peer, "Incoming connection rejected by handler");
            return;
        }

        let Some(client_id) = self.allocate_client_id() else {
            warn!(%peer, "Client ids exhausted, refusing connection");
            emit(
                self.sink.as_ref(),
                NetworkEvent::AcceptFailed {
                    error: "client ids exhausted".into(),
                },
            );
            return;
        };
        let weak: Weak<ServerInner> = Arc::downgrade(&self);
        let connection = Connection::open(
            stream,
            ConnectionParams {
                side: Side::Server,
                client_id,
                peer_addr: peer,
                registry: Arc::clone(&self.registry),
                sink: Arc::clone(&self.sink),
                owner: weak,
                read_timeout: self.read_timeout,
            },
        );

        if let Ok(mut table) = self.connections.write() {
            table.insert(client_id, Arc::clone(&connection));
        }
        // stop() may have drained the table just before the insert
        if token.is_cancelled() {
            connection
                .close_with(true, DisconnectCause::ServerStopped)
                .await;
            return;
        }

        connection.start_receiving();
        if !connection.send_packet(ClientIdPacket::new(client_id)).await {
            warn!(client_id, %peer, "Failed to send client id");
        }

        info!(client_id, %peer, "Client connected");
        emit(
            self.sink.as_ref(),
            NetworkEvent::Connected {
                side: Side::Server,
                client_id,
                peer,
            },
        );
    }
}

impl ConnectionOwner for ServerInner {
    fn on_closed(&self, connection: &Arc<Connection>, _cause: DisconnectCause) {
        if let Ok(mut table) = self.connections.write() {
            let id = connection.client_id();
            if table.get(&id).is_some_and(|c| Arc::ptr_eq(c, connection)) {
                table.remove(&id);
            }
        }
    }
}

/// Builder for [`NetworkServer`].
pub struct ServerBuilder {
    address: String,
    port: u16,
    registry: Option<Arc<PacketRegistry>>,
    sink: Option<Arc<dyn EventSink>>,
    read_timeout: Duration,
    handshake_timeout: Duration,
    nodelay: bool,
    max_restart_attempts: i32,
    restart_delay: Duration,
    tls_config: Option<TlsServerConfig>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::from_config(&ServerConfig::default())
    }

    /// Builder preloaded from a [`ServerConfig`], TLS settings included.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            address: config.address.clone(),
            port: config.port,
            registry: None,
            sink: None,
            read_timeout: config.read_timeout,
            handshake_timeout: config.handshake_timeout,
            nodelay: config.nodelay,
            max_restart_attempts: config.max_restart_attempts,
            restart_delay: config.restart_delay,
            tls_config: config.tls.as_ref().map(TlsServerConfig::from),
            tls_acceptor: None,
        }
    }

    /// Interface to bind, e.g. `"127.0.0.1"`.
    pub fn address<S: Into<String>>(mut self, address: S) -> Self {
        self.address = address.into();
        self
    }

    /// `0` binds an ephemeral port; see [`NetworkServer::local_addr`].
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn registry(mut self, registry: Arc<PacketRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// `0` disables bind retries, `-1` retries forever, `N` retries `N` times.
    pub fn max_restart_attempts(mut self, attempts: i32) -> Self {
        self.max_restart_attempts = attempts;
        self
    }

    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// TLS material, provisioned when [`build`](Self::build) runs.
    pub fn tls(mut self, config: TlsServerConfig) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Use an already built acceptor.
    pub fn tls_acceptor(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn build(self) -> Result<NetworkServer> {
        if self.address.is_empty() {
            return Err(ProtocolError::ConfigError("Server address cannot be empty".into()));
        }
        if self.max_restart_attempts < -1 {
            return Err(ProtocolError::ConfigError(format!(
                "Invalid max_restart_attempts: {}",
                self.max_restart_attempts
            )));
        }

        let acceptor = match (self.tls_acceptor, self.tls_config) {
            (Some(acceptor), _) => Some(acceptor),
            (None, Some(config)) => Some(config.acceptor()?),
            (None, None) => None,
        };

        Ok(NetworkServer {
            inner: Arc::new(ServerInner {
                bind_address: format!("{}:{}", self.address, self.port),
                registry: self.registry.unwrap_or_else(|| Arc::new(PacketRegistry::new())),
                sink: self.sink.unwrap_or_else(|| Arc::new(NoopSink)),
                read_timeout: self.read_timeout,
                handshake_timeout: if self.handshake_timeout.is_zero() {
                    timeout::HANDSHAKE_TIMEOUT
                } else {
                    self.handshake_timeout
                },
                nodelay: self.nodelay,
                policy: RetryPolicy::new(self.max_restart_attempts, self.restart_delay),
                acceptor,
                connections: RwLock::new(BTreeMap::new()),
                next_client_id: AtomicI32::new(1),
                state: AtomicU8::new(ServerState::Stopped.as_u8()),
                listening: Mutex::new(None),
                pending_start: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        })
    }
}
