//! # Network Client
//!
//! Dials a server, keeps at most one [`Connection`] and applies the
//! reconnect policy when the link drops.
//!
//! ```text
//! Idle ─connect()─▶ Connecting ─▶ Connected ─▶ Disconnected ─┬─▶ Reconnecting ─▶ Connecting
//!                       │                                    └─▶ Idle (policy off / close())
//!                       └─retry─▶ Reconnecting
//! ```
//!
//! ## Example
//! ```rust,no_run
//! use framelink::service::client::ClientBuilder;
//!
//! # async fn run() -> framelink::error::Result<()> {
//! let client = ClientBuilder::new("127.0.0.1", 3982)
//!     .max_reconnect_attempts(3)
//!     .build()?;
//! client.connect().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use rustls::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ClientConfig;
use crate::core::packet::{Packet, Side, UNASSIGNED_CLIENT_ID};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::event::{emit, DisconnectCause, EventSink, NetworkEvent, NoopSink};
use crate::protocol::registry::PacketRegistry;
use crate::service::connection::{Connection, ConnectionOwner, ConnectionParams};
use crate::transport::proxy::{connect_via_proxy, ProxyConfig};
use crate::transport::tls::{client_handshake, TlsClientConfig};
use crate::transport::BoxedStream;
use crate::utils::metrics::global_metrics;
use crate::utils::retry::RetryPolicy;
use crate::utils::timeout::{self, with_timeout_or};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ClientState::Connecting,
            2 => ClientState::Connected,
            3 => ClientState::Disconnected,
            4 => ClientState::Reconnecting,
            _ => ClientState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ClientState::Idle => 0,
            ClientState::Connecting => 1,
            ClientState::Connected => 2,
            ClientState::Disconnected => 3,
            ClientState::Reconnecting => 4,
        }
    }
}

/// Outbound side of the link. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct NetworkClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    host: String,
    port: u16,
    registry: Arc<PacketRegistry>,
    sink: Arc<dyn EventSink>,
    connect_timeout: Duration,
    read_timeout: Duration,
    handshake_timeout: Duration,
    nodelay: bool,
    policy: RetryPolicy,
    proxy: Option<ProxyConfig>,
    tls: Option<(TlsConnector, ServerName)>,
    connection: RwLock<Option<Arc<Connection>>>,
    state: AtomicU8,
    // set by close(), cleared by the next explicit connect()
    closed: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for NetworkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkClient")
            .field("address", &self.inner.address())
            .field("state", &self.state())
            .field("client_id", &self.client_id())
            .field("tls", &self.inner.tls.is_some())
            .finish()
    }
}

impl NetworkClient {
    pub fn builder<S: Into<String>>(host: S, port: u16) -> ClientBuilder {
        ClientBuilder::new(host, port)
    }

    /// Connect, retrying per the reconnect policy.
    ///
    /// Returns `Ok(false)` if already connected. Handshake and
    /// configuration errors are returned at once; other failures are
    /// retried and end in [`ProtocolError::ConnectFailure`].
    #[instrument(skip(self), fields(address = %self.inner.address()))]
    pub async fn connect(&self) -> Result<bool> {
        self.inner.closed.store(false, Ordering::SeqCst);
        self.inner.connect().await
    }

    /// Disconnect with a graceful notice. With auto-reconnect enabled a new
    /// connection is attempted in the background.
    pub async fn disconnect(&self) -> bool {
        match self.connection() {
            Some(connection) => connection.disconnect(true).await,
            None => false,
        }
    }

    /// Disconnect and stay disconnected until the next [`connect`](Self::connect).
    pub async fn close(&self) -> bool {
        self.inner.closed.store(true, Ordering::SeqCst);
        let disconnected = self.disconnect().await;
        self.inner.set_state(ClientState::Idle);
        disconnected
    }

    pub async fn send_packet<P: Packet>(&self, packet: P) -> bool {
        self.send_shared(Arc::new(packet)).await
    }

    pub async fn send_shared(&self, packet: Arc<dyn Packet>) -> bool {
        match self.connection() {
            Some(connection) => connection.send_shared(packet).await,
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Id assigned by the server, `-1` while unassigned or disconnected.
    pub fn client_id(&self) -> i32 {
        self.connection()
            .map(|c| c.client_id())
            .unwrap_or(UNASSIGNED_CLIENT_ID)
    }

    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.current()
    }

    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.inner.registry
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.policy
    }

    pub fn is_tls(&self) -> bool {
        self.inner.tls.is_some()
    }
}

impl ClientInner {
    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ClientState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn current(&self) -> Option<Arc<Connection>> {
        self.connection.read().ok().and_then(|slot| slot.clone())
    }

    fn is_connected(&self) -> bool {
        self.current().is_some_and(|c| c.is_connected())
    }

    async fn connect(self: &Arc<Self>) -> Result<bool> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(false);
        }

        let mut retries: u32 = 0;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                debug!("Client closed while connecting");
                self.set_state(ClientState::Idle);
                return Err(ProtocolError::ConnectionClosed);
            }

            self.set_state(ClientState::Connecting);
            let err = match self.try_connect().await {
                Ok(connection) => {
                    // close() may have run while the dial was in flight
                    if self.closed.load(Ordering::SeqCst) {
                        debug!("Client closed while connecting, dropping new connection");
                        connection.disconnect(true).await;
                        self.set_state(ClientState::Idle);
                        return Err(ProtocolError::ConnectionClosed);
                    }
                    return Ok(true);
                }
                Err(err) => err,
            };
            global_metrics().connection_error();

            let retryable = err.is_retryable();
            if retryable && self.policy.should_retry(retries) {
                retries += 1;
                self.set_state(ClientState::Reconnecting);
                warn!(attempt = retries, delay_ms = self.policy.delay().as_millis() as u64, error = %err, "Connect failed, retrying");
                global_metrics().reconnect_attempt();
                emit(
                    self.sink.as_ref(),
                    NetworkEvent::ReconnectScheduled {
                        attempt: retries,
                        delay: self.policy.delay(),
                        error: err.to_string(),
                    },
                );
                tokio::time::sleep(self.policy.delay()).await;
                continue;
            }

            let attempts = retries + 1;
            error!(attempts, error = %err, "Connect failed");
            self.set_state(ClientState::Idle);
            emit(
                self.sink.as_ref(),
                NetworkEvent::ConnectFailed {
                    address: self.address(),
                    attempts,
                    error: err.to_string(),
                },
            );

            return Err(if retryable {
                ProtocolError::ConnectFailure {
                    address: self.address(),
                    attempts,
                    reason: err.to_string(),
                }
            } else {
                err
            });
        }
    }

    async fn dial(&self) -> Result<TcpStream> {
        match &self.proxy {
            Some(proxy) => connect_via_proxy(proxy, &self.host, self.port).await,
            None => Ok(TcpStream::connect((self.host.as_str(), self.port)).await?),
        }
    }

    async fn try_connect(self: &Arc<Self>) -> Result<Arc<Connection>> {
        let socket = with_timeout_or(
            self.dial(),
            self.connect_timeout,
            ProtocolError::ConnectionTimeout,
        )
        .await?;
        socket.set_nodelay(self.nodelay)?;
        let peer = socket.peer_addr()?;

        let stream: BoxedStream = match &self.tls {
            Some((connector, server_name)) => {
                match client_handshake(connector, server_name.clone(), socket, self.handshake_timeout).await {
                    Ok(tls) => Box::new(tls),
                    Err(err) => {
                        global_metrics().handshake_failed();
                        warn!(%peer, error = %err, "TLS handshake failed");
                        emit(
                            self.sink.as_ref(),
                            NetworkEvent::HandshakeFailed {
                                side: Side::Client,
                                peer,
                                error: err.to_string(),
                            },
                        );
                        return Err(err);
                    }
                }
            }
            None => Box::new(socket),
        };

        let weak: Weak<ClientInner> = Arc::downgrade(self);
        let connection = Connection::open(
            stream,
            ConnectionParams {
                side: Side::Client,
                client_id: UNASSIGNED_CLIENT_ID,
                peer_addr: peer,
                registry: Arc::clone(&self.registry),
                sink: Arc::clone(&self.sink),
                owner: weak,
                read_timeout: self.read_timeout,
            },
        );

        if let Ok(mut slot) = self.connection.write() {
            *slot = Some(Arc::clone(&connection));
        }
        self.set_state(ClientState::Connected);
        info!(%peer, tls = self.tls.is_some(), "Connected");
        emit(
            self.sink.as_ref(),
            NetworkEvent::Connected {
                side: Side::Client,
                client_id: UNASSIGNED_CLIENT_ID,
                peer,
            },
        );

        connection.start_receiving();
        Ok(connection)
    }
}

impl ConnectionOwner for ClientInner {
    fn on_closed(&self, connection: &Arc<Connection>, _cause: DisconnectCause) {
        if let Ok(mut slot) = self.connection.write() {
            if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, connection)) {
                *slot = None;
            }
        }
        self.set_state(ClientState::Disconnected);
    }

    fn after_disconnected(self: Arc<Self>, cause: DisconnectCause) {
        if self.closed.load(Ordering::SeqCst) || !self.policy.is_enabled() {
            self.set_state(ClientState::Idle);
            return;
        }

        info!(%cause, "Connection lost, reconnecting");
        self.set_state(ClientState::Reconnecting);
        tokio::spawn(async move {
            if let Err(err) = self.connect().await {
                warn!(error = %err, "Reconnect gave up");
            }
        });
    }
}

/// Builder for [`NetworkClient`].
pub struct ClientBuilder {
    host: String,
    port: u16,
    registry: Option<Arc<PacketRegistry>>,
    sink: Option<Arc<dyn EventSink>>,
    connect_timeout: Duration,
    read_timeout: Duration,
    handshake_timeout: Duration,
    nodelay: bool,
    max_reconnect_attempts: i32,
    reconnect_delay: Duration,
    proxy: Option<ProxyConfig>,
    tls_config: Option<TlsClientConfig>,
    tls_connector: Option<(TlsConnector, String)>,
    require_tls: bool,
}

impl ClientBuilder {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        let defaults = ClientConfig::default();
        Self {
            host: host.into(),
            port,
            registry: None,
            sink: None,
            connect_timeout: defaults.connect_timeout,
            read_timeout: defaults.read_timeout,
            handshake_timeout: defaults.handshake_timeout,
            nodelay: defaults.nodelay,
            max_reconnect_attempts: defaults.max_reconnect_attempts,
            reconnect_delay: defaults.reconnect_delay,
            proxy: None,
            tls_config: None,
            tls_connector: None,
            require_tls: false,
        }
    }

    /// Builder preloaded from a [`ClientConfig`], TLS settings included.
    pub fn from_config(config: &ClientConfig) -> Self {
        let mut builder = Self::new(config.host.clone(), config.port)
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .handshake_timeout(config.handshake_timeout)
            .nodelay(config.nodelay)
            .max_reconnect_attempts(config.max_reconnect_attempts)
            .reconnect_delay(config.reconnect_delay)
            .require_tls(config.require_tls);
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(proxy.clone());
        }
        if let Some(tls) = &config.tls {
            builder = builder.tls(TlsClientConfig::from(tls));
        }
        builder
    }

    pub fn registry(mut self, registry: Arc<PacketRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Drop the connection after this long without a frame; zero disables.
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

    /// `0` disables reconnecting, `-1` retries forever, `N` retries `N` times.
    pub fn max_reconnect_attempts(mut self, attempts: i32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// TLS material, provisioned when [`build`](Self::build) runs.
    pub fn tls(mut self, config: TlsClientConfig) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Use an already built connector.
    pub fn tls_connector<S: Into<String>>(mut self, connector: TlsConnector, server_name: S) -> Self {
        self.tls_connector = Some((connector, server_name.into()));
        self
    }

    pub fn require_tls(mut self, required: bool) -> Self {
        self.require_tls = required;
        self
    }

    pub fn build(self) -> Result<NetworkClient> {
        if self.host.is_empty() {
            return Err(ProtocolError::ConfigError("Client host cannot be empty".into()));
        }
        if self.max_reconnect_attempts < -1 {
            return Err(ProtocolError::ConfigError(format!(
                "Invalid max_reconnect_attempts: {}",
                self.max_reconnect_attempts
            )));
        }

        let tls = match (self.tls_connector, self.tls_config) {
            (Some((connector, name)), _) => {
                let server_name = ServerName::try_from(name.as_str()).map_err(|e| {
                    ProtocolError::ProvisioningFailure(format!("{name}: {e}"))
                })?;
                Some((connector, server_name))
            }
            (None, Some(config)) => Some((config.connector()?, config.server_name()?)),
            (None, None) => None,
        };
        if self.require_tls && tls.is_none() {
            return Err(ProtocolError::ConfigError(constants::ERR_TLS_REQUIRED.into()));
        }

        Ok(NetworkClient {
            inner: Arc::new(ClientInner {
                host: self.host,
                port: self.port,
                registry: self.registry.unwrap_or_else(|| Arc::new(PacketRegistry::new())),
                sink: self.sink.unwrap_or_else(|| Arc::new(NoopSink)),
                connect_timeout: if self.connect_timeout.is_zero() {
                    timeout::CONNECT_TIMEOUT
                } else {
                    self.connect_timeout
                },
                read_timeout: self.read_timeout,
                handshake_timeout: if self.handshake_timeout.is_zero() {
                    timeout::HANDSHAKE_TIMEOUT
                } else {
                    self.handshake_timeout
                },
                nodelay: self.nodelay,
                policy: RetryPolicy::new(self.max_reconnect_attempts, self.reconnect_delay),
                proxy: self.proxy,
                tls,
                connection: RwLock::new(None),
                state: AtomicU8::new(ClientState::Idle.as_u8()),
                closed: AtomicBool::new(false),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }
}
