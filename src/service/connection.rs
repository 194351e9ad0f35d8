//! # Connection
//!
//! One socket, one receive task, one writer lock.
//!
//! A connection is created already connected and is never reused: once it
//! reaches [`ConnectionState::Closed`] the owner needs a new one.
//!
//! ```text
//! Connected ──disconnect()/peer gone──▶ Disconnecting ──▶ Closed
//! ```
//!
//! Frames are read by a dedicated task which emits one event per record in
//! arrival order. Sends from any task are serialized by an async mutex
//! around the framed write half, so frames never interleave.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::core::codec::{Frame, FrameCodec, TAG_PACKET};
use crate::core::packet::{Packet, PacketContext, Side, UNASSIGNED_CLIENT_ID};
use crate::error::{ProtocolError, Result};
use crate::protocol::event::{emit, DisconnectCause, EventSink, NetworkEvent};
use crate::protocol::registry::PacketRegistry;
use crate::protocol::system::DisconnectPacket;
use crate::transport::BoxedStream;
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::{with_optional_timeout, with_timeout_error, SHUTDOWN_TIMEOUT};

type Reader = FramedRead<ReadHalf<BoxedStream>, FrameCodec>;
type Writer = FramedWrite<WriteHalf<BoxedStream>, FrameCodec>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connected,
    Disconnecting,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connected,
            1 => ConnectionState::Disconnecting,
            _ => ConnectionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Connected => 0,
            ConnectionState::Disconnecting => 1,
            ConnectionState::Closed => 2,
        }
    }
}

/// The client or server a connection reports back to when it closes.
pub(crate) trait ConnectionOwner: Send + Sync {
    /// Called once, after the stream is shut down and before `Disconnected`
    /// is emitted.
    fn on_closed(&self, connection: &Arc<Connection>, cause: DisconnectCause);

    /// Called once, after `Disconnected` was emitted.
    fn after_disconnected(self: Arc<Self>, _cause: DisconnectCause) {}
}

pub(crate) struct ConnectionParams {
    pub side: Side,
    pub client_id: i32,
    pub peer_addr: SocketAddr,
    pub registry: Arc<PacketRegistry>,
    pub sink: Arc<dyn EventSink>,
    pub owner: Weak<dyn ConnectionOwner>,
    pub read_timeout: Duration,
}

pub struct Connection {
    side: Side,
    client_id: AtomicI32,
    peer_addr: SocketAddr,
    state: AtomicU8,
    registry: Arc<PacketRegistry>,
    sink: Arc<dyn EventSink>,
    owner: Weak<dyn ConnectionOwner>,
    read_timeout: Duration,
    writer: tokio::sync::Mutex<Option<Writer>>,
    reader: Mutex<Option<Reader>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    // set while decoding a disconnect notice, acted on after the frame
    pending_disconnect: Mutex<Option<DisconnectCause>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("client_id", &self.client_id())
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Wrap an established stream. The receive task is not running until
    /// [`start_receiving`](Self::start_receiving) is called, so the owner can
    /// register the connection first.
    pub(crate) fn open(stream: BoxedStream, params: ConnectionParams) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        global_metrics().connection_established();

        Arc::new(Self {
            side: params.side,
            client_id: AtomicI32::new(params.client_id),
            peer_addr: params.peer_addr,
            state: AtomicU8::new(ConnectionState::Connected.as_u8()),
            registry: params.registry,
            sink: params.sink,
            owner: params.owner,
            read_timeout: params.read_timeout,
            writer: tokio::sync::Mutex::new(Some(FramedWrite::new(write_half, FrameCodec::new()))),
            reader: Mutex::new(Some(FramedRead::new(read_half, FrameCodec::new()))),
            receive_task: Mutex::new(None),
            cancel: CancellationToken::new(),
            pending_disconnect: Mutex::new(None),
        })
    }

    pub(crate) fn start_receiving(self: &Arc<Self>) {
        let reader = match self.reader.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(reader) = reader else {
            return;
        };

        let task = tokio::spawn(Arc::clone(self).receive_loop(reader));
        if let Ok(mut slot) = self.receive_task.lock() {
            *slot = Some(task);
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Assigned client id, or `-1` on a client-side connection that has not
    /// received one yet.
    pub fn client_id(&self) -> i32 {
        self.client_id.load(Ordering::SeqCst)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// True while the connection is open, its token is live and its
    /// receive task is still running.
    pub fn is_connected(&self) -> bool {
        if self.state() != ConnectionState::Connected || self.cancel.is_cancelled() {
            return false;
        }
        match self.receive_task.lock() {
            Ok(task) => task.as_ref().map_or(true, |handle| !handle.is_finished()),
            Err(_) => false,
        }
    }

    /// Send one packet. Returns `false` without blocking when the connection
    /// is not open, or when encoding or writing fails.
    pub async fn send_packet<P: Packet>(&self, packet: P) -> bool {
        self.send_shared(Arc::new(packet)).await
    }

    /// Send a packet that may also be handed to other connections.
    pub async fn send_shared(&self, packet: Arc<dyn Packet>) -> bool {
        if !self.is_connected() {
            return false;
        }

        match self.write_packet(packet.as_ref()).await {
            Ok(bytes) => {
                global_metrics().packet_sent(bytes as u64);
                trace!(client_id = self.client_id(), packet_id = packet.id(), bytes, "Packet sent");
                emit(
                    self.sink.as_ref(),
                    NetworkEvent::PacketSent {
                        side: self.side,
                        client_id: self.client_id(),
                        packet,
                    },
                );
                true
            }
            Err(err) => {
                global_metrics().packet_failed();
                warn!(client_id = self.client_id(), packet_id = packet.id(), error = %err, "Packet send failed");
                emit(
                    self.sink.as_ref(),
                    NetworkEvent::PacketSendFailed {
                        side: self.side,
                        client_id: self.client_id(),
                        packet_id: packet.id(),
                        error: err.to_string(),
                    },
                );
                false
            }
        }
    }

    async fn write_packet(&self, packet: &dyn Packet) -> Result<usize> {
        let frame = self.registry.encode(packet)?;
        let bytes = frame.wire_len();

        // a send stalled on a peer that stopped reading gives way to teardown
        let mut slot = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ProtocolError::ConnectionClosed),
            slot = self.writer.lock() => slot,
        };
        let writer = slot.as_mut().ok_or(ProtocolError::NotConnected)?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ProtocolError::ConnectionClosed),
            sent = writer.send(frame) => sent.map_err(|err| match err {
                ProtocolError::Io(io) => ProtocolError::from_io(io),
                other => other,
            })?,
        }
        Ok(bytes)
    }

    /// Tear the connection down, optionally telling the peer first.
    ///
    /// Returns `false` if the connection was already closing.
    pub async fn disconnect(self: &Arc<Self>, notify_peer: bool) -> bool {
        self.close_with(notify_peer, DisconnectCause::Local).await
    }

    pub(crate) async fn close_with(self: &Arc<Self>, notify_peer: bool, cause: DisconnectCause) -> bool {
        let claimed = self.state.compare_exchange(
            ConnectionState::Connected.as_u8(),
            ConnectionState::Disconnecting.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if claimed.is_err() {
            return false;
        }

        // releases the writer lock held by any in-flight send
        self.cancel.cancel();

        let teardown = async {
            let mut slot = self.writer.lock().await;
            let Some(mut writer) = slot.take() else {
                return Ok(());
            };
            if notify_peer {
                self.send_notice(&mut writer).await;
            }
            // close() flushes, then shuts the write half down
            writer.close().await
        };
        if let Err(err) = with_timeout_error(teardown, SHUTDOWN_TIMEOUT).await {
            debug!(client_id = self.client_id(), error = %err, "Error closing stream");
        }

        self.state
            .store(ConnectionState::Closed.as_u8(), Ordering::SeqCst);
        global_metrics().connection_closed();
        info!(side = %self.side, client_id = self.client_id(), peer = %self.peer_addr, %cause, "Connection closed");

        let owner = self.owner.upgrade();
        if let Some(owner) = &owner {
            owner.on_closed(self, cause);
        }

        emit(
            self.sink.as_ref(),
            NetworkEvent::Disconnected {
                side: self.side,
                client_id: self.client_id(),
                peer: self.peer_addr,
                cause,
            },
        );

        if let Some(owner) = owner {
            owner.after_disconnected(cause);
        }
        true
    }

    async fn send_notice(&self, writer: &mut Writer) {
        let notice = DisconnectPacket::new(self.client_id(), self.side == Side::Client);
        let frame = match self.registry.encode(&notice) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "Failed to encode disconnect notice");
                return;
            }
        };
        if let Err(err) = writer.send(frame).await {
            debug!(client_id = self.client_id(), error = %err, "Failed to send disconnect notice");
        }
    }

    async fn receive_loop(self: Arc<Self>, mut reader: Reader) {
        let cause = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break None,
                next = with_optional_timeout(async { reader.next().await.transpose() }, self.read_timeout) => next,
            };

            match next {
                Ok(Some(frame)) => self.handle_frame(frame),
                Ok(None) => break Some(DisconnectCause::PeerClosed),
                Err(ProtocolError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break Some(DisconnectCause::PeerClosed);
                }
                Err(ProtocolError::Io(err)) if ProtocolError::is_peer_reset(&err) => {
                    debug!(client_id = self.client_id(), error = %err, "Peer reset connection");
                    break Some(DisconnectCause::PeerReset);
                }
                Err(err) => {
                    // a cancelled connection may surface as a read error
                    if self.cancel.is_cancelled() {
                        break None;
                    }
                    global_metrics().protocol_error();
                    warn!(client_id = self.client_id(), error = %err, "Receive failed");
                    emit(
                        self.sink.as_ref(),
                        NetworkEvent::ReceiveFailed {
                            side: self.side,
                            client_id: self.client_id(),
                            error: err.to_string(),
                        },
                    );
                    break Some(DisconnectCause::ReceiveFailed);
                }
            }

            if let Some(cause) = self.take_pending_disconnect() {
                break Some(cause);
            }
        };

        trace!(client_id = self.client_id(), "Receive loop finished");
        if let Some(cause) = cause {
            self.close_with(false, cause).await;
        }
    }

    fn handle_frame(&self, frame: Frame) {
        let bytes = frame.wire_len() as u64;
        match frame {
            Frame::Packet { id, body } => match self.registry.decode(id, body, self) {
                Ok(packet) => {
                    global_metrics().packet_received(bytes);
                    trace!(client_id = self.client_id(), packet_id = id, bytes, "Packet received");
                    emit(
                        self.sink.as_ref(),
                        NetworkEvent::PacketReceived {
                            side: self.side,
                            client_id: self.client_id(),
                            packet: Arc::from(packet),
                        },
                    );
                }
                Err(ProtocolError::UnregisteredPacket(_)) => {
                    self.report_unknown(TAG_PACKET, Some(id), bytes);
                }
                Err(err) => {
                    global_metrics().packet_failed();
                    warn!(client_id = self.client_id(), packet_id = id, error = %err, "Packet decode failed");
                    emit(
                        self.sink.as_ref(),
                        NetworkEvent::PacketReceiveFailed {
                            side: self.side,
                            client_id: self.client_id(),
                            packet_id: id,
                            error: err.to_string(),
                        },
                    );
                }
            },
            Frame::Unknown { tag, .. } => self.report_unknown(tag, None, bytes),
        }
    }

    fn report_unknown(&self, tag: u8, packet_id: Option<i32>, bytes: u64) {
        global_metrics().unknown_record(bytes);
        debug!(client_id = self.client_id(), tag, ?packet_id, "Unknown record received");
        emit(
            self.sink.as_ref(),
            NetworkEvent::UnknownObjectReceived {
                side: self.side,
                client_id: self.client_id(),
                tag,
                packet_id,
            },
        );
    }

    fn take_pending_disconnect(&self) -> Option<DisconnectCause> {
        self.pending_disconnect.lock().ok()?.take()
    }
}

impl PacketContext for Connection {
    fn side(&self) -> Side {
        self.side
    }

    fn client_id(&self) -> i32 {
        Connection::client_id(self)
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn assign_client_id(&self, id: i32) -> Result<()> {
        if self.side == Side::Server {
            return Err(ProtocolError::UnexpectedMessage(
                "client id assignment received by server".into(),
            ));
        }

        self.client_id
            .compare_exchange(UNASSIGNED_CLIENT_ID, id, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(ProtocolError::ClientIdAlreadyAssigned)?;

        info!(client_id = id, peer = %self.peer_addr, "Client id assigned");
        emit(self.sink.as_ref(), NetworkEvent::ClientIdAssigned { client_id: id });
        Ok(())
    }

    fn request_disconnect(&self, client_id: i32, from_client: bool) {
        // a notice only counts when it comes from the other end and names us
        let from_peer = match self.side {
            Side::Server => from_client,
            Side::Client => !from_client,
        };
        if !from_peer || client_id != Connection::client_id(self) {
            warn!(
                side = %self.side,
                client_id = Connection::client_id(self),
                notice_client_id = client_id,
                from_client,
                "Ignoring disconnect notice"
            );
            return;
        }

        debug!(client_id, "Disconnect requested by peer");
        if let Ok(mut pending) = self.pending_disconnect.lock() {
            *pending = Some(DisconnectCause::Remote);
        }
    }
}
