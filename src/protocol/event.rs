//! # Network Events
//!
//! Every lifecycle transition and packet outcome is reported to an
//! [`EventSink`] so host applications can log or react without polling.
//!
//! Emission is synchronous: the emitting task calls [`EventSink::emit`] and
//! continues once every handler returned. Events from one connection are
//! emitted by its receive task in arrival order.
//!
//! Only [`NetworkEvent::IncomingConnection`] is cancellable. The server
//! checks the flag after emitting and drops the socket if a handler
//! cancelled it.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::core::packet::{Packet, Side};

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectCause {
    /// `disconnect()` was called on this side.
    Local,
    /// The peer sent a graceful disconnect notice.
    Remote,
    /// The peer closed the stream cleanly.
    PeerClosed,
    /// The stream was reset or aborted.
    PeerReset,
    /// Reading failed for another reason (codec error, read timeout, I/O).
    ReceiveFailed,
    /// The owning server is stopping.
    ServerStopped,
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectCause::Local => "local",
            DisconnectCause::Remote => "remote",
            DisconnectCause::PeerClosed => "peer closed",
            DisconnectCause::PeerReset => "peer reset",
            DisconnectCause::ReceiveFailed => "receive failed",
            DisconnectCause::ServerStopped => "server stopped",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A server bound its listener and started accepting.
    Started { local_addr: SocketAddr },
    /// A server stopped accepting and closed every connection.
    Stopped { local_addr: SocketAddr },
    /// A bind attempt failed and another one is scheduled.
    RestartScheduled {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// `accept()` returned an error; the accept loop keeps running.
    AcceptFailed { error: String },
    /// A socket was accepted (and its TLS handshake completed). Cancellable.
    IncomingConnection { peer: SocketAddr },
    /// A TLS handshake failed; the socket was discarded.
    HandshakeFailed {
        side: Side,
        peer: SocketAddr,
        error: String,
    },
    Connected {
        side: Side,
        client_id: i32,
        peer: SocketAddr,
    },
    Disconnected {
        side: Side,
        client_id: i32,
        peer: SocketAddr,
        cause: DisconnectCause,
    },
    /// The client received its id from the server.
    ClientIdAssigned { client_id: i32 },
    /// A connect attempt failed and another one is scheduled.
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// The client gave up connecting.
    ConnectFailed {
        address: String,
        attempts: u32,
        error: String,
    },
    PacketSent {
        side: Side,
        client_id: i32,
        packet: Arc<dyn Packet>,
    },
    PacketSendFailed {
        side: Side,
        client_id: i32,
        packet_id: i32,
        error: String,
    },
    PacketReceived {
        side: Side,
        client_id: i32,
        packet: Arc<dyn Packet>,
    },
    PacketReceiveFailed {
        side: Side,
        client_id: i32,
        packet_id: i32,
        error: String,
    },
    /// A record with an unknown tag, or a packet id nobody registered.
    UnknownObjectReceived {
        side: Side,
        client_id: i32,
        tag: u8,
        packet_id: Option<i32>,
    },
    /// The receive task hit an error it cannot recover from.
    ReceiveFailed {
        side: Side,
        client_id: i32,
        error: String,
    },
}

impl NetworkEvent {
    /// Short stable name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            NetworkEvent::Started { .. } => "started",
            NetworkEvent::Stopped { .. } => "stopped",
            NetworkEvent::RestartScheduled { .. } => "restart_scheduled",
            NetworkEvent::AcceptFailed { .. } => "accept_failed",
            NetworkEvent::IncomingConnection { .. } => "incoming_connection",
            NetworkEvent::HandshakeFailed { .. } => "handshake_failed",
            NetworkEvent::Connected { .. } => "connected",
            NetworkEvent::Disconnected { .. } => "disconnected",
            NetworkEvent::ClientIdAssigned { .. } => "client_id_assigned",
            NetworkEvent::ReconnectScheduled { .. } => "reconnect_scheduled",
            NetworkEvent::ConnectFailed { .. } => "connect_failed",
            NetworkEvent::PacketSent { .. } => "packet_sent",
            NetworkEvent::PacketSendFailed { .. } => "packet_send_failed",
            NetworkEvent::PacketReceived { .. } => "packet_received",
            NetworkEvent::PacketReceiveFailed { .. } => "packet_receive_failed",
            NetworkEvent::UnknownObjectReceived { .. } => "unknown_object_received",
            NetworkEvent::ReceiveFailed { .. } => "receive_failed",
        }
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, NetworkEvent::IncomingConnection { .. })
    }
}

/// An event in flight through an [`EventSink`].
#[derive(Debug, Clone)]
pub struct Event {
    kind: NetworkEvent,
    cancelled: bool,
}

impl Event {
    pub fn new(kind: NetworkEvent) -> Self {
        Self {
            kind,
            cancelled: false,
        }
    }

    pub fn kind(&self) -> &NetworkEvent {
        &self.kind
    }

    pub fn into_kind(self) -> NetworkEvent {
        self.kind
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Mark the event cancelled. Returns false for events that cannot be
    /// cancelled, leaving them untouched.
    pub fn set_cancelled(&mut self, cancelled: bool) -> bool {
        if !self.kind.is_cancellable() {
            return false;
        }
        self.cancelled = cancelled;
        true
    }

    pub fn cancel(&mut self) -> bool {
        self.set_cancelled(true)
    }
}

/// Receives every event emitted by clients, servers and connections.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &mut Event);
}

/// Sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &mut Event) {}
}

/// Emit a non-cancellable event.
pub(crate) fn emit(sink: &dyn EventSink, kind: NetworkEvent) {
    let mut event = Event::new(kind);
    sink.emit(&mut event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_incoming_connection_is_cancellable() {
        let mut incoming = Event::new(NetworkEvent::IncomingConnection {
            peer: "127.0.0.1:1".parse().unwrap(),
        });
        assert!(incoming.cancel());
        assert!(incoming.is_cancelled());

        let mut started = Event::new(NetworkEvent::Started {
            local_addr: "127.0.0.1:1".parse().unwrap(),
        });
        assert!(!started.cancel());
        assert!(!started.is_cancelled());
    }

    #[test]
    fn names_are_stable() {
        let event = NetworkEvent::ClientIdAssigned { client_id: 1 };
        assert_eq!(event.name(), "client_id_assigned");
    }
}
