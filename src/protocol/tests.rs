// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::SocketAddr;
use std::sync::Mutex;

use bytes::Bytes;

use crate::core::codec::Frame;
use crate::core::packet::{Packet, PacketContext, Side, UNASSIGNED_CLIENT_ID};
use crate::error::{ProtocolError, Result};
use crate::protocol::registry::PacketRegistry;
use crate::protocol::system::{ClientIdPacket, DisconnectPacket};

#[derive(Default)]
struct RecordingContext {
    assigned: Mutex<Vec<i32>>,
    disconnects: Mutex<Vec<(i32, bool)>>,
}

impl PacketContext for RecordingContext {
    fn side(&self) -> Side {
        Side::Client
    }

    fn client_id(&self) -> i32 {
        UNASSIGNED_CLIENT_ID
    }

    fn peer_addr(&self) -> SocketAddr {
        "127.0.0.1:3982".parse().unwrap()
    }

    fn assign_client_id(&self, id: i32) -> Result<()> {
        let mut assigned = self.assigned.lock().unwrap();
        if let Some(previous) = assigned.first() {
            return Err(ProtocolError::ClientIdAlreadyAssigned(*previous));
        }
        assigned.push(id);
        Ok(())
    }

    fn request_disconnect(&self, client_id: i32, from_client: bool) {
        self.disconnects.lock().unwrap().push((client_id, from_client));
    }
}

fn body_of(frame: Frame) -> (i32, Bytes) {
    match frame {
        Frame::Packet { id, body } => (id, body),
        other => panic!("expected packet frame, got {other:?}"),
    }
}

#[test]
fn client_id_packet_assigns_through_context() {
    let registry = PacketRegistry::new();
    let ctx = RecordingContext::default();

    let (id, body) = body_of(registry.encode(&ClientIdPacket::new(7)).unwrap());
    assert_eq!(id, -1);
    assert_eq!(&body[..], &[0, 0, 0, 7]);

    let packet = registry.decode(id, body.clone(), &ctx).unwrap();
    assert_eq!(packet.downcast_ref::<ClientIdPacket>().unwrap().client_id, 7);
    assert_eq!(*ctx.assigned.lock().unwrap(), vec![7]);

    // second assignment is refused by the context
    assert!(matches!(
        registry.decode(id, body, &ctx),
        Err(ProtocolError::ClientIdAlreadyAssigned(7))
    ));
}

#[test]
fn disconnect_packet_layout_and_request() {
    let registry = PacketRegistry::new();
    let ctx = RecordingContext::default();

    let (id, body) = body_of(registry.encode(&DisconnectPacket::new(3, true)).unwrap());
    assert_eq!(id, -2);
    assert_eq!(&body[..], &[1, 0, 0, 0, 3]);

    let packet = registry.decode(id, body, &ctx).unwrap();
    assert_eq!(
        *packet.downcast_ref::<DisconnectPacket>().unwrap(),
        DisconnectPacket::new(3, true)
    );
    assert_eq!(*ctx.disconnects.lock().unwrap(), vec![(3, true)]);
}

#[test]
fn trailing_bytes_are_a_desync() {
    let registry = PacketRegistry::new();
    let ctx = RecordingContext::default();
    let body = Bytes::from_static(&[0, 0, 0, 1, 0xFF]);
    assert!(matches!(
        registry.decode(ClientIdPacket::ID, body, &ctx),
        Err(ProtocolError::FrameDesync(_))
    ));
}

#[test]
fn truncated_body_is_a_desync() {
    let registry = PacketRegistry::new();
    let ctx = RecordingContext::default();
    let body = Bytes::from_static(&[1, 0, 0]);
    assert!(matches!(
        registry.decode(DisconnectPacket::ID, body, &ctx),
        Err(ProtocolError::FrameDesync(_))
    ));
    assert!(ctx.disconnects.lock().unwrap().is_empty());
}

#[test]
fn decode_into_checks_packet_id() {
    let registry = PacketRegistry::new();
    let ctx = RecordingContext::default();
    let mut target = DisconnectPacket::default();
    let body = Bytes::from_static(&[0, 0, 0, 9]);

    assert!(matches!(
        registry.decode_into(ClientIdPacket::ID, &mut target, body, &ctx),
        Err(ProtocolError::PacketIdMismatch {
            expected: -1,
            actual: -2
        })
    ));
}

#[test]
fn decode_into_existing_instance() {
    let registry = PacketRegistry::new();
    let ctx = RecordingContext::default();
    let mut target = ClientIdPacket::default();
    registry
        .decode_into(ClientIdPacket::ID, &mut target, Bytes::from_static(&[0, 0, 0, 4]), &ctx)
        .unwrap();
    assert_eq!(target.client_id, 4);
    assert_eq!(target.id(), ClientIdPacket::ID);
}
