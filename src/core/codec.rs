//! # Frame Codec
//!
//! Tokio codec for the outer record layer.
//!
//! ## Wire Format
//! ```text
//! [Length(4)] [Tag(1)] [Value(Length - 1)]
//!
//! Tag 0x01  packet record: [Packet id (i32)] [Body]
//! other     record of a type this peer does not understand
//! ```
//!
//! The length prefix makes every frame boundary explicit, so a packet whose
//! body fails to decode does not desynchronize the stream.
//!
//! ## Security
//! - Maximum frame length: 16MB (prevents memory exhaustion)
//! - Length validation before allocation

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_FRAME_SIZE;
use crate::error::{constants, ProtocolError, Result};

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Record tag of a packet frame.
pub const TAG_PACKET: u8 = 0x01;

/// One record on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A packet id followed by that packet's body.
    Packet { id: i32, body: Bytes },
    /// A record with a tag this codec does not interpret.
    Unknown { tag: u8, payload: Bytes },
}

impl Frame {
    pub fn packet(id: i32, body: Bytes) -> Self {
        Frame::Packet { id, body }
    }

    /// Number of bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        LENGTH_PREFIX_SIZE
            + 1
            + match self {
                Frame::Packet { body, .. } => 4 + body.len(),
                Frame::Unknown { payload, .. } => payload.len(),
            }
    }
}

/// Codec for framing [`Frame`] values over a byte stream.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Use a smaller frame limit than the default.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length == 0 {
            return Err(ProtocolError::InvalidHeader(constants::ERR_EMPTY_FRAME));
        }
        if length > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(length));
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let mut record = src.split_to(length).freeze();
        let tag = record.get_u8();

        match tag {
            TAG_PACKET => {
                if record.remaining() < 4 {
                    return Err(ProtocolError::InvalidHeader(
                        constants::ERR_SHORT_PACKET_RECORD,
                    ));
                }
                let id = record.get_i32();
                Ok(Some(Frame::Packet { id, body: record }))
            }
            other => Ok(Some(Frame::Unknown {
                tag: other,
                payload: record,
            })),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        let length = item.wire_len() - LENGTH_PREFIX_SIZE;
        if length > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(length));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + length);
        dst.put_u32(length as u32);
        match item {
            Frame::Packet { id, body } => {
                dst.put_u8(TAG_PACKET);
                dst.put_i32(id);
                dst.extend_from_slice(&body);
            }
            Frame::Unknown { tag, payload } => {
                dst.put_u8(tag);
                dst.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::packet(42, Bytes::from_static(b"\x00\x00\x00\x2a\x01")), &mut buf)
            .unwrap();

        assert_eq!(buf.len(), 4 + 1 + 4 + 5);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            decoded,
            Frame::packet(42, Bytes::from_static(b"\x00\x00\x00\x2a\x01"))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::packet(7, Bytes::from_static(&[1, 2, 3, 4])), &mut buf)
            .unwrap();

        let half = buf.len() / 2;
        let mut partial = buf.split_to(half);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_multiple_frames_in_order() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        for id in 1..=5 {
            codec.encode(Frame::packet(id, Bytes::new()), &mut buf).unwrap();
        }
        for id in 1..=5 {
            match codec.decode(&mut buf).unwrap().unwrap() {
                Frame::Packet { id: got, body } => {
                    assert_eq!(got, id);
                    assert!(body.is_empty());
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_unknown_tag_is_surfaced() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(0x7F);
        buf.put_slice(b"hi");

        match codec.decode(&mut buf).unwrap().unwrap() {
            Frame::Unknown { tag, payload } => {
                assert_eq!(tag, 0x7F);
                assert_eq!(&payload[..], b"hi");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::with_max_frame_size(1024);
        let mut buf = BytesMut::new();
        buf.put_u32(4096);
        buf.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::OversizedPacket(4096))
        ));
    }

    #[test]
    fn test_empty_and_short_records_rejected() {
        let mut codec = FrameCodec::new();

        let mut empty = BytesMut::new();
        empty.put_u32(0);
        assert!(matches!(
            codec.decode(&mut empty),
            Err(ProtocolError::InvalidHeader(_))
        ));

        let mut short = BytesMut::new();
        short.put_u32(3);
        short.put_u8(TAG_PACKET);
        short.put_u16(1);
        assert!(matches!(
            codec.decode(&mut short),
            Err(ProtocolError::InvalidHeader(_))
        ));
    }
}
