//! # Packet Field Encoding
//!
//! Primitive field layer used by packet bodies.
//!
//! Each packet type writes a fixed sequence of fields with [`PacketWriter`]
//! and reads the same sequence back with [`PacketReader`]. Fields carry no
//! type tags; the layout is implied by the packet id.
//!
//! ## Field Layout (big-endian)
//! ```text
//! u8 / bool   1 byte (bool is 0 or 1)
//! i16         2 bytes
//! i32 / u32   4 bytes
//! i64 / u64   8 bytes
//! f32 / f64   IEEE-754, 4 / 8 bytes
//! string      u32 length + UTF-8 bytes
//! bytes       u32 length + raw bytes
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{constants, ProtocolError, Result};

/// Writes packet fields into a growable buffer.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.buf.put_u8(u8::from(value));
        self
    }

    pub fn write_i16(&mut self, value: i16) -> &mut Self {
        self.buf.put_i16(value);
        self
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32(value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.buf.put_i64(value);
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64(value);
        self
    }

    pub fn write_f32(&mut self, value: f32) -> &mut Self {
        self.buf.put_f32(value);
        self
    }

    pub fn write_f64(&mut self, value: f64) -> &mut Self {
        self.buf.put_f64(value);
        self
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.write_bytes(value.as_bytes())
    }

    /// Write a length-prefixed byte slice.
    pub fn write_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.reserve(4 + value.len());
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish writing and hand out the encoded body.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads packet fields from a received body.
///
/// Every read checks the remaining length first, so a short body produces a
/// [`ProtocolError::FrameDesync`] instead of a panic.
#[derive(Debug, Clone)]
pub struct PacketReader {
    buf: Bytes,
}

impl PacketReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    #[inline]
    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::FrameDesync(format!(
                "{} (need {n} bytes, have {})",
                constants::ERR_TRUNCATED_FIELD,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ProtocolError::FrameDesync(
                constants::ERR_INVALID_BOOL.to_string(),
            )),
        }
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.need(4)?;
        Ok(self.buf.get_f32())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.need(8)?;
        Ok(self.buf.get_f64())
    }

    pub fn read_string(&mut self) -> Result<String> {
        let raw = self.read_bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| ProtocolError::FrameDesync(constants::ERR_INVALID_UTF8.to_string()))
    }

    /// Read a length-prefixed byte field without copying.
    pub fn read_bytes(&mut self) -> Result<Bytes> {
        let len = self.read_u32()? as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    /// Fail if any bytes are left after a packet finished decoding.
    pub fn finish(&self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::FrameDesync(format!(
                "{} ({} left)",
                constants::ERR_TRAILING_BYTES,
                self.remaining()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_read_back_in_order() {
        let mut w = PacketWriter::new();
        w.write_i32(-7)
            .write_bool(true)
            .write_string("héllo")
            .write_i64(i64::MIN)
            .write_f64(2.5)
            .write_bytes(&[1, 2, 3]);

        let mut r = PacketReader::new(w.into_bytes());
        assert_eq!(r.read_i32().unwrap(), -7);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_string().unwrap(), "héllo");
        assert_eq!(r.read_i64().unwrap(), i64::MIN);
        assert_eq!(r.read_f64().unwrap(), 2.5);
        assert_eq!(&r.read_bytes().unwrap()[..], &[1, 2, 3]);
        assert!(r.finish().is_ok());
    }

    #[test]
    fn truncated_body_is_desync() {
        let mut r = PacketReader::new(Bytes::from_static(&[0, 0, 1]));
        assert!(matches!(r.read_i32(), Err(ProtocolError::FrameDesync(_))));
    }

    #[test]
    fn string_length_beyond_body_is_desync() {
        let mut w = PacketWriter::new();
        w.write_u32(100).write_u8(b'a');
        let mut r = PacketReader::new(w.into_bytes());
        assert!(matches!(r.read_string(), Err(ProtocolError::FrameDesync(_))));
    }

    #[test]
    fn invalid_bool_rejected() {
        let mut r = PacketReader::new(Bytes::from_static(&[2]));
        assert!(r.read_bool().is_err());
    }

    #[test]
    fn trailing_bytes_detected() {
        let r = PacketReader::new(Bytes::from_static(&[9]));
        assert!(r.finish().is_err());
    }
}
