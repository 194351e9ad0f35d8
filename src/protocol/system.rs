//! Reserved system packets used for handshake and teardown signalling.

use crate::core::packet::{Packet, PacketContext};
use crate::core::wire::{PacketReader, PacketWriter};
use crate::error::Result;

/// Server → client: carries the id the server assigned to this connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientIdPacket {
    pub client_id: i32,
}

impl ClientIdPacket {
    pub const ID: i32 = -1;

    pub fn new(client_id: i32) -> Self {
        Self { client_id }
    }
}

impl Packet for ClientIdPacket {
    fn id(&self) -> i32 {
        Self::ID
    }

    fn encode(&self, out: &mut PacketWriter) -> Result<()> {
        out.write_i32(self.client_id);
        Ok(())
    }

    fn decode(&mut self, ctx: &dyn PacketContext, input: &mut PacketReader) -> Result<()> {
        self.client_id = input.read_i32()?;
        ctx.assign_client_id(self.client_id)
    }
}

/// Graceful disconnect notice, sent by whichever side initiates teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisconnectPacket {
    pub client_id: i32,
    pub from_client: bool,
}

impl DisconnectPacket {
    pub const ID: i32 = -2;

    pub fn new(client_id: i32, from_client: bool) -> Self {
        Self {
            client_id,
            from_client,
        }
    }
}

impl Packet for DisconnectPacket {
    fn id(&self) -> i32 {
        Self::ID
    }

    fn encode(&self, out: &mut PacketWriter) -> Result<()> {
        out.write_bool(self.from_client).write_i32(self.client_id);
        Ok(())
    }

    fn decode(&mut self, ctx: &dyn PacketContext, input: &mut PacketReader) -> Result<()> {
        self.from_client = input.read_bool()?;
        self.client_id = input.read_i32()?;
        ctx.request_disconnect(self.client_id, self.from_client);
        Ok(())
    }
}
