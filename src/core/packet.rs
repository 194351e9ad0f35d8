//! # Packets
//!
//! A packet is a typed unit of application data identified by a numeric id.
//! Each concrete type owns its body layout: it writes its fields with a
//! [`PacketWriter`] and reads them back with a [`PacketReader`].
//!
//! Ids `<= 0` are reserved for system packets (see [`SYSTEM_ID_MAX`]).
//!
//! ## Example
//! ```rust
//! use framelink::core::packet::{Packet, PacketContext};
//! use framelink::core::wire::{PacketReader, PacketWriter};
//! use framelink::error::Result;
//!
//! #[derive(Debug, Default)]
//! struct Chat {
//!     text: String,
//! }
//!
//! impl Packet for Chat {
//!     fn id(&self) -> i32 {
//!         10
//!     }
//!
//!     fn encode(&self, out: &mut PacketWriter) -> Result<()> {
//!         out.write_string(&self.text);
//!         Ok(())
//!     }
//!
//!     fn decode(&mut self, _ctx: &dyn PacketContext, input: &mut PacketReader) -> Result<()> {
//!         self.text = input.read_string()?;
//!         Ok(())
//!     }
//! }
//! ```

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;

use crate::core::wire::{PacketReader, PacketWriter};
use crate::error::Result;

/// Highest id in the reserved system range.
pub const SYSTEM_ID_MAX: i32 = 0;

/// Client id of a connection that has not been assigned one yet.
pub const UNASSIGNED_CLIENT_ID: i32 = -1;

/// Returns true if `id` lies in the reserved system range.
#[inline]
pub fn is_system_id(id: i32) -> bool {
    id <= SYSTEM_ID_MAX
}

/// Which end of the link a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Dialled out by a [`NetworkClient`](crate::service::client::NetworkClient).
    Client,
    /// Accepted by a [`NetworkServer`](crate::service::server::NetworkServer).
    Server,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Server => f.write_str("server"),
        }
    }
}

/// Handle into the connection a packet is being decoded for.
///
/// Decoders use it to reach back into connection state, e.g. to record the
/// client id assigned by the server.
pub trait PacketContext: Send + Sync {
    /// Side of the receiving connection.
    fn side(&self) -> Side;

    /// Client id of the receiving connection, or [`UNASSIGNED_CLIENT_ID`].
    fn client_id(&self) -> i32;

    /// Remote address of the receiving connection.
    fn peer_addr(&self) -> SocketAddr;

    /// Record the id assigned by the server. Succeeds once per client-side
    /// connection.
    fn assign_client_id(&self, id: i32) -> Result<()>;

    /// Ask for the connection to be torn down after the current frame.
    fn request_disconnect(&self, client_id: i32, from_client: bool);
}

/// A typed, fixed-layout unit of application data.
pub trait Packet: Any + Send + Sync + fmt::Debug {
    /// Registry-unique id of this packet type.
    fn id(&self) -> i32;

    /// Write this packet's fields.
    fn encode(&self, out: &mut PacketWriter) -> Result<()>;

    /// Read this packet's fields, in the order `encode` wrote them.
    fn decode(&mut self, ctx: &dyn PacketContext, input: &mut PacketReader) -> Result<()>;
}

impl dyn Packet {
    /// Downcast a received packet to its concrete type.
    pub fn downcast_ref<T: Packet>(&self) -> Option<&T> {
        let any: &dyn Any = self;
        any.downcast_ref::<T>()
    }

    pub fn is<T: Packet>(&self) -> bool {
        self.downcast_ref::<T>().is_some()
    }
}
