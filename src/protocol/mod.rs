//! # Protocol Layer
//!
//! Packet registration, system packets and the event surface.
//!
//! ## Components
//! - **Registry**: packet id → factory map, encode/decode mediation
//! - **System**: reserved packets for client id assignment and graceful
//!   disconnect
//! - **Event**: [`NetworkEvent`](event::NetworkEvent) and the
//!   [`EventSink`](event::EventSink) interface
//! - **Dispatcher**: priority-ordered [`EventSink`](event::EventSink)
//!
//! ## Reserved ids
//! | Id | Packet | Direction |
//! |----|--------|-----------|
//! | -1 | `ClientIdPacket` | server → client |
//! | -2 | `DisconnectPacket` | either |

pub mod dispatcher;
pub mod event;
pub mod registry;
pub mod system;

#[cfg(test)]
mod tests;
