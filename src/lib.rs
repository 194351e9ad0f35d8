//! # framelink
//!
//! Point-to-point framed packet transport: a client and a server exchange
//! typed packets over TCP, optionally wrapped in mutually authenticated TLS.
//!
//! ## Layers
//! - [`core`]: the `Packet` trait, primitive field encoding and the frame codec
//! - [`protocol`]: packet registry, system packets, events and the dispatcher
//! - [`transport`]: TLS provisioning, HTTP proxy tunnelling, stream plumbing
//! - [`service`]: connections, the client and the server
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging,
//!   metrics, retry policy and timeouts
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use framelink::prelude::*;
//!
//! # async fn run() -> framelink::error::Result<()> {
//! let registry = Arc::new(PacketRegistry::new());
//! let events = Arc::new(EventDispatcher::new());
//! events.on(|event| {
//!     if let NetworkEvent::PacketReceived { packet, .. } = event.kind() {
//!         println!("received {packet:?}");
//!     }
//! })?;
//!
//! let server = ServerBuilder::new()
//!     .address("127.0.0.1")
//!     .port(0)
//!     .registry(registry.clone())
//!     .event_sink(events.clone())
//!     .build()?;
//! server.start().await?;
//!
//! let port = server.local_addr().map(|a| a.port()).unwrap_or_default();
//! let client = ClientBuilder::new("127.0.0.1", port)
//!     .registry(registry)
//!     .build()?;
//! client.connect().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::core::packet::{Packet, PacketContext, Side};
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::registry::PacketRegistry;
pub use crate::service::client::{ClientBuilder, NetworkClient};
pub use crate::service::server::{NetworkServer, ServerBuilder};

/// Commonly used types in one import.
pub mod prelude {
    pub use crate::config::NetworkConfig;
    pub use crate::core::packet::{Packet, PacketContext, Side};
    pub use crate::core::wire::{PacketReader, PacketWriter};
    pub use crate::error::{ProtocolError, Result};
    pub use crate::protocol::dispatcher::{EventDispatcher, HandlerId, Priority};
    pub use crate::protocol::event::{DisconnectCause, Event, EventSink, NetworkEvent};
    pub use crate::protocol::registry::PacketRegistry;
    pub use crate::service::client::{ClientBuilder, ClientState, NetworkClient};
    pub use crate::service::connection::{Connection, ConnectionState};
    pub use crate::service::server::{NetworkServer, ServerBuilder, ServerState};
    pub use crate::transport::proxy::ProxyConfig;
    pub use crate::transport::tls::{TlsClientConfig, TlsServerConfig, TlsVersion};
}
