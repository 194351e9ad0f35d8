//! # Transport Layer
//!
//! Byte streams underneath the frame codec.
//!
//! ## Components
//! - **TLS**: certificate provisioning and handshakes (rustls)
//! - **Proxy**: HTTP `CONNECT` tunnelling for outbound client sockets
//!
//! Plain TCP and TLS streams are both carried as a [`BoxedStream`], so a
//! connection never needs to know which one it runs on.

pub mod proxy;
pub mod tls;

use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional async byte stream a connection can run on.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased stream, TCP or TLS.
pub type BoxedStream = Box<dyn AsyncStream>;
