//! # Error Types
//!
//! Error handling for the framed packet transport.
//!
//! This module defines every error variant that can surface from the library,
//! from low-level I/O failures to lifecycle and provisioning errors.
//!
//! ## Error Categories
//! - **Lifecycle**: bind and connect failures after the retry policy gave up
//! - **Transport security**: TLS handshake and certificate provisioning failures
//! - **Protocol**: frame desync, unregistered packets, oversized frames
//! - **Registry**: duplicate or reserved packet ids
//! - **Configuration**: invalid builder or TOML settings
//!
//! Protocol errors are contained to the connection that produced them and are
//! reported through the event sink. Configuration and provisioning errors are
//! returned synchronously to the caller of the builder.
//!
//! ## Example Usage
//! ```rust
//! use framelink::error::{ProtocolError, Result};
//! use framelink::protocol::registry::PacketRegistry;
//!
//! fn check(registry: &PacketRegistry, id: i32) -> Result<()> {
//!     if !registry.is_registered(id) {
//!         return Err(ProtocolError::UnregisteredPacket(id));
//!     }
//!     Ok(())
//! }
//!
//! let registry = PacketRegistry::new();
//! assert!(check(&registry, -1).is_ok());
//! assert!(check(&registry, 77).is_err());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Registry lock errors
    pub const ERR_REGISTRY_WRITE_LOCK: &str = "Failed to acquire write lock on packet registry";

    /// Framing errors
    pub const ERR_EMPTY_FRAME: &str = "Frame length must be at least one byte";
    pub const ERR_SHORT_PACKET_RECORD: &str = "Packet record shorter than its id";
    pub const ERR_TRAILING_BYTES: &str = "Packet body has trailing bytes";
    pub const ERR_TRUNCATED_FIELD: &str = "Packet body ended before field was complete";
    pub const ERR_INVALID_UTF8: &str = "String field is not valid UTF-8";
    pub const ERR_INVALID_BOOL: &str = "Boolean field must be 0 or 1";

    /// Transport security errors
    pub const ERR_TLS_REQUIRED: &str = "TLS is required but no TLS material was configured";
    pub const ERR_NO_CERTIFICATES: &str = "No certificates found";
    pub const ERR_NO_PRIVATE_KEY: &str = "No supported private key found";
    pub const ERR_EMPTY_CA_DIR: &str = "CA directory contains no certificate files";

    /// Lock poisoning
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
}

/// ProtocolError is the error type for all library operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to bind {address} after {attempts} attempt(s): {source}")]
    BindFailure {
        address: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("Failed to connect to {address} after {attempts} attempt(s): {reason}")]
    ConnectFailure {
        address: String,
        attempts: u32,
        reason: String,
    },

    #[error("TLS handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("Frame desync: {0}")]
    FrameDesync(String),

    #[error("Connection reset by peer")]
    PeerReset,

    #[error("Certificate provisioning failed: {0}")]
    ProvisioningFailure(String),

    #[error("Packet id {0} is not registered")]
    UnregisteredPacket(i32),

    #[error("Packet id {0} is already registered")]
    DuplicatePacketId(i32),

    #[error("Packet id {0} is in the reserved system range")]
    ReservedPacketId(i32),

    #[error("Packet id mismatch: frame carries {expected}, packet reports {actual}")]
    PacketIdMismatch { expected: i32, actual: i32 },

    #[error("Client id already assigned ({0})")]
    ClientIdAlreadyAssigned(i32),

    #[error("Frame too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Invalid frame header: {0}")]
    InvalidHeader(&'static str),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection timed out (no activity)")]
    ConnectionTimeout,

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether a connect or bind attempt that failed with this error may be
    /// retried by a reconnect/restart policy.
    ///
    /// Handshake, provisioning and configuration errors are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::Timeout
                | ProtocolError::ConnectionTimeout
                | ProtocolError::ProxyError(_)
                | ProtocolError::PeerReset
                | ProtocolError::ConnectionClosed
        )
    }

    /// Wrap an I/O error, folding abrupt closes into [`ProtocolError::PeerReset`].
    pub fn from_io(err: io::Error) -> Self {
        if Self::is_peer_reset(&err) {
            ProtocolError::PeerReset
        } else {
            ProtocolError::Io(err)
        }
    }

    /// Whether an I/O error represents an abrupt close by the peer.
    pub fn is_peer_reset(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
