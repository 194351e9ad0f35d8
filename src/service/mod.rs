//! # Service Layer
//!
//! Connection lifecycle on top of the transport and protocol layers.
//!
//! ## Components
//! - **Connection**: one socket with its receive task and writer lock
//! - **Client**: connect / disconnect / reconnect state machine
//! - **Server**: start / stop / restart, accept loop, active connection table

pub mod client;
pub mod connection;
pub mod server;

pub use client::{ClientBuilder, ClientState, NetworkClient};
pub use connection::{Connection, ConnectionState};
pub use server::{NetworkServer, ServerBuilder, ServerState};
