//! # Core Protocol Components
//!
//! Low-level packet handling, framing, and binary field encoding.
//!
//! ## Components
//! - **Packet**: the `Packet` trait, decode context and reserved id range
//! - **Wire**: primitive field writer/reader used by packet bodies
//! - **Codec**: Tokio codec for framing records over byte streams
//!
//! ## Wire Format
//! ```text
//! [Length(4)] [Tag(1)] [Packet id(4)] [Body(N)]
//! ```
//!
//! ## Security
//! - Maximum frame size: 16MB (prevents memory exhaustion)
//! - Length validation before allocation
//! - Bounds-checked field reads

pub mod codec;
pub mod packet;
pub mod wire;
