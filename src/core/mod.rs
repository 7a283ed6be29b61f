//! # Core Wire Components
//!
//! Low-level packet handling and framing for the bridge protocol.
//!
//! This module provides the foundation for the protocol: the fixed-header
//! packet format and a codec for framing packets over byte streams.
//!
//! ## Components
//! - **Packet**: 24-byte little-endian header plus payload
//! - **Codec**: Tokio codec for framing over byte streams
//!
//! ## Wire Format
//! ```text
//! [command:u32] [arg0:u32] [arg1:u32] [data_length:u32] [data_checksum:u32] [magic:u32] [payload(N)]
//! ```
//!
//! ## Security
//! - Payload length is validated against the configured maximum before allocation
//! - `magic` must equal `command ^ 0xffffffff`, rejecting desynchronized streams
//! - Protocol v1 additionally validates a byte-sum checksum of the payload

pub mod codec;
pub mod packet;

pub use codec::PacketCodec;
pub use packet::{Command, Packet, ProtocolVersion};
