//! Tokio codec for framing packets over byte streams.
//!
//! The decoder buffers until a whole header plus payload is available, so
//! partial reads never consume bytes. The checksum rule follows the
//! revision negotiated at CNXN time; both sides of a connection share one
//! version cell, so a revision change applies to frames in both
//! directions from the next packet on.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::core::packet::{checksum, Command, Packet, ProtocolVersion, RawHeader, HEADER_LEN};
use crate::error::{constants, BridgeError};

/// Codec turning a byte stream into [`Packet`]s and back.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    /// Upper bound accepted for `data_length` on receive.
    recv_limit: usize,
    /// Negotiated version word, shared with the transport that owns the
    /// connection.
    version: Arc<AtomicU32>,
}

impl PacketCodec {
    /// Codec starting at protocol v1 (checksums validated), as required
    /// before version negotiation completes.
    pub fn new(recv_limit: usize) -> Self {
        Self::with_shared_version(
            recv_limit,
            Arc::new(AtomicU32::new(crate::core::packet::VERSION_WITH_CHECKSUM)),
        )
    }

    /// Codec sharing an externally owned version cell.
    pub fn with_shared_version(recv_limit: usize, version: Arc<AtomicU32>) -> Self {
        Self {
            recv_limit,
            version,
        }
    }

    /// Codec pinned at a fixed revision; used by test peers.
    pub fn with_version(recv_limit: usize, version: ProtocolVersion) -> Self {
        Self::with_shared_version(recv_limit, Arc::new(AtomicU32::new(version.word())))
    }

    /// The shared version cell, for wiring into a transport.
    pub fn shared_version(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.version)
    }

    fn current_version(&self) -> ProtocolVersion {
        ProtocolVersion::from_word(self.version.load(Ordering::Acquire))
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = BridgeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, BridgeError> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let header = RawHeader::parse(&src[..HEADER_LEN]);
        if !header.magic_ok() {
            return Err(BridgeError::protocol(constants::ERR_BAD_MAGIC));
        }
        let command = Command::from_tag(header.command)
            .ok_or_else(|| BridgeError::protocol(constants::ERR_UNKNOWN_COMMAND))?;

        let len = header.data_length as usize;
        if len > self.recv_limit {
            return Err(BridgeError::Protocol(format!(
                "{}: {} > {}",
                constants::ERR_OVERSIZED_PAYLOAD,
                len,
                self.recv_limit
            )));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();

        if self.current_version() == ProtocolVersion::V1
            && checksum(&payload) != header.data_checksum
        {
            return Err(BridgeError::protocol(constants::ERR_BAD_CHECKSUM));
        }

        trace!(command = %command, arg0 = header.arg0, arg1 = header.arg1, bytes = len, "Decoded packet");
        Ok(Some(Packet {
            command,
            arg0: header.arg0,
            arg1: header.arg1,
            payload,
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = BridgeError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), BridgeError> {
        let header = packet.header(self.current_version());
        dst.reserve(HEADER_LEN + packet.payload.len());
        header.write_to(dst);
        dst.extend_from_slice(&packet.payload);
        Ok(())
    }
}
