//! Packet types and header layout.
//!
//! Every unit on the wire is one packet: a 24-byte little-endian header
//! followed by `data_length` payload bytes. `arg0` carries the sender's
//! stream id and `arg1` the receiver's; id 0 is reserved for unpaired
//! OPEN targets.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{constants, BridgeError, Result};

/// Header length in bytes.
pub const HEADER_LEN: usize = 24;

/// Command tags (ASCII, little-endian u32).
pub const CNXN: u32 = 0x4e58_4e43;
pub const AUTH: u32 = 0x4854_5541;
pub const OPEN: u32 = 0x4e45_504f;
pub const OKAY: u32 = 0x5941_4b4f;
pub const CLSE: u32 = 0x4553_4c43;
pub const WRTE: u32 = 0x4554_5257;
pub const SYNC: u32 = 0x434e_5953;
pub const STLS: u32 = 0x534c_5453;

/// Wire version word for protocol v1 (checksums required).
pub const VERSION_WITH_CHECKSUM: u32 = 0x0100_0000;
/// Wire version word for protocol v2 (checksum field sent as zero, ignored).
pub const VERSION_SKIP_CHECKSUM: u32 = 0x0100_0001;

/// AUTH packet subtypes, carried in `arg0`.
pub const AUTH_TOKEN: u32 = 1;
pub const AUTH_SIGNATURE: u32 = 2;
pub const AUTH_RSAPUBLICKEY: u32 = 3;

/// Size of the random challenge sent with `AUTH(TOKEN)`.
pub const TOKEN_SIZE: usize = 20;

/// Negotiated protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// Legacy: `data_checksum` must equal the wrapping byte sum of the payload.
    V1,
    /// Current: `data_checksum` is sent as 0 and ignored on receive.
    V2,
}

impl ProtocolVersion {
    /// Map a peer's version word onto a revision we speak.
    pub fn from_word(word: u32) -> Self {
        if word >= VERSION_SKIP_CHECKSUM {
            ProtocolVersion::V2
        } else {
            ProtocolVersion::V1
        }
    }

    /// The version word advertised for this revision.
    pub fn word(self) -> u32 {
        match self {
            ProtocolVersion::V1 => VERSION_WITH_CHECKSUM,
            ProtocolVersion::V2 => VERSION_SKIP_CHECKSUM,
        }
    }
}

/// Command tag of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Cnxn,
    Auth,
    Open,
    Okay,
    Clse,
    Wrte,
    Sync,
    Stls,
}

impl Command {
    /// The wire tag for this command.
    pub fn tag(self) -> u32 {
        match self {
            Command::Cnxn => CNXN,
            Command::Auth => AUTH,
            Command::Open => OPEN,
            Command::Okay => OKAY,
            Command::Clse => CLSE,
            Command::Wrte => WRTE,
            Command::Sync => SYNC,
            Command::Stls => STLS,
        }
    }

    /// Parse a wire tag; `None` for unknown tags.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            CNXN => Some(Command::Cnxn),
            AUTH => Some(Command::Auth),
            OPEN => Some(Command::Open),
            OKAY => Some(Command::Okay),
            CLSE => Some(Command::Clse),
            WRTE => Some(Command::Wrte),
            SYNC => Some(Command::Sync),
            STLS => Some(Command::Stls),
            _ => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Cnxn => "CNXN",
            Command::Auth => "AUTH",
            Command::Open => "OPEN",
            Command::Okay => "OKAY",
            Command::Clse => "CLSE",
            Command::Wrte => "WRTE",
            Command::Sync => "SYNC",
            Command::Stls => "STLS",
        };
        f.write_str(name)
    }
}

/// Wrapping byte-sum checksum used by protocol v1.
pub fn checksum(payload: &[u8]) -> u32 {
    payload
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}

/// Raw header fields, exactly as laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    pub command: u32,
    pub arg0: u32,
    pub arg1: u32,
    pub data_length: u32,
    pub data_checksum: u32,
    pub magic: u32,
}

impl RawHeader {
    /// Parse a header from a buffer holding at least [`HEADER_LEN`] bytes.
    pub fn parse(mut buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= HEADER_LEN);
        Self {
            command: buf.get_u32_le(),
            arg0: buf.get_u32_le(),
            arg1: buf.get_u32_le(),
            data_length: buf.get_u32_le(),
            data_checksum: buf.get_u32_le(),
            magic: buf.get_u32_le(),
        }
    }

    /// Append the header to `dst` in wire order.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.command);
        dst.put_u32_le(self.arg0);
        dst.put_u32_le(self.arg1);
        dst.put_u32_le(self.data_length);
        dst.put_u32_le(self.data_checksum);
        dst.put_u32_le(self.magic);
    }

    /// Validate the magic word against the command tag.
    pub fn magic_ok(&self) -> bool {
        self.magic == self.command ^ 0xffff_ffff
    }
}

/// One protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub payload: Bytes,
}

impl Packet {
    /// Build a packet with an empty payload.
    pub fn control(command: Command, arg0: u32, arg1: u32) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload: Bytes::new(),
        }
    }

    /// CNXN carrying our version word, payload limit, and banner.
    pub fn cnxn(version_word: u32, max_payload: usize, banner: &str) -> Self {
        Self {
            command: Command::Cnxn,
            arg0: version_word,
            arg1: max_payload as u32,
            payload: Bytes::copy_from_slice(banner.as_bytes()),
        }
    }

    /// AUTH with the given subtype and body.
    pub fn auth(subtype: u32, body: Bytes) -> Self {
        Self {
            command: Command::Auth,
            arg0: subtype,
            arg1: 0,
            payload: body,
        }
    }

    /// OPEN from `local_id` naming a service; the name is NUL terminated on
    /// the wire.
    pub fn open(local_id: u32, service: &str) -> Self {
        let mut payload = BytesMut::with_capacity(service.len() + 1);
        payload.put_slice(service.as_bytes());
        payload.put_u8(0);
        Self {
            command: Command::Open,
            arg0: local_id,
            arg1: 0,
            payload: payload.freeze(),
        }
    }

    /// OKAY credit return from `local_id` to `remote_id`.
    pub fn okay(local_id: u32, remote_id: u32) -> Self {
        Self::control(Command::Okay, local_id, remote_id)
    }

    /// WRTE carrying one payload chunk from `local_id` to `remote_id`.
    pub fn wrte(local_id: u32, remote_id: u32, payload: Bytes) -> Self {
        Self {
            command: Command::Wrte,
            arg0: local_id,
            arg1: remote_id,
            payload,
        }
    }

    /// CLSE from `local_id` (0 when rejecting an OPEN or acking a close) to
    /// `remote_id`.
    pub fn clse(local_id: u32, remote_id: u32) -> Self {
        Self::control(Command::Clse, local_id, remote_id)
    }

    /// The header for this packet under the given protocol revision.
    pub fn header(&self, version: ProtocolVersion) -> RawHeader {
        let tag = self.command.tag();
        RawHeader {
            command: tag,
            arg0: self.arg0,
            arg1: self.arg1,
            data_length: self.payload.len() as u32,
            data_checksum: match version {
                ProtocolVersion::V1 => checksum(&self.payload),
                ProtocolVersion::V2 => 0,
            },
            magic: tag ^ 0xffff_ffff,
        }
    }

    /// Serialize header plus payload into a fresh buffer.
    pub fn to_bytes(&self, version: ProtocolVersion) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.header(version).write_to(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a single packet from a complete buffer.
    ///
    /// # Errors
    /// Returns a `Protocol` error on truncation, bad magic, unknown tags,
    /// oversize claims, or (v1) checksum mismatch.
    pub fn from_bytes(buf: &[u8], version: ProtocolVersion, max_payload: usize) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(BridgeError::protocol("Truncated header"));
        }
        let header = RawHeader::parse(buf);
        if !header.magic_ok() {
            return Err(BridgeError::protocol(constants::ERR_BAD_MAGIC));
        }
        let command = Command::from_tag(header.command)
            .ok_or_else(|| BridgeError::protocol(constants::ERR_UNKNOWN_COMMAND))?;
        let len = header.data_length as usize;
        if len > max_payload {
            return Err(BridgeError::Protocol(format!(
                "{}: {} bytes",
                constants::ERR_OVERSIZED_PAYLOAD,
                len
            )));
        }
        if buf.len() < HEADER_LEN + len {
            return Err(BridgeError::protocol("Truncated payload"));
        }
        let payload = Bytes::copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + len]);
        if version == ProtocolVersion::V1 && checksum(&payload) != header.data_checksum {
            return Err(BridgeError::protocol(constants::ERR_BAD_CHECKSUM));
        }
        Ok(Self {
            command,
            arg0: header.arg0,
            arg1: header.arg1,
            payload,
        })
    }
}
