//! Remote socket shadow.
//!
//! Exists only while a pairing is live; serializes the peer-directed half
//! of a stream into WRTE/OKAY/CLSE packets on the owning transport.

use std::sync::Arc;

use bytes::Bytes;

use crate::core::packet::Packet;
use crate::error::Result;
use crate::socket::SocketId;
use crate::transport::Transport;

/// Shadow of a peer's local socket.
#[derive(Clone)]
pub struct RemoteSocket {
    remote_id: SocketId,
    transport: Arc<Transport>,
}

impl RemoteSocket {
    pub fn new(remote_id: SocketId, transport: Arc<Transport>) -> Self {
        Self {
            remote_id,
            transport,
        }
    }

    pub fn remote_id(&self) -> SocketId {
        self.remote_id
    }

    /// Send one payload chunk to the peer.
    pub fn send_data(&self, from: SocketId, payload: Bytes) -> Result<()> {
        self.transport
            .send_packet(Packet::wrte(from, self.remote_id, payload))
    }

    /// Return credit for a fully consumed chunk.
    pub fn send_credit(&self, from: SocketId) -> Result<()> {
        self.transport
            .send_packet(Packet::okay(from, self.remote_id))
    }

    /// Send our final CLSE for this stream.
    pub fn send_close(&self, from: SocketId) -> Result<()> {
        self.transport
            .send_packet(Packet::clse(from, self.remote_id))
    }
}

impl std::fmt::Debug for RemoteSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSocket")
            .field("remote_id", &self.remote_id)
            .field("transport", &self.transport.serial())
            .finish()
    }
}
