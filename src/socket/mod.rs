//! # Socket Layer
//!
//! Local/remote socket pairs: one bidirectional, credit-flow-controlled
//! logical stream multiplexed inside a transport.
//!
//! A [`LocalSocket`] is the endpoint living in this process. Its peer is
//! either a [`RemoteSocket`] shadow (the other half lives across the
//! transport) or another local socket (a purely in-process pair). Credit
//! is strictly per stream: a socket sends one payload chunk, clears its
//! credit flag, and waits for the peer's OKAY before producing more.
//!
//! ## Protocol mapping
//! - `OPEN(remote, 0, "name")`: look up the service, install a fresh
//!   local socket, pair it, answer `OKAY(local, remote)`, then kick its
//!   `ready` path once. Failures answer `CLSE(0, remote)`.
//! - `WRTE(remote, local, payload)`: enqueue into the addressed socket;
//!   the OKAY credit goes back once the payload is fully consumed.
//! - `OKAY(remote, local)`: pair if this is the first OKAY of the
//!   stream, then return credit.
//! - `CLSE(remote, local)`: close; reply with our own CLSE unless the
//!   inbound close is itself a reply (`remote == 0`).

pub mod local;
pub mod registry;
pub mod remote;
pub mod stream;

pub use local::{EnqueueDisposition, LocalSocket, ServiceOutput, ServiceSocket, ServiceVerdict};
pub use registry::{SocketId, SocketRegistry};
pub use remote::RemoteSocket;
pub use stream::{BoxedByteStream, ByteStream};

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::core::packet::{Command, Packet};
use crate::error::{BridgeError, Result};
use crate::service::ServiceEndpoint;
use crate::transport::Transport;
use crate::utils::metrics::global_metrics;

/// The peer half of a logical stream.
#[derive(Clone)]
pub enum PeerLink {
    /// The peer lives across a transport; packets go over the wire.
    Remote(RemoteSocket),
    /// The peer is another local socket in this process.
    Local(SocketId),
}

/// Wire two local sockets directly to each other (no transport). Used
/// for internal services fed by a byte pipe.
pub fn pair_local(a: &Arc<LocalSocket>, b: &Arc<LocalSocket>) {
    a.set_peer(PeerLink::Local(b.id()));
    b.set_peer(PeerLink::Local(a.id()));
}

/// Extract the NUL-terminated UTF-8 service name from an OPEN payload.
fn service_name(payload: &[u8]) -> Option<String> {
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(payload.len());
    std::str::from_utf8(&payload[..end])
        .ok()
        .map(str::to_string)
}

/// Dispatch one stream packet (OPEN/WRTE/OKAY/CLSE) for an online
/// transport.
pub(crate) fn handle_stream_packet(transport: &Arc<Transport>, packet: Packet) -> Result<()> {
    match packet.command {
        Command::Open => handle_open(transport, &packet),
        Command::Wrte => handle_write(transport, packet),
        Command::Okay => handle_okay(transport, &packet),
        Command::Clse => handle_close(transport, &packet),
        _ => Ok(()),
    }
}

fn handle_open(transport: &Arc<Transport>, packet: &Packet) -> Result<()> {
    let remote_id = packet.arg0;
    if remote_id == 0 {
        return Err(BridgeError::protocol("OPEN with reserved stream id 0"));
    }

    let Some(name) = service_name(&packet.payload) else {
        warn!(serial = %transport.serial(), "OPEN payload is not valid UTF-8");
        let _ = transport.send_packet(Packet::clse(0, remote_id));
        return Ok(());
    };
    debug!(serial = %transport.serial(), service = %name, remote_id, "Service open requested");

    let ctx = transport.context().clone();
    let endpoint = match ctx.services.open(&name, transport) {
        Ok(Some(endpoint)) => endpoint,
        Ok(None) => {
            warn!(serial = %transport.serial(), service = %name, "Unknown service");
            global_metrics().service_refused();
            let _ = transport.send_packet(Packet::clse(0, remote_id));
            return Ok(());
        }
        Err(e) => {
            warn!(serial = %transport.serial(), service = %name, error = %e, "Service refused");
            global_metrics().service_refused();
            let _ = transport.send_packet(Packet::clse(0, remote_id));
            return Ok(());
        }
    };

    let max_payload = transport.max_payload();
    let sock = match endpoint {
        ServiceEndpoint::Socket(service) => LocalSocket::install_service(
            &ctx.registry,
            Some(Arc::clone(transport)),
            service,
            max_payload,
        ),
        ServiceEndpoint::Stream(stream) => LocalSocket::install_stream(
            &ctx.registry,
            Some(Arc::clone(transport)),
            stream,
            max_payload,
            ctx.event_loop.clone(),
        ),
    };
    sock.set_peer(PeerLink::Remote(RemoteSocket::new(
        remote_id,
        Arc::clone(transport),
    )));
    transport.send_packet(Packet::okay(sock.id(), remote_id))?;
    // Give the new socket its first turn; sources start producing here.
    sock.ready();
    Ok(())
}

fn handle_write(transport: &Arc<Transport>, packet: Packet) -> Result<()> {
    let local_id = packet.arg1;
    let Some(sock) = transport.context().registry.lookup(local_id) else {
        trace!(serial = %transport.serial(), local_id, "WRTE for unknown socket, dropped");
        return Ok(());
    };
    match sock.enqueue(packet.payload) {
        EnqueueDisposition::Accepted => Ok(()),
        EnqueueDisposition::Blocked => {
            warn!(serial = %transport.serial(), local_id, "Payload dropped: socket saturated");
            Ok(())
        }
        EnqueueDisposition::Closed => {
            sock.close();
            Ok(())
        }
    }
}

fn handle_okay(transport: &Arc<Transport>, packet: &Packet) -> Result<()> {
    let local_id = packet.arg1;
    let Some(sock) = transport.context().registry.lookup(local_id) else {
        trace!(serial = %transport.serial(), local_id, "OKAY for unknown socket, dropped");
        return Ok(());
    };
    // The first OKAY of a locally initiated stream teaches us the
    // remote id; afterwards it is purely a credit return.
    if !sock.has_peer() {
        sock.set_peer(PeerLink::Remote(RemoteSocket::new(
            packet.arg0,
            Arc::clone(transport),
        )));
    }
    sock.ready();
    Ok(())
}

fn handle_close(transport: &Arc<Transport>, packet: &Packet) -> Result<()> {
    let local_id = packet.arg1;
    let Some(sock) = transport.context().registry.lookup(local_id) else {
        trace!(serial = %transport.serial(), local_id, "CLSE for unknown socket, dropped");
        return Ok(());
    };
    if packet.arg0 == 0 {
        // Reply to our own CLSE; do not echo another one back.
        sock.mark_close_sent();
    }
    sock.close();
    Ok(())
}
