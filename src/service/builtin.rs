//! Built-in services.
//!
//! In-process: `sink:<n>` swallows n bytes then closes, `source:<n>`
//! produces n zero bytes then closes. Both exist to exercise flow
//! control end to end.
//!
//! Stream-backed: `reconnect` answers `done` and kicks its transport,
//! `spin` registers an always-pending watcher and ignores it, and
//! `dev:<path>` / `dev-raw:<path>` expose a device node read-write.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::Result;
use crate::event_loop::{EventLoopHandle, IoEvents};
use crate::socket::{BoxedByteStream, ServiceOutput, ServiceSocket, ServiceVerdict};
use crate::transport::Transport;

/// Swallows a byte budget, then closes the stream.
pub struct SinkService {
    bytes_left: u64,
}

impl SinkService {
    pub fn new(byte_count: u64) -> Self {
        debug!(byte_count, "Creating sink service");
        Self {
            bytes_left: byte_count,
        }
    }
}

impl ServiceSocket for SinkService {
    fn on_payload(&mut self, data: &[u8]) -> ServiceVerdict {
        if self.bytes_left <= data.len() as u64 {
            // Budget reached; this chunk is the last one.
            return ServiceVerdict::Close;
        }
        self.bytes_left -= data.len() as u64;
        ServiceVerdict::Continue
    }

    fn on_ready(&mut self, _max_chunk: usize) -> ServiceOutput {
        ServiceOutput::Idle
    }
}

/// Produces a byte budget of zeroes, then closes the stream.
pub struct SourceService {
    bytes_left: u64,
}

impl SourceService {
    pub fn new(byte_count: u64) -> Self {
        debug!(byte_count, "Creating source service");
        Self {
            bytes_left: byte_count,
        }
    }
}

impl ServiceSocket for SourceService {
    fn on_payload(&mut self, _data: &[u8]) -> ServiceVerdict {
        // A source has no inbound side; payloads are ignored.
        ServiceVerdict::Continue
    }

    fn on_ready(&mut self, max_chunk: usize) -> ServiceOutput {
        let len = self.bytes_left.min(max_chunk as u64) as usize;
        if len == 0 {
            return ServiceOutput::Close;
        }
        self.bytes_left -= len as u64;
        ServiceOutput::Data(Bytes::from(vec![0u8; len]))
    }
}

/// Resolve in-process services.
pub(crate) fn service_to_socket(name: &str) -> Option<Box<dyn ServiceSocket>> {
    if let Some(rest) = name.strip_prefix("sink:") {
        let byte_count = rest.parse::<u64>().ok()?;
        return Some(Box::new(SinkService::new(byte_count)));
    }
    if let Some(rest) = name.strip_prefix("source:") {
        let byte_count = rest.parse::<u64>().ok()?;
        return Some(Box::new(SourceService::new(byte_count)));
    }
    None
}

/// Resolve built-in stream-backed services.
pub(crate) fn service_to_stream(
    name: &str,
    transport: &Arc<Transport>,
    event_loop: &EventLoopHandle,
) -> Result<Option<BoxedByteStream>> {
    if name == "reconnect" {
        return Ok(Some(reconnect_service(transport, event_loop)));
    }
    if name == "spin" {
        return Ok(Some(spin_service(event_loop)));
    }
    if let Some(path) = name.strip_prefix("dev:") {
        return open_device_node(path).map(Some);
    }
    if let Some(path) = name.strip_prefix("dev-raw:") {
        return open_device_node(path).map(Some);
    }
    Ok(None)
}

/// Answer `done`, then kick the transport from the event loop.
fn reconnect_service(transport: &Arc<Transport>, event_loop: &EventLoopHandle) -> BoxedByteStream {
    let (mut service_half, socket_half) = tokio::io::duplex(64);
    let weak = Arc::downgrade(transport);
    let handle = event_loop.clone();
    tokio::spawn(async move {
        let _ = service_half.write_all(b"done").await;
        handle.post(move || {
            if let Some(t) = weak.upgrade() {
                info!(serial = %t.serial(), "Reconnect requested");
                t.kick();
            }
        });
        // Hold the pipe open; the kick tears the stream down.
        let mut scratch = [0u8; 16];
        let _ = service_half.read(&mut scratch).await;
    });
    Box::new(socket_half)
}

/// Register an always-pending watcher and ignore it, then sit on the
/// stream until the peer goes away.
fn spin_service(event_loop: &EventLoopHandle) -> BoxedByteStream {
    let (mut service_half, socket_half) = tokio::io::duplex(256);
    let _ignored = event_loop.watch(IoEvents::READ, Box::new(|_| {}));
    tokio::spawn(async move {
        let _ = service_half.write_all(b"spinning\n").await;
        let mut scratch = [0u8; 64];
        loop {
            match service_half.read(&mut scratch).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });
    Box::new(socket_half)
}

/// Open a device node read-write and hand it to the stream socket.
fn open_device_node(path: &str) -> Result<BoxedByteStream> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)?;
    debug!(path, "Device node opened");
    Ok(Box::new(tokio::fs::File::from_std(file)))
}
